//! Client-side observation: registration, notification classification, and
//! stale-notification rejection.

use log::{debug, info};
use net::ip::SocketAddr;
use rand::RngCore;

use crate::config::{MAX_PACKET_SIZE, TOKEN_LEN, Ticks};
use crate::msg::{codes, Kind, Message};
use crate::{Context, Transport};

/// What a received message means for an observation relationship.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Notification {
	/// The registration was accepted; this is the initial representation.
	ObserveOk,
	/// A subsequent notification.
	NotificationOk,
	/// The server answered the registration without an Observe option.
	ObserveNotSupported,
	/// The server answered with an error code.
	ErrorResponseCode,
	/// The registration ran out of retransmissions.
	NoReplyFromServer,
}

pub type NotificationCallback = Box<dyn FnMut(Option<&Message>, Notification)>;

pub(crate) struct Observee {
	pub url: String,
	pub peer: SocketAddr,
	pub token: [u8; TOKEN_LEN],
	pub token_len: u8,
	pub registered: bool,
	/// MID of the registration request, for response correlation.
	pub reg_mid: u16,
	/// The last delivered Observe value; repeats are stale duplicates.
	pub last_observe: Option<u32>,
	pub cb: NotificationCallback,
}

impl Observee {
	fn token(&self) -> &[u8] {
		&self.token[..self.token_len as usize]
	}
}

fn classify(response: Option<&Message>, first: bool) -> Notification {
	let Some(response) = response else {
		return Notification::NoReplyFromServer;
	};

	if response.code >= codes::BAD_REQUEST_4_00 {
		return Notification::ErrorResponseCode;
	}

	if first && response.observe().is_none() {
		return Notification::ObserveNotSupported;
	}

	if first {
		Notification::ObserveOk
	} else {
		Notification::NotificationOk
	}
}

impl<T: Transport> Context<T> {
	/// Registers for notifications of `url` at `peer`: a CON GET with
	/// Observe=0 under a fresh token.
	pub fn observe_register(&mut self, peer: SocketAddr, url: &str, cb: NotificationCallback, now: Ticks) -> Result<(), ()> {
		// Only one relationship per (peer, url).
		self.observees.retain(|o| !(o.peer == peer && o.url == url));

		let mut token = [0u8; TOKEN_LEN];
		rand::thread_rng().fill_bytes(&mut token);

		let mid = self.next_mid();

		let mut request = Message::new(Kind::Con, codes::GET, mid);
		request.set_token(&token);
		request.set_observe(0);
		request.set_uri_path(url);

		let th = self.new_transaction(mid, peer).ok_or(())?;

		if self.store_transaction(th, &request).is_err() {
			self.clear_transaction(th);
			return Err(());
		}

		let observee = Observee {
			url: url.trim_start_matches('/').to_string(),
			peer,
			token,
			token_len: TOKEN_LEN as u8,
			registered: false,
			reg_mid: mid,
			last_observe: None,
			cb,
		};

		if self.observees.alloc(observee).is_err() {
			debug!("observe: no free observee slots");
			self.clear_transaction(th);
			return Err(());
		}

		self.send_transaction(th, now);

		Ok(())
	}

	/// Drops the relationship and tells the server with Observe=1.
	pub fn observe_stop(&mut self, peer: SocketAddr, url: &str, now: Ticks) {
		let url = url.trim_start_matches('/');

		let Some(h) = self.observees.find(|o| o.peer == peer && o.url == url) else {
			return;
		};

		let o = self.observees.free(h).expect("found handle is live");

		let mid = self.next_mid();

		let mut request = Message::new(Kind::Non, codes::GET, mid);
		request.set_token(o.token());
		request.set_observe(1);
		request.set_uri_path(url);

		if let Some(th) = self.new_transaction(mid, peer) {
			if self.store_transaction(th, &request).is_ok() {
				self.send_transaction(th, now);
			} else {
				self.clear_transaction(th);
			}
		}
	}

	/// Correlates a response with a pending registration; returns whether
	/// the message belonged to one.
	pub(crate) fn registration_response(&mut self, from: SocketAddr, msg: &Message) -> bool {
		let Some(h) = self.observees.find(|o| !o.registered && o.peer == from && o.reg_mid == msg.mid) else {
			return false;
		};

		let flag = classify(Some(msg), true);

		let o = self.observees.get_mut(h).expect("found handle is live");
		(o.cb)(Some(msg), flag);

		if flag == Notification::ObserveOk {
			let o = self.observees.get_mut(h).expect("still live");
			o.registered = true;
			o.last_observe = msg.observe();
		} else {
			self.observees.free(h);
		}

		true
	}

	/// The registration transaction ran out of retransmissions.
	pub(crate) fn registration_timeout(&mut self, peer: SocketAddr, mid: u16, _now: Ticks) {
		let Some(h) = self.observees.find(|o| !o.registered && o.peer == peer && o.reg_mid == mid) else {
			return;
		};

		let o = self.observees.get_mut(h).expect("found handle is live");
		(o.cb)(None, Notification::NoReplyFromServer);

		self.observees.free(h);
	}

	/// Delivers a CON/NON notification to its observee; duplicates (same
	/// Observe value as last time) are discarded.
	pub(crate) fn handle_notification(&mut self, from: SocketAddr, msg: &Message, _now: Ticks) {
		let Some(h) = self.observees.find(|o| o.peer == from && o.token() == msg.token()) else {
			debug!("observe: notification with unknown token");
			return;
		};

		// Confirmable notifications are acknowledged immediately.
		if msg.kind == Kind::Con {
			let ack = Message::new(Kind::Ack, codes::EMPTY, msg.mid);
			let mut buf = [0u8; MAX_PACKET_SIZE];

			if let Ok(n) = ack.serialize(&mut buf) {
				let _ = self.transport.send(from, &buf[..n]);
			}
		}

		let o = self.observees.get_mut(h).expect("found handle is live");

		if let (Some(last), Some(cur)) = (o.last_observe, msg.observe()) {
			if last == cur {
				info!("observe: stale notification {cur} discarded");
				return;
			}
		}

		o.last_observe = msg.observe().or(o.last_observe);
		o.registered = true;

		let flag = classify(Some(msg), false);
		(o.cb)(Some(msg), flag);
	}
}
