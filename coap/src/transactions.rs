//! The reliable-transport layer: a fixed pool of open transactions, CON
//! retransmission with exponential backoff and jitter, and MID correlation.

use bilge::prelude::u2;
use log::{debug, trace};
use net::ip::SocketAddr;
use rand::Rng;

use crate::config::{BACKOFF_JITTER, MAX_PACKET_SIZE, MAX_RETRANSMIT, RESPONSE_TIMEOUT, Ticks};
use crate::msg::{Kind, Message};
use crate::{Context, Transport};

pub use collections::pool::Handle;

/// Invoked once with the correlated response, or with `None` when the
/// transaction ran out of retransmissions.
pub type ResponseHandler = Box<dyn FnMut(Option<&Message>)>;

pub(crate) struct Transaction {
	pub mid: u16,
	pub retrans: u8,
	/// Current retransmission interval; doubles per miss.
	pub interval: Ticks,
	/// Absolute retransmission time; `None` while no timer is armed.
	pub deadline: Option<Ticks>,
	pub peer: SocketAddr,
	pub packet: Box<[u8; MAX_PACKET_SIZE]>,
	pub packet_len: usize,
	pub callback: Option<ResponseHandler>,
}

impl Transaction {
	fn kind(&self) -> Kind {
		Kind::from(u2::new(self.packet[0] >> 4 & 0x3))
	}
}

impl<T: Transport> Context<T> {
	/// Reserves a transaction slot for `mid`, or `None` when the pool is
	/// exhausted (the caller answers 5.03).
	pub(crate) fn new_transaction(&mut self, mid: u16, peer: SocketAddr) -> Option<Handle> {
		let t = Transaction {
			mid,
			retrans: 0,
			interval: 0,
			deadline: None,
			peer,
			packet: Box::new([0; MAX_PACKET_SIZE]),
			packet_len: 0,
			callback: None,
		};

		match self.transactions.alloc(t) {
			Ok(h) => Some(h),
			Err(_) => {
				debug!("coap: transaction pool exhausted");
				None
			}
		}
	}

	pub(crate) fn transaction_by_mid(&self, mid: u16) -> Option<Handle> {
		self.transactions.find(|t| t.mid == mid)
	}

	/// Serializes `msg` into the transaction's private buffer.
	pub(crate) fn store_transaction(&mut self, h: Handle, msg: &Message) -> Result<(), ()> {
		let t = self.transactions.get_mut(h).ok_or(())?;
		t.packet_len = msg.serialize(&mut t.packet[..])?;
		Ok(())
	}

	/// Emits the stored packet. A CON message arms the retransmit timer;
	/// once the retransmission limit is reached, the response handler fires
	/// once with no response and the slot is reclaimed.
	pub(crate) fn send_transaction(&mut self, h: Handle, now: Ticks) {
		let Some(t) = self.transactions.get_mut(h) else { return };

		let mid = t.mid;
		let peer = t.peer;
		let con = t.kind() == Kind::Con;

		if con && t.retrans >= MAX_RETRANSMIT {
			trace!("coap: transaction {mid} timed out");

			let mut callback = t.callback.take();
			self.transactions.free(h);

			// Observe relationships towards an unresponsive peer are void.
			self.remove_observers_by_client(peer);
			self.registration_timeout(peer, mid, now);

			if let Some(cb) = &mut callback {
				cb(None);
			}

			return;
		}

		let _ = self.transport.send(peer, &t.packet[..t.packet_len]);

		let t = self.transactions.get_mut(h).expect("slot still live after send");

		if con {
			if t.retrans == 0 {
				t.interval = RESPONSE_TIMEOUT + rand::thread_rng().gen_range(0..BACKOFF_JITTER);
			} else {
				t.interval <<= 1;
			}

			trace!("coap: transaction {mid} armed for {} ms", t.interval);
			t.deadline = Some(now + t.interval);
		} else {
			// Unreliable messages are fire-and-forget.
			self.transactions.free(h);
		}
	}

	pub(crate) fn clear_transaction(&mut self, h: Handle) {
		self.transactions.free(h);
	}

	/// Fires due retransmissions. Call whenever [`Self::next_deadline`]
	/// elapses.
	pub fn check_transactions(&mut self, now: Ticks) {
		loop {
			let due = self.transactions.find(|t| t.deadline.is_some_and(|d| d <= now));

			let Some(h) = due else { break };

			let t = self.transactions.get_mut(h).expect("found handle is live");
			t.deadline = None;
			t.retrans += 1;
			debug!("coap: retransmitting {} ({})", t.mid, t.retrans);

			self.send_transaction(h, now);
		}
	}

	/// The earliest armed retransmission time, for the timer wrapper.
	pub fn next_deadline(&self) -> Option<Ticks> {
		self.transactions.iter().filter_map(|(_, t)| t.deadline).min()
	}
}

#[cfg(test)]
mod tests {
	use core::cell::RefCell;
	use core::net::{IpAddr, Ipv4Addr};
	use std::rc::Rc;

	use super::*;
	use crate::msg::codes;

	fn peer() -> SocketAddr {
		SocketAddr { addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)), port: 5683 }
	}

	#[derive(Clone, Default)]
	struct MockTransport {
		sent: Rc<RefCell<Vec<(SocketAddr, Vec<u8>)>>>,
	}

	impl Transport for MockTransport {
		fn send(&mut self, to: SocketAddr, data: &[u8]) -> Result<(), ()> {
			self.sent.borrow_mut().push((to, data.to_vec()));
			Ok(())
		}
	}

	fn context() -> (Context<MockTransport>, Rc<RefCell<Vec<(SocketAddr, Vec<u8>)>>>) {
		let t = MockTransport::default();
		let sent = t.sent.clone();
		(Context::new(t), sent)
	}

	#[test]
	fn con_backoff_doubles_until_timeout() {
		let (mut ctx, sent) = context();

		let fired: Rc<RefCell<Vec<bool>>> = Rc::default();
		let f = fired.clone();

		let msg = Message::new(Kind::Con, codes::GET, 0x100);
		let h = ctx.new_transaction(0x100, peer()).unwrap();
		ctx.store_transaction(h, &msg).unwrap();
		ctx.transactions.get_mut(h).unwrap().callback = Some(Box::new(move |r| f.borrow_mut().push(r.is_some())));

		let mut now: Ticks = 0;
		ctx.send_transaction(h, now);
		assert_eq!(sent.borrow().len(), 1);

		// The initial interval lies in [TIMEOUT, TIMEOUT * 1.5).
		let initial = ctx.transactions.get(h).unwrap().interval;
		assert!(initial >= RESPONSE_TIMEOUT && initial < RESPONSE_TIMEOUT + BACKOFF_JITTER);

		let mut intervals = vec![initial];

		// Drive the clock through every retransmission.
		for _ in 0..MAX_RETRANSMIT {
			now = ctx.next_deadline().unwrap();
			ctx.check_transactions(now);

			if let Some(t) = ctx.transactions.get(h) {
				intervals.push(t.interval);
			}
		}

		// The initial send plus three retransmissions; the fourth expiry is
		// the timeout itself and transmits nothing.
		assert_eq!(sent.borrow().len(), MAX_RETRANSMIT as usize);

		// Each interval doubles the previous one.
		for pair in intervals.windows(2) {
			assert_eq!(pair[1], pair[0] * 2);
		}

		// The handler observed the timeout exactly once, with no response.
		assert_eq!(&*fired.borrow(), &[false]);
		assert!(ctx.transactions.is_empty());
	}

	#[test]
	fn non_is_sent_once_and_freed() {
		let (mut ctx, sent) = context();

		let msg = Message::new(Kind::Non, codes::CONTENT_2_05, 0x200);
		let h = ctx.new_transaction(0x200, peer()).unwrap();
		ctx.store_transaction(h, &msg).unwrap();
		ctx.send_transaction(h, 0);

		assert_eq!(sent.borrow().len(), 1);
		assert!(ctx.transactions.is_empty());
		assert_eq!(ctx.next_deadline(), None);
	}

	#[test]
	fn pool_exhaustion_returns_none() {
		use crate::config::MAX_OPEN_TRANSACTIONS;

		let (mut ctx, _) = context();

		for i in 0..MAX_OPEN_TRANSACTIONS as u16 {
			ctx.new_transaction(i, peer()).unwrap();
		}

		assert!(ctx.new_transaction(99, peer()).is_none());
	}

	#[test]
	fn ack_clears_by_mid() {
		let (mut ctx, _) = context();

		let msg = Message::new(Kind::Con, codes::GET, 0x300);
		let h = ctx.new_transaction(0x300, peer()).unwrap();
		ctx.store_transaction(h, &msg).unwrap();
		ctx.send_transaction(h, 0);

		let found = ctx.transaction_by_mid(0x300).unwrap();
		ctx.clear_transaction(found);

		assert!(ctx.transactions.is_empty());
		assert_eq!(ctx.transaction_by_mid(0x300), None);
	}
}
