//! The server-side observe registry (RFC 7641): who watches which URL, and
//! notification emission with periodic CON liveness probes.

use log::{debug, warn};
use net::ip::SocketAddr;

use crate::config::{OBSERVE_REFRESH_INTERVAL, REST_MAX_CHUNK_SIZE, TOKEN_LEN, Ticks};
use crate::msg::{codes, Kind, Message};
use crate::rest::flags;
use crate::{Context, Transport};

pub(crate) struct Observer {
	pub url: String,
	pub peer: SocketAddr,
	pub token: [u8; TOKEN_LEN],
	pub token_len: u8,
	/// MID of the latest notification, for RST correlation.
	pub last_mid: u16,
	/// The monotonically increasing Observe option value.
	pub obs_counter: u32,
	/// Notifications since the last CON liveness probe.
	pub refresh: u32,
}

impl Observer {
	fn token(&self) -> &[u8] {
		&self.token[..self.token_len as usize]
	}
}

impl<T: Transport> Context<T> {
	fn add_observer(&mut self, peer: SocketAddr, token: &[u8], url: &str) -> Option<collections::pool::Handle> {
		// An existing relationship for the same URL is replaced.
		self.remove_observer_by_uri(peer, url);

		let mut o = Observer {
			url: url.to_string(),
			peer,
			token: [0; TOKEN_LEN],
			token_len: token.len().min(TOKEN_LEN) as u8,
			last_mid: 0,
			obs_counter: 0,
			refresh: 0,
		};
		o.token[..o.token_len as usize].copy_from_slice(&token[..o.token_len as usize]);

		match self.observers.alloc(o) {
			Ok(h) => {
				debug!("observe: added observer for /{url}");
				Some(h)
			}
			Err(_) => None,
		}
	}

	/// Drops every relationship held by `peer`; used when the peer stops
	/// acknowledging or resets.
	pub(crate) fn remove_observers_by_client(&mut self, peer: SocketAddr) -> usize {
		self.observers.retain(|o| o.peer != peer)
	}

	fn remove_observer_by_token(&mut self, peer: SocketAddr, token: &[u8]) -> usize {
		self.observers.retain(|o| !(o.peer == peer && o.token() == token))
	}

	fn remove_observer_by_uri(&mut self, peer: SocketAddr, url: &str) -> usize {
		self.observers.retain(|o| !(o.peer == peer && o.url == url))
	}

	/// A RST for a notification MID cancels that observer.
	pub(crate) fn remove_observer_by_mid(&mut self, peer: SocketAddr, mid: u16) -> usize {
		self.observers.retain(|o| !(o.peer == peer && o.last_mid == mid))
	}

	/// Handles (de)registration on a GET of an observable resource. Runs
	/// after the resource handler, on successful responses only.
	pub(crate) fn observe_handler(&mut self, request: &Message, response: &mut Message, from: SocketAddr) {
		if request.code != codes::GET || response.code >= codes::BAD_REQUEST_4_00 {
			return;
		}

		let Ok(path) = core::str::from_utf8(request.uri_path()) else { return };

		match request.observe() {
			Some(0) => match self.add_observer(from, request.token(), path) {
				Some(h) => {
					let o = self.observers.get_mut(h).expect("freshly added observer");
					response.set_observe(o.obs_counter);
					o.obs_counter += 1;
				}
				None => {
					response.code = codes::SERVICE_UNAVAILABLE_5_03;
					response.set_payload(b"TooManyObservers");
				}
			},
			Some(1) => {
				self.remove_observer_by_token(from, request.token());
			}
			_ => {}
		}
	}

	/// Notifies every observer of `url` (or of a sub-resource path under
	/// it). Each notification is a fresh transaction; failure to allocate
	/// one skips this pass without evicting the observer.
	pub fn notify(&mut self, url: &str, subpath: Option<&str>, now: Ticks) {
		let url = url.trim_start_matches('/');

		let full = match subpath {
			Some(s) => format!("{url}/{}", s.trim_start_matches('/')),
			None => url.to_string(),
		};

		let Some(res_idx) = self.resources.find_by_url(url) else {
			warn!("observe: notify for unregistered /{url}");
			return;
		};

		let sub_ok = self.resources.resources[res_idx].flags & flags::HAS_SUB_RESOURCES != 0;

		// Collect matching observers first; emission reshapes the pools.
		let matching: Vec<_> = self
			.observers
			.iter()
			.filter(|(_, o)| {
				o.url == full || (sub_ok && o.url.len() > full.len() && o.url.as_bytes()[full.len()] == b'/' && o.url.starts_with(&full))
			})
			.map(|(h, _)| h)
			.collect();

		// A synthetic GET drives the resource handler for the payload.
		let mut request = Message::new(Kind::Con, codes::GET, 0);
		request.set_uri_path(&full);

		for h in matching {
			let Some(o) = self.observers.get(h) else { continue };
			let (peer, token, token_len) = (o.peer, o.token, o.token_len);

			let mid = self.next_mid();

			let Some(th) = self.new_transaction(mid, peer) else {
				debug!("observe: no free transaction, skipping this pass");
				return;
			};

			let o = self.observers.get_mut(h).expect("observer collected above");

			// Every OBSERVE_REFRESH_INTERVAL-th notification goes out
			// confirmable to verify the observer is still there.
			let kind = if o.refresh >= OBSERVE_REFRESH_INTERVAL {
				o.refresh = 0;
				Kind::Con
			} else {
				Kind::Non
			};
			o.refresh += 1;
			o.last_mid = mid;

			let counter = o.obs_counter;
			o.obs_counter += 1;

			let mut notification = Message::new(kind, codes::CONTENT_2_05, mid);
			notification.set_token(&token[..token_len as usize]);

			let mut resources = core::mem::take(&mut self.resources);
			{
				let resource = &mut resources.resources[res_idx];
				let mut buffer = vec![0u8; REST_MAX_CHUNK_SIZE];
				let mut offset: i32 = 0;

				if let Some(handler) = resource.handler_for(codes::GET) {
					handler(&request, &mut notification, &mut buffer, REST_MAX_CHUNK_SIZE as u16, &mut offset);
				}
			}
			self.resources = resources;

			if notification.code < codes::BAD_REQUEST_4_00 {
				notification.set_observe(counter);
			}

			if self.store_transaction(th, &notification).is_err() {
				warn!("observe: notification did not fit, skipping");
				self.clear_transaction(th);
				continue;
			}

			self.send_transaction(th, now);
		}
	}

	/// Fires periodic observable resources whose interval has elapsed.
	pub fn poll_periodic(&mut self, now: Ticks) {
		let due: Vec<&'static str> = self
			.resources
			.resources
			.iter_mut()
			.filter(|r| r.flags & flags::IS_PERIODIC != 0)
			.filter_map(|r| {
				let period = r.period?;

				if now >= r.next_fire {
					r.next_fire = now + period;
					Some(r.url)
				} else {
					None
				}
			})
			.collect();

		for url in due {
			self.notify(url, None, now);
		}
	}
}
