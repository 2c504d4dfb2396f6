//! An RFC 7252 CoAP engine: message codec, reliable transactions, Observe
//! (RFC 7641) on both sides, blockwise transfers, and the REST resource
//! binding.
//!
//! The engine core is driven by two entry points — [`Context::receive`]
//! for datagrams and [`Context::check_transactions`] for time — so it runs
//! under the cooperative loop (see [`Engine`]) and in tests alike. The
//! network below is a [`Transport`] collaborator; DTLS, when present, sits
//! behind the same seam.

use core::mem;
use std::time::{Duration, Instant};

use log::{debug, warn};
use net::ip::SocketAddr;
use stakker::{timer_max, MaxTimerKey, CX};

pub mod block;
pub mod client;
pub mod config;
pub mod dtls;
pub mod msg;
pub mod observe;
pub mod observe_client;
pub mod rest;
pub mod separate;
pub mod transactions;

use collections::pool::Pool;
use config::{MAX_BLOCK_SIZE, MAX_OBSERVEES, MAX_OBSERVERS, MAX_OPEN_TRANSACTIONS, MAX_PACKET_SIZE, REST_MAX_CHUNK_SIZE, Ticks};
use msg::{codes, Kind, Message};
use observe_client::Observee;
use rest::{flags, Registry, Resource};
use transactions::{Handle, ResponseHandler, Transaction};

/// Datagram egress towards the peer; the `context_send` collaborator.
pub trait Transport {
	fn send(&mut self, to: SocketAddr, data: &[u8]) -> Result<(), ()>;
}

/// Content-format number for CoRE link format documents.
const APPLICATION_LINK_FORMAT: u16 = 40;

pub struct Context<T: Transport> {
	pub(crate) transport: T,
	mid: u16,
	pub(crate) transactions: Pool<Transaction, MAX_OPEN_TRANSACTIONS>,
	pub(crate) observers: Pool<observe::Observer, MAX_OBSERVERS>,
	pub(crate) observees: Pool<Observee, MAX_OBSERVEES>,
	pub(crate) resources: Registry,
}

impl<T: Transport> Context<T> {
	pub fn new(transport: T) -> Self {
		Self {
			transport,
			mid: rand::random(),
			transactions: Pool::default(),
			observers: Pool::default(),
			observees: Pool::default(),
			resources: Registry::default(),
		}
	}

	/// The next message ID.
	pub fn next_mid(&mut self) -> u16 {
		self.mid = self.mid.wrapping_add(1);
		self.mid
	}

	/// Registers a resource with the REST engine.
	pub fn activate(&mut self, resource: Resource) {
		self.resources.activate(resource);
	}

	pub(crate) fn set_transaction_callback(&mut self, h: Handle, cb: ResponseHandler) {
		if let Some(t) = self.transactions.get_mut(h) {
			t.callback = Some(cb);
		}
	}

	/// Sends a one-shot request; the handler fires once with the response,
	/// or with `None` when the peer never answers.
	pub fn request(&mut self, peer: SocketAddr, msg: &Message, handler: ResponseHandler, now: Ticks) -> Result<(), ()> {
		let th = self.new_transaction(msg.mid, peer).ok_or(())?;

		self.set_transaction_callback(th, handler);
		self.store_transaction(th, msg)?;
		self.send_transaction(th, now);

		Ok(())
	}

	/// One received datagram, from the UDP demultiplexer or the DTLS layer.
	pub fn receive(&mut self, from: SocketAddr, data: &[u8], now: Ticks) {
		let mut msg = match Message::parse(data) {
			Ok(m) => m,
			Err(code) => {
				debug!("coap: unparseable message from {from}: {code}");

				let mid = if data.len() >= 4 { (data[2] as u16) << 8 | data[3] as u16 } else { 0 };
				return self.reply_bare(from, Kind::Ack, mid, code, error_text(code));
			}
		};

		msg.src = Some(from);

		if msg.is_request() {
			self.handle_request(from, &msg, now);
		} else {
			self.handle_non_request(from, &msg, now);
		}
	}

	fn handle_request(&mut self, from: SocketAddr, request: &Message, now: Ticks) {
		// The response is prepared inside a transaction buffer so a CON
		// response can be retransmitted.
		let Some(th) = self.new_transaction(request.mid, from) else {
			return self.reply_bare(from, Kind::Ack, request.mid, codes::SERVICE_UNAVAILABLE_5_03, "NoFreeTraBuffer");
		};

		// Reliable requests are answered with a piggybacked ACK; NON
		// requests with a NON under a fresh MID.
		let mut response = if request.kind == Kind::Con {
			Message::new(Kind::Ack, codes::CONTENT_2_05, request.mid)
		} else {
			let mid = self.next_mid();
			Message::new(Kind::Non, codes::CONTENT_2_05, mid)
		};

		response.set_token(request.token());

		// The requested Block2 window bounds the handler's chunk.
		let mut block_num = 0;
		let mut block_size = REST_MAX_CHUNK_SIZE as u16;
		let mut block_offset = 0;
		let mut new_offset: i32 = 0;

		if let Some(b) = request.block2() {
			block_num = b.num;
			block_size = b.size.min(REST_MAX_CHUNK_SIZE as u16);
			block_offset = b.offset;
			new_offset = b.offset as i32;
		}

		if let Err((code, text)) = self.dispatch(from, request, &mut response, block_size, &mut new_offset) {
			self.clear_transaction(th);
			return self.reply_bare(from, Kind::Ack, request.mid, code, text);
		}

		// The resource chose a separate response: emit the empty ACK now
		// and let it resume later.
		if response.code == codes::MANUAL_RESPONSE {
			if request.kind == Kind::Con {
				self.reply_bare(from, Kind::Ack, request.mid, codes::EMPTY, "");
			}

			return self.clear_transaction(th);
		}

		// Block1 must be echoed by a resource that consumed it.
		if request.block1().is_some() && response.code < codes::BAD_REQUEST_4_00 && response.block1().is_none() {
			self.clear_transaction(th);
			return self.reply_bare(from, Kind::Ack, request.mid, codes::NOT_IMPLEMENTED_5_01, "NoBlock1Support");
		}

		if request.block2().is_some() {
			if new_offset == block_offset as i32 {
				// The resource is unaware of blockwise transfers; slice its
				// full payload down to the requested window.
				if block_offset as usize >= response.payload.len() {
					response.code = codes::BAD_OPTION_4_02;
					response.payload.clear();
					response.set_payload(b"BlockOutOfScope");
				} else {
					let more = response.payload.len() - block_offset as usize > block_size as usize;
					let _ = response.set_block2(block_num, more, block_size);

					let end = response.payload.len().min(block_offset as usize + block_size as usize);
					response.payload = response.payload[block_offset as usize..end].to_vec();
				}
			} else {
				// A chunkwise resource produced this window itself.
				let more = new_offset != -1 || response.payload.len() > block_size as usize;
				let _ = response.set_block2(block_num, more, block_size);
				response.payload.truncate(block_size as usize);
			}
		} else if new_offset != 0 {
			// The resource asked for blockwise transfer of a large body.
			let _ = response.set_block2(0, new_offset != -1, MAX_BLOCK_SIZE);
			response.payload.truncate(MAX_BLOCK_SIZE as usize);
		}

		if self.store_transaction(th, &response).is_err() {
			warn!("coap: response serialization failed");
			self.clear_transaction(th);
			return self.reply_bare(from, Kind::Ack, request.mid, codes::INTERNAL_SERVER_ERROR_5_00, "");
		}

		self.send_transaction(th, now);
	}

	/// Routes a request to its resource handler. The error carries the
	/// response code and diagnostic text.
	fn dispatch(
		&mut self,
		from: SocketAddr,
		request: &Message,
		response: &mut Message,
		block_size: u16,
		new_offset: &mut i32,
	) -> Result<(), (u8, &'static str)> {
		let path = request.uri_path().to_vec();

		if path == b".well-known/core" {
			if request.code != codes::GET {
				return Err((codes::METHOD_NOT_ALLOWED_4_05, ""));
			}

			return self.well_known(response, block_size, new_offset);
		}

		let Some(idx) = self.resources.find(&path) else {
			return Err((codes::NOT_FOUND_4_04, "NotFound"));
		};

		if !self.resources.resources[idx].allows(request.code) {
			return Err((codes::METHOD_NOT_ALLOWED_4_05, ""));
		}

		let observable = self.resources.resources[idx].flags & flags::IS_OBSERVABLE != 0;

		// The registry is parked aside while a handler runs, so handlers
		// never alias the engine state.
		let mut registry = mem::take(&mut self.resources);
		{
			let resource = &mut registry.resources[idx];
			let mut buffer = vec![0u8; REST_MAX_CHUNK_SIZE];

			if let Some(handler) = resource.handler_for(request.code) {
				handler(request, response, &mut buffer, block_size, new_offset);
			}
		}
		self.resources = registry;

		if observable {
			self.observe_handler(request, response, from);
		}

		Ok(())
	}

	/// `/.well-known/core`: the link-format listing, served chunkwise.
	fn well_known(&mut self, response: &mut Message, block_size: u16, offset: &mut i32) -> Result<(), (u8, &'static str)> {
		let link = self.resources.link_format();
		let off = (*offset).max(0) as usize;

		if off > link.len() {
			return Err((codes::BAD_OPTION_4_02, "BlockOutOfScope"));
		}

		let window = &link.as_bytes()[off..link.len().min(off + block_size as usize)];

		response.set_content_format(APPLICATION_LINK_FORMAT);
		response.set_payload(window);

		*offset = if off + window.len() >= link.len() { -1 } else { (off + window.len()) as i32 };

		Ok(())
	}

	fn handle_non_request(&mut self, from: SocketAddr, msg: &Message, now: Ticks) {
		// A CON with the empty code is a CoAP ping; pong with a RST.
		if msg.kind == Kind::Con && msg.code == codes::EMPTY {
			return self.reply_bare(from, Kind::Rst, msg.mid, codes::EMPTY, "");
		}

		if msg.kind == Kind::Rst {
			// The peer rejected a notification.
			self.remove_observer_by_mid(from, msg.mid);
		}

		// Correlate ACKs and RSTs with the open transaction.
		if let Some(th) = self.transaction_by_mid(msg.mid) {
			let mut callback = self.transactions.get_mut(th).and_then(|t| t.callback.take());

			// The slot is reclaimed before the callback runs, since the
			// callback may open a new transaction.
			self.clear_transaction(th);

			let registration = self.registration_response(from, msg);

			if let Some(cb) = &mut callback {
				if !registration {
					cb(Some(msg));
				}
			}
		}

		// Observe notifications arrive as CON or NON with the option set.
		if matches!(msg.kind, Kind::Con | Kind::Non) && msg.observe().is_some() {
			self.handle_notification(from, msg, now);
		}
	}

	/// Emits a small standalone message outside any transaction: error
	/// replies, the ping RST, and empty ACKs.
	fn reply_bare(&mut self, to: SocketAddr, kind: Kind, mid: u16, code: u8, diagnostic: &str) {
		let mut msg = Message::new(kind, code, mid);

		if !diagnostic.is_empty() {
			msg.set_payload(diagnostic.as_bytes());
		}

		let mut buf = [0u8; MAX_PACKET_SIZE];

		match msg.serialize(&mut buf) {
			Ok(n) => {
				let _ = self.transport.send(to, &buf[..n]);
			}
			Err(()) => warn!("coap: reply serialization failed"),
		}
	}
}

fn error_text(code: u8) -> &'static str {
	match code {
		codes::BAD_REQUEST_4_00 => "BadRequest",
		codes::BAD_OPTION_4_02 => "UnsupportedCriticalOption",
		codes::PROXYING_NOT_SUPPORTED_5_05 => "NoProxySupport",
		_ => "",
	}
}

/// The stakker actor wrapper: owns a [`Context`] and keeps one timer armed
/// at the earliest retransmission deadline.
pub struct Engine<T: Transport + 'static> {
	ctx: Context<T>,
	epoch: Instant,
	timer: MaxTimerKey,
}

impl<T: Transport + 'static> Engine<T> {
	pub fn init(cx: CX![], transport: T) -> Option<Self> {
		Some(Self {
			ctx: Context::new(transport),
			epoch: cx.now(),
			timer: MaxTimerKey::default(),
		})
	}

	fn now(&self, cx: &mut stakker::Cx<'_, Self>) -> Ticks {
		(cx.now() - self.epoch).as_millis() as Ticks
	}

	/// Datagram ingress from the transport actor.
	pub fn recv(&mut self, cx: CX![], from: SocketAddr, data: Box<[u8]>) {
		let now = self.now(cx);
		self.ctx.receive(from, &data, now);
		self.arm(cx);
	}

	/// Runs deferred work against the shared context.
	pub fn with(&mut self, cx: CX![], f: Box<dyn FnOnce(&mut Context<T>, Ticks)>) {
		let now = self.now(cx);
		f(&mut self.ctx, now);
		self.arm(cx);
	}

	pub fn tick(&mut self, cx: CX![]) {
		let now = self.now(cx);
		self.ctx.check_transactions(now);
		self.ctx.poll_periodic(now);
		self.arm(cx);
	}

	fn arm(&mut self, cx: CX![]) {
		if let Some(deadline) = self.ctx.next_deadline() {
			let at = self.epoch + Duration::from_millis(deadline);
			timer_max!(&mut self.timer, at, [cx], tick());
		}
	}
}
