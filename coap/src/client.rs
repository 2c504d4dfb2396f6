//! A resumable client request.
//!
//! The reference stack expressed this as a protothread that blocked until
//! the response arrived; here it is an explicit state machine the caller
//! polls. After `start`, drive the context's receive path and call `poll`
//! until it reports completion; Block2 windows advance automatically.

use core::cell::RefCell;
use std::rc::Rc;

use net::ip::SocketAddr;

use crate::config::{MAX_BLOCK_SIZE, Ticks};
use crate::msg::Message;
use crate::{Context, Transport};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
	Ready,
	Waiting,
	Done,
}

#[derive(Default)]
struct Inbox {
	/// `Some(None)` records a timeout; `Some(Some(_))` a response.
	delivered: Option<Option<Message>>,
}

pub struct Request {
	peer: SocketAddr,
	template: Message,
	state: State,
	inbox: Rc<RefCell<Inbox>>,
	/// Next Block2 number to request.
	block: u32,
	body: Vec<u8>,
	code: Option<u8>,
}

impl Request {
	pub fn new(peer: SocketAddr, template: Message) -> Self {
		Self {
			peer,
			template,
			state: State::Ready,
			inbox: Rc::default(),
			block: 0,
			body: Vec::new(),
			code: None,
		}
	}

	/// Sends the (first) request. The transfer then waits for a response.
	pub fn start<T: Transport>(&mut self, ctx: &mut Context<T>, now: Ticks) -> Result<(), ()> {
		self.send_window(ctx, now)
	}

	fn send_window<T: Transport>(&mut self, ctx: &mut Context<T>, now: Ticks) -> Result<(), ()> {
		let mid = ctx.next_mid();

		let mut msg = self.template.clone();
		msg.mid = mid;

		if self.block > 0 {
			msg.set_block2(self.block, false, MAX_BLOCK_SIZE)?;
		}

		let th = ctx.new_transaction(mid, self.peer).ok_or(())?;

		let inbox = self.inbox.clone();
		ctx.set_transaction_callback(th, Box::new(move |response| {
			inbox.borrow_mut().delivered = Some(response.cloned());
		}));

		ctx.store_transaction(th, &msg)?;
		ctx.send_transaction(th, now);

		self.state = State::Waiting;
		Ok(())
	}

	/// Advances the transfer; returns true once the request has concluded
	/// (successfully or by timeout).
	pub fn poll<T: Transport>(&mut self, ctx: &mut Context<T>, now: Ticks) -> bool {
		if self.state != State::Waiting {
			return self.state == State::Done;
		}

		let Some(delivered) = self.inbox.borrow_mut().delivered.take() else {
			return false;
		};

		match delivered {
			None => {
				// Retransmissions exhausted.
				self.state = State::Done;
				true
			}
			Some(response) => {
				self.code = Some(response.code);
				self.body.extend_from_slice(&response.payload);

				match response.block2() {
					Some(b) if b.more => {
						self.block = b.num + 1;

						if self.send_window(ctx, now).is_err() {
							self.state = State::Done;
						}

						self.state == State::Done
					}
					_ => {
						self.state = State::Done;
						true
					}
				}
			}
		}
	}

	/// The response code and accumulated body, once concluded. `None`
	/// means the server never answered.
	pub fn response(&self) -> Option<(u8, &[u8])> {
		self.code.map(|c| (c, &self.body[..]))
	}
}
