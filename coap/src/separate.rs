//! Separate responses: a resource that cannot answer piggybacked accepts
//! with an empty ACK and resumes later under a fresh transaction.

use log::debug;
use net::ip::SocketAddr;

use crate::config::{MAX_BLOCK_SIZE, TOKEN_LEN, Ticks};
use crate::msg::{codes, Kind, Message};
use crate::{Context, Transport};

/// Everything needed to produce the deferred response.
pub struct Separate {
	pub peer: SocketAddr,
	/// CON requests get a CON response; NON requests a NON one.
	pub kind: Kind,
	token: [u8; TOKEN_LEN],
	token_len: u8,
	pub block1_num: u32,
	pub block1_size: u16,
	pub block2_num: u32,
	pub block2_size: u16,
}

impl Separate {
	pub fn token(&self) -> &[u8] {
		&self.token[..self.token_len as usize]
	}
}

/// Accepts a request for deferred handling. The engine emits the empty ACK
/// and suppresses the piggybacked response.
pub fn accept(request: &Message, response: &mut Message) -> Option<Separate> {
	let peer = request.src?;

	let mut store = Separate {
		peer,
		kind: if request.kind == Kind::Con { Kind::Con } else { Kind::Non },
		token: [0; TOKEN_LEN],
		token_len: request.token().len() as u8,
		block1_num: 0,
		block1_size: 0,
		block2_num: 0,
		block2_size: MAX_BLOCK_SIZE,
	};

	store.token[..request.token().len()].copy_from_slice(request.token());

	if let Some(b) = request.block1() {
		store.block1_num = b.num;
		store.block1_size = b.size;
	}

	if let Some(b) = request.block2() {
		store.block2_num = b.num;
		store.block2_size = b.size.min(MAX_BLOCK_SIZE);
	}

	// Signal the engine to skip the automatic response.
	response.code = codes::MANUAL_RESPONSE;

	Some(store)
}

/// Rejects a request that would need a separate response the server cannot
/// store right now.
pub fn reject(response: &mut Message) {
	response.code = codes::SERVICE_UNAVAILABLE_5_03;
	response.set_payload(b"AlreadyInUse");
}

impl<T: Transport> Context<T> {
	/// Emits the deferred response under a fresh MID, reattaching the
	/// stored token.
	pub fn separate_resume(&mut self, store: &Separate, code: u8, payload: &[u8], now: Ticks) -> Result<(), ()> {
		let mid = self.next_mid();

		let mut response = Message::new(store.kind, code, mid);
		response.set_token(store.token());

		if store.block1_size > 0 {
			response.set_block1(store.block1_num, false, store.block1_size)?;
		}

		if !payload.is_empty() {
			response.set_payload(payload);
		}

		let th = self.new_transaction(mid, store.peer).ok_or_else(|| debug!("separate: no free transaction"))?;

		self.store_transaction(th, &response)?;
		self.send_transaction(th, now);

		Ok(())
	}
}
