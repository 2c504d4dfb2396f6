//! Blockwise upload assembly (Block1): gathers the body of a chunked PUT
//! or POST into a caller-provided buffer, answering 2.31 Continue until the
//! final block arrives.

use crate::msg::{codes, Message};

/// Feeds one request of a Block1 transfer into `target`. `len` tracks the
/// assembled length across calls. On the final block the response keeps the
/// code the resource chose; intermediate blocks become 2.31 Continue.
pub fn block1_handler(request: &Message, response: &mut Message, target: &mut [u8], len: &mut usize) -> Result<(), ()> {
	let Some(block) = request.block1() else {
		response.code = codes::BAD_REQUEST_4_00;
		response.set_payload(b"NoBlock1Option");
		return Err(());
	};

	let offset = block.offset as usize;

	if offset + request.payload.len() > target.len() {
		response.code = codes::REQUEST_ENTITY_TOO_LARGE_4_13;
		response.set_size1(target.len() as u32);
		return Err(());
	}

	target[offset..offset + request.payload.len()].copy_from_slice(&request.payload);
	*len = (*len).max(offset + request.payload.len());

	// Echo the block option so the client advances.
	let _ = response.set_block1(block.num, block.more, block.size);

	if block.more {
		response.code = codes::CONTINUE_2_31;
	}

	Ok(())
}
