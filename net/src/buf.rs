//! The shared packet-buffer pool.
//!
//! Buffers are fixed MTU-sized regions handed out by reference-counted
//! handles. A buffer belongs to whichever subsystem holds its only handle;
//! the TCP retransmit path is the one consumer that keeps a second reference
//! across dispatches.

use bilge::prelude::*;

use crate::config::{MTU, N_BUFS};
use crate::tcp::ConnId;

/// Completion codes recorded in a buffer for application notification.
pub mod status {
	pub const OK: i32 = 0;
	pub const EAGAIN: i32 = -11;
	pub const ECONNABORTED: i32 = -103;
	pub const ENOBUFS: i32 = -105;
	pub const ENOTCONN: i32 = -107;
	pub const ETIMEDOUT: i32 = -110;
}

/// Per-dispatch event flags shared between the stack and the application.
#[bitsize(8)]
#[derive(Clone, Copy, FromBits, PartialEq, DebugBits)]
pub struct Flags {
	pub newdata: bool,
	pub ackdata: bool,
	pub connected: bool,
	pub close: bool,
	pub abort: bool,
	pub timedout: bool,
	pub poll: bool,
	pub rexmit: bool,
}

impl Flags {
	pub fn none() -> Self {
		Self::from(0u8)
	}
}

/// A handle into the buffer pool.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Buf(usize);

pub(crate) struct Packet {
	refs: u8,
	pub data: [u8; MTU],
	/// Total length of the frame, starting at the IP header.
	pub len: usize,
	/// Offset of the transport payload within `data`.
	pub app_off: usize,
	/// Length of the transport payload.
	pub app_len: usize,
	pub conn: Option<ConnId>,
	pub sent_status: i32,
}

impl Packet {
	fn clear(&mut self) {
		self.len = 0;
		self.app_off = 0;
		self.app_len = 0;
		self.conn = None;
		self.sent_status = status::OK;
	}

	/// The transport payload.
	pub fn app_data(&self) -> &[u8] {
		&self.data[self.app_off..self.app_off + self.app_len]
	}
}

pub(crate) struct Pool {
	slots: Vec<Packet>,
}

impl Default for Pool {
	fn default() -> Self {
		let slots = (0..N_BUFS)
			.map(|_| Packet {
				refs: 0,
				data: [0; MTU],
				len: 0,
				app_off: 0,
				app_len: 0,
				conn: None,
				sent_status: status::OK,
			})
			.collect();

		Self { slots }
	}
}

impl Pool {
	/// Takes a free buffer, or `None` when the pool is exhausted. The caller
	/// surfaces `ENOBUFS` and must not queue.
	pub fn alloc(&mut self) -> Option<Buf> {
		let idx = self.slots.iter().position(|p| p.refs == 0)?;

		self.slots[idx].refs = 1;
		self.slots[idx].clear();

		Some(Buf(idx))
	}

	/// Adds a reference, extending the buffer's lifetime past the current
	/// dispatch.
	pub fn incref(&mut self, b: Buf) {
		self.slots[b.0].refs += 1;
	}

	/// Drops a reference; the buffer returns to the pool at zero.
	pub fn unref(&mut self, b: Buf) {
		let p = &mut self.slots[b.0];

		debug_assert!(p.refs > 0);
		p.refs = p.refs.saturating_sub(1);
	}

	pub fn get(&self, b: Buf) -> &Packet {
		&self.slots[b.0]
	}

	pub fn get_mut(&mut self, b: Buf) -> &mut Packet {
		&mut self.slots[b.0]
	}

	#[cfg(test)]
	pub fn live(&self) -> usize {
		self.slots.iter().filter(|p| p.refs > 0).count()
	}
}
