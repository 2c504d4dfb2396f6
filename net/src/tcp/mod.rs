//! The TCP connection table and state machine.
//!
//! One segment may be unacknowledged per connection at any time (`len > 0`);
//! the state machine is driven from three edges: segment ingress, the
//! periodic timer, and application sends/polls.

use core::net::IpAddr;

use bilge::prelude::*;
use log::{debug, warn};
use utils::bytes::{self, Cast};
use utils::endian::{u16be, u32be, BigEndian};

use crate::buf::{status, Buf, Flags};
use crate::config::{EPHEMERAL_HI, EPHEMERAL_LO, MAX_RTX, MAX_SYN_RTX, MTU, N_CONNS, N_LISTEN, RTO, TCP_MSS_V4, TCP_MSS_V6, TIME_WAIT_TIMEOUT};
use crate::ip::{self, Protocol};
use crate::{Link, Stack};


pub(crate) const FIN: u8 = 0x01;
pub(crate) const SYN: u8 = 0x02;
pub(crate) const RST: u8 = 0x04;
pub(crate) const PSH: u8 = 0x08;
pub(crate) const ACK: u8 = 0x10;
pub(crate) const URG: u8 = 0x20;
/// The bits that identify a segment's role.
pub(crate) const CTL: u8 = 0x3f;

const OPT_END: u8 = 0;
const OPT_NOOP: u8 = 1;
const OPT_MSS: u8 = 2;
const OPT_MSS_LEN: u8 = 4;

const HLEN: usize = 20;

/// The control word: data offset, reserved bits, and flags.
#[bitsize(16)]
#[derive(FromBits, Clone, Copy)]
pub(crate) struct Control {
	/// No more data from sender.
	fin: bool,
	/// Synchronize sequence numbers.
	syn: bool,
	/// Reset the connection.
	rst: bool,
	/// Push function.
	psh: bool,
	/// Acknowledgment field is significant.
	ack: bool,
	/// Urgent pointer field is significant.
	urg: bool,
	/// ECN-Echo.
	ece: bool,
	/// Congestion Window Reduced.
	cwr: bool,
	reserved: u4,
	/// The number of 32-bit words in the TCP header.
	off: u4,
}

#[derive(Cast)]
#[repr(C)]
pub(crate) struct Header {
	/// The source port number.
	src: u16be,
	/// The destination port number.
	dst: u16be,
	/// The sequence number of the first data octet in this segment (or the
	/// ISN when SYN is set).
	seq: u32be,
	/// When ACK is set, the next sequence number the sender expects.
	ack: u32be,
	/// The control bits and header length.
	ctl: BigEndian<Control>,
	/// The receive window of the sender.
	wnd: u16be,
	/// The checksum over the pseudo-header, header, and text.
	csm: [u8; 2],
	/// The urgent pointer; only meaningful with the URG control bit.
	urg: u16be,
}

/// The connection states of RFC 793 that this stack implements. CLOSE_WAIT
/// is absent: a peer FIN forces the application to close, so connections go
/// straight to LAST_ACK.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum State {
	#[default]
	Closed,
	SynSent,
	SynRcvd,
	Established,
	FinWait1,
	FinWait2,
	Closing,
	TimeWait,
	LastAck,
}

/// A slot in the connection table.
#[derive(Default)]
pub struct Conn {
	pub(crate) state: State,
	pub(crate) stopped: bool,
	pub(crate) lport: u16,
	pub(crate) rport: u16,
	pub(crate) raddr: Option<IpAddr>,
	pub(crate) rcv_nxt: u32,
	pub(crate) snd_nxt: u32,
	/// Bytes in flight; 1 accounts for a SYN or FIN.
	pub(crate) len: u16,
	pub(crate) mss: u16,
	pub(crate) initialmss: u16,
	/// Smoothed RTT average, scaled by 8.
	pub(crate) sa: i16,
	/// Smoothed RTT deviation, scaled by 4.
	pub(crate) sv: i16,
	pub(crate) rto: i16,
	/// Countdown to retransmission, or elapsed TIME_WAIT ticks.
	pub(crate) timer: i16,
	pub(crate) nrtx: u8,
	/// The frame held for retransmission.
	pub(crate) buf: Option<Buf>,
}

impl Conn {
	pub fn state(&self) -> State {
		self.state
	}

	pub fn mss(&self) -> u16 {
		self.mss
	}

	pub fn rto(&self) -> i16 {
		self.rto
	}

	/// Whether a segment is unacknowledged.
	pub fn outstanding(&self) -> bool {
		self.len > 0
	}

	pub fn snd_nxt(&self) -> u32 {
		self.snd_nxt
	}

	pub fn rcv_nxt(&self) -> u32 {
		self.rcv_nxt
	}

	fn reset_to_closed(&mut self) {
		// CLOSED slots keep zeroed addressing so a stale 4-tuple can never
		// match them.
		self.state = State::Closed;
		self.stopped = false;
		self.lport = 0;
		self.rport = 0;
		self.raddr = None;
		self.len = 0;
		self.buf = None;
	}
}

/// A handle naming a connection slot.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ConnId(pub(crate) usize);

pub(crate) struct Tcp {
	pub conns: [Conn; N_CONNS],
	pub listenports: [u16; N_LISTEN],
	pub iss: u32,
	pub app: Option<TcpApp>,
}

impl Default for Tcp {
	fn default() -> Self {
		Self {
			conns: core::array::from_fn(|_| Conn::default()),
			listenports: [0; N_LISTEN],
			iss: rand::random(),
			app: None,
		}
	}
}

/// An event delivered to the TCP application.
pub struct TcpEvent<'a> {
	pub conn: ConnId,
	pub flags: Flags,
	/// New data from the peer, when `flags.newdata()` is set.
	pub data: &'a [u8],
}

/// The application's staging area for a response segment.
pub struct TcpReply<'a> {
	out: &'a mut [u8],
	slen: usize,
	close: bool,
	abort: bool,
	stop: bool,
	restart: bool,
}

impl TcpReply<'_> {
	/// Stages `data` for transmission, returning how much fit.
	pub fn send(&mut self, data: &[u8]) -> usize {
		let n = data.len().min(self.out.len());
		self.out[..n].copy_from_slice(&data[..n]);
		self.slen = n;
		n
	}

	/// The raw staging buffer, for applications that build in place.
	pub fn out(&mut self) -> &mut [u8] {
		self.out
	}

	/// Declares how many bytes of [`Self::out`] are to be sent.
	pub fn commit(&mut self, n: usize) {
		self.slen = n.min(self.out.len());
	}

	/// Closes the connection after this dispatch.
	pub fn close(&mut self) {
		self.close = true;
	}

	/// Aborts the connection, resetting the peer.
	pub fn abort(&mut self) {
		self.abort = true;
	}

	/// Stops the inbound flow: no NEWDATA, zero window advertised.
	pub fn stop(&mut self) {
		self.stop = true;
	}

	/// Reopens a stopped flow.
	pub fn restart(&mut self) {
		self.restart = true;
	}
}

pub type TcpApp = Box<dyn FnMut(&TcpEvent, &mut TcpReply)>;

#[derive(Default)]
pub(crate) struct AppResult {
	slen: usize,
	close: bool,
	abort: bool,
}

/// Errors surfaced by [`Stack::tcp_send`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SendError {
	/// A segment is already in flight; retry after it is acknowledged.
	Again,
	/// The connection is closing or closed.
	Aborted,
	/// No such connection, or not yet established.
	NotConnected,
	/// The buffer pool is exhausted.
	NoBufs,
}

/// A parsed segment header, lifted out of the packet buffer so the state
/// machine can borrow connections and buffers independently.
pub(crate) struct Seg {
	src: IpAddr,
	sport: u16,
	dport: u16,
	seq: u32,
	ack: u32,
	flags: u8,
	wnd: u16,
	urg: u16,
	ip_hlen: usize,
	/// Offset of the payload within the frame.
	data_off: usize,
	data_len: usize,
	opts: [u8; 40],
	opts_len: usize,
}

impl Seg {
	/// Parses the TCP MSS option, if present. NOP is skipped, END and a
	/// zero length octet terminate the scan.
	fn mss_option(&self) -> Option<u16> {
		let opts = &self.opts[..self.opts_len];
		let mut c = 0;

		while c < opts.len() {
			match opts[c] {
				OPT_END => break,
				OPT_NOOP => c += 1,
				OPT_MSS if opts.get(c + 1) == Some(&OPT_MSS_LEN) => {
					let hi = *opts.get(c + 2)? as u16;
					let lo = *opts.get(c + 3)? as u16;
					return Some(hi << 8 | lo);
				}
				_ => match opts.get(c + 1) {
					// A zero length octet means the options are malformed.
					Some(0) | None => break,
					Some(&n) => c += n as usize,
				},
			}
		}

		None
	}
}

pub(crate) fn mss_for(addr: IpAddr) -> u16 {
	match addr {
		IpAddr::V4(_) => TCP_MSS_V4,
		IpAddr::V6(_) => TCP_MSS_V6,
	}
}

fn ip_hlen_for(addr: IpAddr) -> usize {
	match addr {
		IpAddr::V4(_) => ip::v4::HLEN,
		IpAddr::V6(_) => ip::v6::HLEN,
	}
}

impl<L: Link> Stack<L> {
	/// Starts accepting connections on `port`.
	pub fn listen(&mut self, port: u16) -> Result<(), ()> {
		let slot = self.tcp.listenports.iter_mut().find(|p| **p == 0).ok_or_else(|| warn!("tcp: no free listen slots"))?;
		*slot = port;
		Ok(())
	}

	/// Stops accepting connections on `port`. Existing connections live on.
	pub fn unlisten(&mut self, port: u16) {
		for p in &mut self.tcp.listenports {
			if *p == port {
				*p = 0;
			}
		}
	}

	/// Installs the application callback for TCP events.
	pub fn set_tcp_app(&mut self, app: TcpApp) {
		self.tcp.app = Some(app);
	}

	pub fn tcp_conn(&self, id: ConnId) -> &Conn {
		&self.tcp.conns[id.0]
	}

	/// Actively opens a connection: allocates a slot and an ephemeral local
	/// port, and emits a SYN carrying our MSS option.
	pub fn connect(&mut self, raddr: IpAddr, rport: u16) -> Option<ConnId> {
		if rport == 0 {
			return None;
		}

		let lport = self.ephemeral_port();
		let cid = self.alloc_conn()?;

		let iss = self.tcp.iss;
		let mss = mss_for(raddr);

		let conn = &mut self.tcp.conns[cid.0];
		conn.state = State::SynSent;
		conn.stopped = false;
		conn.lport = lport;
		conn.rport = rport;
		conn.raddr = Some(raddr);
		conn.snd_nxt = iss;
		conn.rcv_nxt = 0;
		conn.len = 1;
		conn.mss = mss;
		conn.initialmss = mss;
		conn.rto = RTO;
		conn.timer = RTO;
		conn.sa = 0;
		// Initial RTT variance for an active open.
		conn.sv = 16;
		conn.nrtx = 0;
		conn.buf = None;

		let b = self.alloc_or_log()?;
		self.tcp_emit(b, cid, SYN, 0, true);

		Some(cid)
	}

	/// Sends application data on an established connection. At most one
	/// segment may be in flight: while unacknowledged data exists the send
	/// is refused with [`SendError::Again`].
	pub fn tcp_send(&mut self, id: ConnId, data: &[u8]) -> Result<usize, SendError> {
		let conn = &self.tcp.conns[id.0];

		match conn.state {
			State::Closed | State::FinWait1 | State::FinWait2 | State::Closing | State::TimeWait => return Err(SendError::Aborted),
			State::SynSent | State::SynRcvd | State::LastAck => return Err(SendError::NotConnected),
			State::Established => {}
		}

		if conn.outstanding() {
			return Err(SendError::Again);
		}

		let raddr = conn.raddr.expect("established connection has a peer");
		let slen = data.len().min(conn.mss as usize);
		let off = ip_hlen_for(raddr) + HLEN;

		let b = self.alloc_or_log().ok_or(SendError::NoBufs)?;

		{
			let pkt = self.pool.get_mut(b);
			pkt.data[off..off + slen].copy_from_slice(&data[..slen]);
			pkt.app_off = off;
			pkt.app_len = slen;
			pkt.conn = Some(id);
		}

		let conn = &mut self.tcp.conns[id.0];
		conn.len = slen as u16;
		conn.nrtx = 0;
		conn.timer = conn.rto;
		conn.buf = Some(b);
		self.pool.incref(b);

		self.tcp_emit(b, id, ACK | PSH, slen, false);

		Ok(slen)
	}

	/// Polls the application for data on an idle established connection.
	pub fn tcp_poll(&mut self, id: ConnId) {
		if self.tcp.conns[id.0].state != State::Established || self.tcp.conns[id.0].outstanding() {
			return;
		}

		let Some(b) = self.alloc_or_log() else { return };

		let mut flags = Flags::none();
		flags.set_poll(true);

		let res = self.tcp_appcall(b, id, flags, &[]);
		self.tcp_appsend(b, id, res, flags);
	}

	/// The periodic tick: TIME_WAIT reaping, retransmissions, and
	/// application polling.
	pub fn periodic(&mut self) {
		self.tcp.iss = self.tcp.iss.wrapping_add(1);

		for idx in 0..N_CONNS {
			let cid = ConnId(idx);

			match self.tcp.conns[idx].state {
				State::Closed => continue,
				State::TimeWait | State::FinWait2 => {
					let conn = &mut self.tcp.conns[idx];
					conn.timer += 1;

					if conn.timer >= TIME_WAIT_TIMEOUT {
						if let Some(b) = conn.buf.take() {
							self.pool.unref(b);
						}
						self.tcp.conns[idx].reset_to_closed();
					}
				}
				state if self.tcp.conns[idx].outstanding() => {
					let conn = &mut self.tcp.conns[idx];

					if conn.timer > 0 {
						conn.timer -= 1;
						continue;
					}

					let handshake = matches!(state, State::SynSent | State::SynRcvd);

					if conn.nrtx == MAX_RTX || (handshake && conn.nrtx == MAX_SYN_RTX) {
						self.tcp_timeout(cid);
						continue;
					}

					// Exponential backoff, capped at a shift of four.
					conn.timer = RTO << conn.nrtx.min(4);
					conn.nrtx += 1;

					match state {
						State::SynRcvd => self.rexmit_flags(cid, SYN | ACK, true),
						State::SynSent => self.rexmit_flags(cid, SYN, true),
						State::Established => self.rexmit_data(cid),
						State::FinWait1 | State::Closing | State::LastAck => self.rexmit_flags(cid, FIN | ACK, false),
						_ => {}
					}
				}
				State::Established => {
					// Idle connection: let the application send.
					self.tcp_poll(cid);
				}
				_ => {}
			}
		}
	}

	fn tcp_timeout(&mut self, cid: ConnId) {
		debug!("tcp: connection {cid:?} timed out");

		if let Some(b) = self.alloc_or_log() {
			let mut flags = Flags::none();
			flags.set_timedout(true);
			let _ = self.tcp_appcall(b, cid, flags, &[]);

			self.tcp_emit(b, cid, RST | ACK, 0, false);
		}

		let conn = &mut self.tcp.conns[cid.0];
		if let Some(held) = conn.buf.take() {
			// The application learns that its unacknowledged data is gone.
			self.pool.get_mut(held).sent_status = status::ETIMEDOUT;
			self.drop_buf(held);
		}
		self.tcp.conns[cid.0].reset_to_closed();
	}

	/// Retransmits a flag-only segment (SYN, SYNACK, or FINACK).
	fn rexmit_flags(&mut self, cid: ConnId, flags: u8, mss_opt: bool) {
		if let Some(b) = self.alloc_or_log() {
			self.tcp_emit(b, cid, flags, 0, mss_opt);
		}
	}

	/// Retransmits the in-flight data segment. The held frame is re-sent
	/// verbatim when it exists; otherwise the application rebuilds the
	/// payload under the REXMIT flag.
	fn rexmit_data(&mut self, cid: ConnId) {
		if let Some(held) = self.tcp.conns[cid.0].buf {
			let pkt = self.pool.get(held);
			debug!("tcp: retransmitting held frame for {:?}", pkt.conn);
			self.link.send(&pkt.data[..pkt.len]);
			return;
		}

		let Some(b) = self.alloc_or_log() else { return };

		let mut flags = Flags::none();
		flags.set_rexmit(true);

		let res = self.tcp_appcall(b, cid, flags, &[]);
		let slen = res.slen.min(self.tcp.conns[cid.0].len as usize);

		if slen > 0 {
			self.pool.get_mut(b).app_len = slen;
			self.tcp_emit(b, cid, ACK | PSH, slen, false);
		} else {
			self.drop_buf(b);
		}
	}

	/// Segment ingress, after IP validation.
	pub(crate) fn tcp_input(&mut self, b: Buf, src: IpAddr, dst: IpAddr, ip_hlen: usize) {
		let seg = {
			let pkt = self.pool.get(b);

			if pkt.len < ip_hlen + HLEN {
				debug!("tcp: truncated segment");
				return self.drop_buf(b);
			}

			// Verify the checksum over the pseudo-header and segment.
			let seg_len = (pkt.len - ip_hlen) as u16;
			let mut csum = ip::pseudo(src, dst, Protocol::Tcp, seg_len);
			csum.push(&pkt.data[ip_hlen..pkt.len]);

			if csum.end() != [0, 0] {
				warn!("tcp: bad checksum");
				return self.drop_buf(b);
			}

			let h: &Header = bytes::cast(&pkt.data[ip_hlen..ip_hlen + HLEN]);
			let ctl = h.ctl.get();
			let data_off = ip_hlen + 4 * ctl.off().value() as usize;

			if data_off < ip_hlen + HLEN || data_off > pkt.len {
				debug!("tcp: bad data offset");
				return self.drop_buf(b);
			}

			let mut opts = [0; 40];
			let opts_len = (data_off - ip_hlen - HLEN).min(40);
			opts[..opts_len].copy_from_slice(&pkt.data[ip_hlen + HLEN..ip_hlen + HLEN + opts_len]);

			let value: u16 = ctl.into();

			Seg {
				src,
				sport: h.src.get(),
				dport: h.dst.get(),
				seq: h.seq.get(),
				ack: h.ack.get(),
				flags: value as u8,
				wnd: h.wnd.get(),
				urg: h.urg.get(),
				ip_hlen,
				data_off,
				data_len: pkt.len - data_off,
				opts,
				opts_len,
			}
		};

		if seg.sport == 0 || seg.dport == 0 {
			debug!("tcp: zero port");
			return self.drop_buf(b);
		}

		// Demultiplex against active connections first.
		let active = self.tcp.conns.iter().position(|c| {
			c.state != State::Closed && c.lport == seg.dport && c.rport == seg.sport && c.raddr == Some(src)
		});

		if let Some(idx) = active {
			return self.tcp_found(b, ConnId(idx), seg);
		}

		// A lone SYN may match a listening port; anything else gets a RST.
		if seg.flags & CTL == SYN && self.tcp.listenports.contains(&seg.dport) {
			return self.tcp_found_listen(b, seg);
		}

		self.tcp_reset(b, seg)
	}

	/// Replies with RST to a segment that matched no connection. Resets are
	/// never sent in response to resets.
	fn tcp_reset(&mut self, b: Buf, seg: Seg) {
		if seg.flags & RST != 0 {
			return self.drop_buf(b);
		}

		let total = seg.ip_hlen + HLEN;

		{
			let pkt = self.pool.get_mut(b);
			let h: &mut Header = bytes::cast_mut(&mut pkt.data[seg.ip_hlen..seg.ip_hlen + HLEN]);

			h.src = seg.dport.into();
			h.dst = seg.sport.into();
			// Flip the sequence fields, acknowledging one past the
			// offending sequence number.
			h.seq = seg.ack.into();
			h.ack = seg.seq.wrapping_add(1).into();
			h.ctl = Control::from((5u16 << 12) | (RST | ACK) as u16).into();
			h.wnd = 0u16.into();
			h.urg = 0u16.into();
			h.csm = [0, 0];

			pkt.len = total;
		}

		self.finish_segment(b, seg.src, seg.ip_hlen, total);
	}

	/// A SYN matched a listening port: allocate a slot and answer SYNACK.
	fn tcp_found_listen(&mut self, b: Buf, seg: Seg) {
		let Some(cid) = self.alloc_conn() else {
			// All slots busy; drop and let the peer retransmit the SYN when
			// a slot may have freed up.
			debug!("tcp: connection table full, dropping SYN");
			return self.drop_buf(b);
		};

		let iss = self.tcp.iss;
		let mss = mss_for(seg.src);

		let conn = &mut self.tcp.conns[cid.0];
		conn.state = State::SynRcvd;
		conn.stopped = false;
		conn.lport = seg.dport;
		conn.rport = seg.sport;
		conn.raddr = Some(seg.src);
		conn.rcv_nxt = seg.seq.wrapping_add(1);
		conn.snd_nxt = iss;
		// The SYNACK occupies one sequence number.
		conn.len = 1;
		conn.rto = RTO;
		conn.timer = RTO;
		conn.sa = 0;
		conn.sv = 4;
		conn.nrtx = 0;
		conn.buf = None;

		let limit = mss;
		let peer = seg.mss_option().map_or(limit, |m| m.min(limit));
		conn.mss = peer;
		conn.initialmss = peer;

		self.tcp_emit(b, cid, SYN | ACK, 0, true);
	}

	/// A segment matched an active connection.
	fn tcp_found(&mut self, b: Buf, cid: ConnId, seg: Seg) {
		let mut flags = Flags::none();

		// Reset processing is deliberately naive: any RST kills the
		// connection without a window check.
		if seg.flags & RST != 0 {
			debug!("tcp: got reset, aborting connection");
			let mut abort = Flags::none();
			abort.set_abort(true);
			let _ = self.tcp_appcall(b, cid, abort, &[]);

			if let Some(held) = self.tcp.conns[cid.0].buf.take() {
				self.pool.get_mut(held).sent_status = status::ECONNABORTED;
				self.drop_buf(held);
			}
			self.tcp.conns[cid.0].reset_to_closed();
			return self.drop_buf(b);
		}

		let state = self.tcp.conns[cid.0].state;

		// Unless this is the SYNACK we are waiting for (or a retransmitted
		// SYN in SYN_RCVD), an out-of-order segment is answered with an ACK
		// carrying the expected numbers.
		let expected_handshake =
			(state == State::SynSent && seg.flags & CTL == SYN | ACK) || (state == State::SynRcvd && seg.flags & CTL == SYN);

		if !expected_handshake && (seg.data_len > 0 || seg.flags & (SYN | FIN) != 0) && seg.seq != self.tcp.conns[cid.0].rcv_nxt {
			return self.send_ack(b, cid);
		}

		// Does this segment acknowledge outstanding data?
		if seg.flags & ACK != 0 && self.tcp.conns[cid.0].outstanding() {
			let conn = &mut self.tcp.conns[cid.0];
			let acked = conn.snd_nxt.wrapping_add(conn.len as u32);

			if seg.ack == acked {
				conn.snd_nxt = acked;

				// Van Jacobson RTT estimation, in integer form, unless the
				// segment was retransmitted.
				if conn.nrtx == 0 {
					let mut m = conn.rto - conn.timer;
					m -= conn.sa >> 3;
					conn.sa += m;
					m = m.abs() - (conn.sv >> 2);
					conn.sv += m;
					conn.rto = (conn.sa >> 3) + conn.sv;
				}

				flags.set_ackdata(true);
				conn.timer = conn.rto;
				conn.len = 0;

				if let Some(held) = conn.buf.take() {
					self.pool.unref(held);
				}
			}
		}

		match state {
			State::SynRcvd => {
				if flags.ackdata() {
					let conn = &mut self.tcp.conns[cid.0];
					conn.state = State::Established;
					conn.len = 0;
					flags = Flags::none();
					flags.set_connected(true);

					if seg.data_len > 0 {
						flags.set_newdata(true);
						conn.rcv_nxt = conn.rcv_nxt.wrapping_add(seg.data_len as u32);
					}

					let data = self.take_payload(b, &seg);
					let res = self.tcp_appcall(b, cid, flags, &data);
					return self.tcp_appsend(b, cid, res, flags);
				}

				if seg.flags & CTL == SYN {
					// The peer missed our SYNACK; resend it.
					return self.tcp_emit(b, cid, SYN | ACK, 0, true);
				}

				self.drop_buf(b)
			}

			State::SynSent => {
				if flags.ackdata() && seg.flags & CTL == SYN | ACK {
					let mss = seg.mss_option();
					let conn = &mut self.tcp.conns[cid.0];

					if let Some(m) = mss {
						let limit = mss_for(seg.src);
						conn.mss = m.min(limit);
						conn.initialmss = conn.mss;
					}

					conn.state = State::Established;
					conn.rcv_nxt = seg.seq.wrapping_add(1);
					conn.len = 0;

					flags = Flags::none();
					flags.set_connected(true);
					flags.set_newdata(true);

					let res = self.tcp_appcall(b, cid, flags, &[]);
					return self.tcp_appsend(b, cid, res, flags);
				}

				// Anything else means the open failed.
				let mut abort = Flags::none();
				abort.set_abort(true);
				let _ = self.tcp_appcall(b, cid, abort, &[]);

				self.tcp.conns[cid.0].reset_to_closed();
				self.tcp_reset(b, seg)
			}

			State::Established => self.tcp_established(b, cid, seg, flags),

			State::LastAck => {
				// The peer acknowledged our FIN; the connection is done.
				if flags.ackdata() {
					let mut close = Flags::none();
					close.set_close(true);
					let _ = self.tcp_appcall(b, cid, close, &[]);

					self.tcp.conns[cid.0].reset_to_closed();
				}

				self.drop_buf(b)
			}

			State::FinWait1 => {
				let conn = &mut self.tcp.conns[cid.0];

				if seg.data_len > 0 {
					conn.rcv_nxt = conn.rcv_nxt.wrapping_add(seg.data_len as u32);
				}

				if seg.flags & FIN != 0 {
					if flags.ackdata() {
						conn.state = State::TimeWait;
						conn.timer = 0;
						conn.len = 0;
					} else {
						conn.state = State::Closing;
					}

					conn.rcv_nxt = conn.rcv_nxt.wrapping_add(1);

					let mut close = Flags::none();
					close.set_close(true);
					let _ = self.tcp_appcall(b, cid, close, &[]);

					return self.send_ack(b, cid);
				}

				if flags.ackdata() {
					conn.state = State::FinWait2;
					conn.len = 0;
					return self.drop_buf(b);
				}

				if seg.data_len > 0 {
					return self.send_ack(b, cid);
				}

				self.drop_buf(b)
			}

			State::FinWait2 => {
				let conn = &mut self.tcp.conns[cid.0];

				if seg.data_len > 0 {
					conn.rcv_nxt = conn.rcv_nxt.wrapping_add(seg.data_len as u32);
				}

				if seg.flags & FIN != 0 {
					conn.state = State::TimeWait;
					conn.timer = 0;
					conn.rcv_nxt = conn.rcv_nxt.wrapping_add(1);

					let mut close = Flags::none();
					close.set_close(true);
					let _ = self.tcp_appcall(b, cid, close, &[]);

					return self.send_ack(b, cid);
				}

				if seg.data_len > 0 {
					return self.send_ack(b, cid);
				}

				self.drop_buf(b)
			}

			State::TimeWait => self.send_ack(b, cid),

			State::Closing => {
				if flags.ackdata() {
					let conn = &mut self.tcp.conns[cid.0];
					conn.state = State::TimeWait;
					conn.timer = 0;
				}

				self.drop_buf(b)
			}

			State::Closed => self.drop_buf(b),
		}
	}

	fn tcp_established(&mut self, b: Buf, cid: ConnId, mut seg: Seg, mut flags: Flags) {
		// A FIN while data is outstanding would corrupt the sequence
		// numbers; drop and handle the retransmitted FIN later.
		if seg.flags & FIN != 0 && !self.tcp.conns[cid.0].stopped {
			if self.tcp.conns[cid.0].outstanding() {
				return self.drop_buf(b);
			}

			let conn = &mut self.tcp.conns[cid.0];
			conn.rcv_nxt = conn.rcv_nxt.wrapping_add(1 + seg.data_len as u32);

			flags.set_close(true);
			if seg.data_len > 0 {
				flags.set_newdata(true);
			}

			let data = self.take_payload(b, &seg);
			let _ = self.tcp_appcall(b, cid, flags, &data);

			let conn = &mut self.tcp.conns[cid.0];
			conn.len = 1;
			conn.state = State::LastAck;
			conn.nrtx = 0;

			return self.tcp_emit(b, cid, FIN | ACK, 0, false);
		}

		// Urgent data is not delivered; skip past it.
		if seg.flags & URG != 0 {
			let skip = (seg.urg as usize).min(seg.data_len);
			seg.data_off += skip;
			seg.data_len -= skip;
		}

		{
			let conn = &mut self.tcp.conns[cid.0];

			if seg.data_len > 0 && !conn.stopped {
				flags.set_newdata(true);
				conn.rcv_nxt = conn.rcv_nxt.wrapping_add(seg.data_len as u32);
			}

			// Track the peer's window. A window above the initial MSS is
			// clamped; a zero window substitutes the initial MSS so that a
			// full segment drives the persistent-timer retransmission.
			let mut wnd = seg.wnd;
			if wnd > conn.initialmss || wnd == 0 {
				wnd = conn.initialmss;
			}
			conn.mss = wnd;
		}

		if flags.newdata() || flags.ackdata() {
			let data = self.take_payload(b, &seg);
			let res = self.tcp_appcall(b, cid, flags, &data);
			return self.tcp_appsend(b, cid, res, flags);
		}

		self.drop_buf(b)
	}

	/// Copies a segment's payload out of the buffer, so the buffer can be
	/// reused for the reply while the application still sees the data.
	fn take_payload(&self, b: Buf, seg: &Seg) -> Vec<u8> {
		if seg.data_len == 0 {
			return Vec::new();
		}

		let pkt = self.pool.get(b);
		pkt.data[seg.data_off..seg.data_off + seg.data_len].to_vec()
	}

	/// Invokes the application callback with `flags`, staging any reply
	/// into `b`'s payload region.
	pub(crate) fn tcp_appcall(&mut self, b: Buf, cid: ConnId, flags: Flags, data: &[u8]) -> AppResult {
		let Some(mut app) = self.tcp.app.take() else {
			return AppResult::default();
		};

		let (out_off, out_max) = {
			let conn = &self.tcp.conns[cid.0];
			let Some(raddr) = conn.raddr else { return AppResult::default() };

			let off = ip_hlen_for(raddr) + HLEN;
			(off, (conn.mss as usize).min(MTU - off))
		};

		let pkt = self.pool.get_mut(b);
		pkt.app_off = out_off;

		let mut reply = TcpReply {
			out: &mut pkt.data[out_off..out_off + out_max],
			slen: 0,
			close: false,
			abort: false,
			stop: false,
			restart: false,
		};

		app(&TcpEvent { conn: cid, flags, data }, &mut reply);

		let res = AppResult {
			slen: reply.slen,
			close: reply.close,
			abort: reply.abort,
		};

		let (stop, restart) = (reply.stop, reply.restart);
		pkt.app_len = res.slen;

		self.tcp.app = Some(app);

		let conn = &mut self.tcp.conns[cid.0];
		if stop {
			conn.stopped = true;
		}
		if restart {
			conn.stopped = false;
		}

		res
	}

	/// Turns an application reply into a segment: an abort, a close, new
	/// data (at most one segment in flight), or a plain ACK.
	pub(crate) fn tcp_appsend(&mut self, b: Buf, cid: ConnId, res: AppResult, flags: Flags) {
		if res.abort {
			if let Some(held) = self.tcp.conns[cid.0].buf.take() {
				self.pool.unref(held);
			}

			self.tcp_emit(b, cid, RST | ACK, 0, false);
			return self.tcp.conns[cid.0].reset_to_closed();
		}

		if res.close {
			let conn = &mut self.tcp.conns[cid.0];
			conn.len = 1;
			conn.state = State::FinWait1;
			conn.nrtx = 0;

			return self.tcp_emit(b, cid, FIN | ACK, 0, false);
		}

		let mut slen = res.slen;

		if slen > 0 {
			let conn = &mut self.tcp.conns[cid.0];

			// Freshly acknowledged data no longer counts against the
			// one-segment-in-flight limit.
			if flags.ackdata() {
				conn.len = 0;
			}

			if conn.len == 0 {
				slen = slen.min(conn.mss as usize);
				conn.len = slen as u16;
				conn.nrtx = 0;
				conn.timer = conn.rto;
				conn.buf = Some(b);

				let pkt = self.pool.get_mut(b);
				pkt.app_len = slen;
				pkt.conn = Some(cid);
				self.pool.incref(b);

				return self.tcp_emit(b, cid, ACK | PSH, slen, false);
			}

			// Data already in flight; the reply is discarded and the
			// outstanding segment goes out again instead.
			self.drop_buf(b);
			return self.rexmit_data(cid);
		}

		self.tcp.conns[cid.0].nrtx = 0;

		if flags.newdata() {
			return self.send_ack(b, cid);
		}

		self.drop_buf(b)
	}

	fn send_ack(&mut self, b: Buf, cid: ConnId) {
		self.tcp_emit(b, cid, ACK, 0, false)
	}

	/// Builds and emits a segment for `cid` into `b`. The payload, when
	/// any, must already sit immediately after the headers.
	pub(crate) fn tcp_emit(&mut self, b: Buf, cid: ConnId, flags: u8, payload: usize, mss_opt: bool) {
		let (lport, rport, raddr, snd_nxt, rcv_nxt, zero_wnd) = {
			let conn = &self.tcp.conns[cid.0];
			let Some(raddr) = conn.raddr else { return self.drop_buf(b) };

			(conn.lport, conn.rport, raddr, conn.snd_nxt, conn.rcv_nxt, conn.stopped)
		};

		let ip_hlen = ip_hlen_for(raddr);
		let opt_len = if mss_opt { OPT_MSS_LEN as usize } else { 0 };
		let seg_len = HLEN + opt_len + payload;
		let total = ip_hlen + seg_len;

		{
			let pkt = self.pool.get_mut(b);
			let h: &mut Header = bytes::cast_mut(&mut pkt.data[ip_hlen..ip_hlen + HLEN]);

			h.src = lport.into();
			h.dst = rport.into();
			h.seq = snd_nxt.into();
			h.ack = rcv_nxt.into();

			let words = ((HLEN + opt_len) / 4) as u16;
			h.ctl = Control::from(words << 12 | flags as u16).into();

			// A stopped flow advertises a zero window so the peer pauses.
			h.wnd = if zero_wnd { 0u16.into() } else { mss_for(raddr).into() };
			h.urg = 0u16.into();
			h.csm = [0, 0];

			if mss_opt {
				let mss = mss_for(raddr);
				pkt.data[ip_hlen + HLEN..ip_hlen + HLEN + 4].copy_from_slice(&[OPT_MSS, OPT_MSS_LEN, (mss >> 8) as u8, mss as u8]);
			}

			pkt.len = total;
		}

		self.finish_segment(b, raddr, ip_hlen, total);
	}

	/// Stamps the TCP checksum and the IP header, then emits the frame.
	fn finish_segment(&mut self, b: Buf, raddr: IpAddr, ip_hlen: usize, total: usize) {
		let seg_len = (total - ip_hlen) as u16;
		let local = self.local_addr(raddr);

		let sum = {
			let pkt = self.pool.get(b);
			let mut csum = ip::pseudo(local, raddr, Protocol::Tcp, seg_len);
			csum.push(&pkt.data[ip_hlen..total]);
			csum.end()
		};

		{
			let pkt = self.pool.get_mut(b);
			pkt.data[ip_hlen + 16..ip_hlen + 18].copy_from_slice(&sum);
		}

		self.fill_ip(b, raddr, Protocol::Tcp, total);
		self.emit(b);
	}

	/// Finds a slot for a new connection, preferring CLOSED and falling
	/// back to the longest-lived TIME_WAIT entry.
	fn alloc_conn(&mut self) -> Option<ConnId> {
		let mut pick: Option<usize> = None;

		for (i, conn) in self.tcp.conns.iter().enumerate() {
			if conn.state == State::Closed {
				pick = Some(i);
				break;
			}

			if conn.state == State::TimeWait {
				match pick {
					Some(p) if self.tcp.conns[p].timer >= conn.timer => {}
					_ => pick = Some(i),
				}
			}
		}

		let idx = pick?;

		if let Some(held) = self.tcp.conns[idx].buf.take() {
			self.pool.unref(held);
		}

		Some(ConnId(idx))
	}

	/// Allocates an ephemeral port unused by both TCP and UDP.
	pub(crate) fn ephemeral_port(&mut self) -> u16 {
		loop {
			self.lastport = if self.lastport >= EPHEMERAL_HI || self.lastport < EPHEMERAL_LO {
				EPHEMERAL_LO
			} else {
				self.lastport + 1
			};

			let tcp_used = self.tcp.conns.iter().any(|c| c.state != State::Closed && c.lport == self.lastport);
			let udp_used = self.udp.assocs.iter().any(|a| a.lport == self.lastport);

			if !tcp_used && !udp_used {
				return self.lastport;
			}
		}
	}
}
