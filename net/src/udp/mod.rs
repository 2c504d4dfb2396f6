//! The UDP association table.
//!
//! Associations are slots in a fixed array; a zero local port marks a free
//! slot, a zero remote port or unspecified remote address is a wildcard.

use core::net::IpAddr;

use log::{debug, warn};
use utils::bytes::{self, Cast};
use utils::endian::u16be;

use crate::buf::Buf;
use crate::config::{MTU, N_UDP, TTL};
use crate::ip::{self, Protocol, SocketAddr};
use crate::{Link, Stack};

const HLEN: usize = 8;

#[derive(Cast)]
#[repr(C)]
pub(crate) struct Header {
	src: u16be,
	dst: u16be,
	len: u16be,
	csum: [u8; 2],
}

/// A handle naming an association slot.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct AssocId(pub(crate) usize);

pub(crate) struct Assoc {
	/// Local port; 0 marks the slot free.
	pub lport: u16,
	/// Remote port filter; 0 accepts any source port.
	pub rport: u16,
	/// Remote address filter; `None` accepts any source address.
	pub raddr: Option<IpAddr>,
	pub ttl: u8,
	/// Whether outgoing datagrams carry a checksum. Inbound checksums are
	/// verified whenever the peer supplied one.
	pub checksums: bool,
	pub cb: Option<UdpCallback>,
}

impl Default for Assoc {
	fn default() -> Self {
		Self { lport: 0, rport: 0, raddr: None, ttl: TTL, checksums: true, cb: None }
	}
}

pub(crate) struct Udp {
	pub assocs: [Assoc; N_UDP],
}

impl Default for Udp {
	fn default() -> Self {
		Self { assocs: core::array::from_fn(|_| Assoc::default()) }
	}
}

/// A datagram delivered to the application.
pub struct UdpEvent<'a> {
	pub assoc: AssocId,
	pub src: SocketAddr,
	pub data: &'a [u8],
}

/// Staging area for an immediate reply to the datagram's source.
pub struct UdpReply<'a> {
	out: &'a mut [u8],
	slen: usize,
}

impl UdpReply<'_> {
	pub fn send(&mut self, data: &[u8]) -> usize {
		let n = data.len().min(self.out.len());
		self.out[..n].copy_from_slice(&data[..n]);
		self.slen = n;
		n
	}

	pub fn out(&mut self) -> &mut [u8] {
		self.out
	}

	pub fn commit(&mut self, n: usize) {
		self.slen = n.min(self.out.len());
	}
}

pub type UdpCallback = Box<dyn FnMut(&UdpEvent, &mut UdpReply)>;

impl<L: Link> Stack<L> {
	/// Creates an association to a remote endpoint on a fresh ephemeral
	/// local port. Pass an unspecified `raddr` and zero `rport` to accept
	/// from anyone; bind a well-known local port with [`Self::udp_bind`].
	pub fn udp_new(&mut self, raddr: IpAddr, rport: u16, cb: UdpCallback) -> Option<AssocId> {
		let lport = self.ephemeral_port();

		let idx = self.udp.assocs.iter().position(|a| a.lport == 0)?;
		let assoc = &mut self.udp.assocs[idx];

		assoc.lport = lport;
		assoc.rport = rport;
		assoc.raddr = if raddr.is_unspecified() { None } else { Some(raddr) };
		assoc.ttl = TTL;
		assoc.checksums = true;
		assoc.cb = Some(cb);

		Some(AssocId(idx))
	}

	/// Rebinds an association to a specific local port.
	pub fn udp_bind(&mut self, id: AssocId, lport: u16) {
		self.udp.assocs[id.0].lport = lport;
	}

	pub fn udp_remove(&mut self, id: AssocId) {
		self.udp.assocs[id.0] = Assoc::default();
	}

	/// Sends a datagram from an association to `to`.
	pub fn udp_send(&mut self, id: AssocId, to: SocketAddr, data: &[u8]) -> Result<(), ()> {
		let ip_hlen = match to.addr {
			IpAddr::V4(_) => ip::v4::HLEN,
			IpAddr::V6(_) => ip::v6::HLEN,
		};

		let off = ip_hlen + HLEN;

		if off + data.len() > MTU {
			warn!("udp: datagram too large ({} bytes)", data.len());
			return Err(());
		}

		let b = self.alloc_or_log().ok_or(())?;

		{
			let pkt = self.pool.get_mut(b);
			pkt.data[off..off + data.len()].copy_from_slice(data);
			pkt.app_off = off;
			pkt.app_len = data.len();
		}

		self.udp_emit(b, id, to, data.len());

		Ok(())
	}

	/// Datagram ingress, after IP validation.
	pub(crate) fn udp_input(&mut self, b: Buf, src: IpAddr, dst: IpAddr, ip_hlen: usize) {
		let (sport, dport, data_len) = {
			let pkt = self.pool.get(b);

			if pkt.len < ip_hlen + HLEN {
				debug!("udp: truncated datagram");
				return self.drop_buf(b);
			}

			let h: &Header = bytes::cast(&pkt.data[ip_hlen..ip_hlen + HLEN]);
			let udplen = h.len.get() as usize;

			if udplen < HLEN || ip_hlen + udplen > pkt.len {
				warn!("udp: length field does not match the datagram");
				return self.drop_buf(b);
			}

			// Verify the checksum when the peer supplied one; for IPv6 it
			// is mandatory.
			if h.csum != [0, 0] || src.is_ipv6() {
				let mut csum = ip::pseudo(src, dst, Protocol::Udp, udplen as u16);
				csum.push(&pkt.data[ip_hlen..ip_hlen + udplen]);

				if csum.end() != [0, 0] {
					warn!("udp: bad checksum");
					return self.drop_buf(b);
				}
			}

			(h.src.get(), h.dst.get(), udplen - HLEN)
		};

		if dport == 0 {
			debug!("udp: zero destination port");
			return self.drop_buf(b);
		}

		let matched = self.udp.assocs.iter().position(|a| {
			a.lport != 0
				&& a.lport == dport
				&& (a.rport == 0 || a.rport == sport)
				&& match a.raddr {
					None => true,
					Some(r) => r == src || r == IpAddr::V4(core::net::Ipv4Addr::BROADCAST),
				}
		});

		let Some(idx) = matched else {
			debug!("udp: no association for port {dport}");
			return self.drop_buf(b);
		};

		let Some(mut cb) = self.udp.assocs[idx].cb.take() else {
			return self.drop_buf(b);
		};

		let from = SocketAddr { addr: src, port: sport };

		let data = {
			let pkt = self.pool.get_mut(b);
			pkt.app_off = ip_hlen + HLEN;
			pkt.app_len = data_len;
			pkt.app_data().to_vec()
		};

		let slen = {
			let pkt = self.pool.get_mut(b);
			let off = pkt.app_off;

			let mut reply = UdpReply { out: &mut pkt.data[off..MTU], slen: 0 };
			cb(&UdpEvent { assoc: AssocId(idx), src: from, data: &data }, &mut reply);

			reply.slen
		};

		self.udp.assocs[idx].cb = Some(cb);

		if slen > 0 {
			self.pool.get_mut(b).app_len = slen;
			self.udp_emit(b, AssocId(idx), from, slen);
		} else {
			self.drop_buf(b);
		}
	}

	/// Builds UDP and IP headers around a staged payload and emits it.
	fn udp_emit(&mut self, b: Buf, id: AssocId, to: SocketAddr, payload: usize) {
		let (lport, want_csum, ttl) = {
			let a = &self.udp.assocs[id.0];
			(a.lport, a.checksums, a.ttl)
		};

		let ip_hlen = match to.addr {
			IpAddr::V4(_) => ip::v4::HLEN,
			IpAddr::V6(_) => ip::v6::HLEN,
		};

		let udplen = HLEN + payload;
		let total = ip_hlen + udplen;

		{
			let pkt = self.pool.get_mut(b);
			let h: &mut Header = bytes::cast_mut(&mut pkt.data[ip_hlen..ip_hlen + HLEN]);

			h.src = lport.into();
			h.dst = to.port.into();
			h.len = (udplen as u16).into();
			h.csum = [0, 0];

			pkt.len = total;
		}

		if want_csum || to.addr.is_ipv6() {
			let local = self.local_addr(to.addr);

			let sum = {
				let pkt = self.pool.get(b);
				let mut csum = ip::pseudo(local, to.addr, Protocol::Udp, udplen as u16);
				csum.push(&pkt.data[ip_hlen..total]);
				csum.end()
			};

			// An all-zero checksum means "absent" on the wire, so a
			// computed zero is transmitted as 0xffff.
			let sum = if sum == [0, 0] { [0xff, 0xff] } else { sum };

			let pkt = self.pool.get_mut(b);
			pkt.data[ip_hlen + 6..ip_hlen + 8].copy_from_slice(&sum);
		}

		self.fill_ip_ttl(b, to.addr, Protocol::Udp, total, ttl);
		self.emit(b);
	}
}

#[cfg(test)]
mod tests {
	use core::cell::RefCell;
	use core::net::{Ipv4Addr, Ipv6Addr};
	use std::rc::Rc;

	use super::*;
	use crate::ip::Checksum;

	const HOST: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
	const PEER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

	#[derive(Clone, Default)]
	struct TestLink {
		frames: Rc<RefCell<Vec<Vec<u8>>>>,
	}

	impl Link for TestLink {
		fn send(&mut self, frame: &[u8]) {
			self.frames.borrow_mut().push(frame.to_vec());
		}
	}

	fn stack() -> (Stack<TestLink>, Rc<RefCell<Vec<Vec<u8>>>>) {
		let link = TestLink::default();
		let frames = link.frames.clone();
		(Stack::new(HOST, Ipv6Addr::LOCALHOST, link), frames)
	}

	/// Builds an IPv4 UDP frame with valid checksums.
	fn udp4(src: Ipv4Addr, dst: Ipv4Addr, sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
		let udplen = HLEN + payload.len();
		let total = 20 + udplen;

		let mut f = vec![0u8; total];

		f[0] = 0x45;
		f[2..4].copy_from_slice(&(total as u16).to_be_bytes());
		f[8] = 64;
		f[9] = 17;
		f[12..16].copy_from_slice(&src.octets());
		f[16..20].copy_from_slice(&dst.octets());
		let ipsum = Checksum::of(&f[..20]).end();
		f[10..12].copy_from_slice(&ipsum);

		f[20..22].copy_from_slice(&sport.to_be_bytes());
		f[22..24].copy_from_slice(&dport.to_be_bytes());
		f[24..26].copy_from_slice(&(udplen as u16).to_be_bytes());
		f[28..].copy_from_slice(payload);

		let mut csum = ip::pseudo(IpAddr::V4(src), IpAddr::V4(dst), Protocol::Udp, udplen as u16);
		csum.push(&f[20..]);
		let sum = csum.end();
		let sum = if sum == [0, 0] { [0xff, 0xff] } else { sum };
		f[26..28].copy_from_slice(&sum);

		f
	}

	fn bound_assoc(stack: &mut Stack<TestLink>, lport: u16) -> (AssocId, Rc<RefCell<Vec<(SocketAddr, Vec<u8>)>>>, Rc<RefCell<Option<Vec<u8>>>>) {
		let seen: Rc<RefCell<Vec<(SocketAddr, Vec<u8>)>>> = Rc::default();
		let reply: Rc<RefCell<Option<Vec<u8>>>> = Rc::default();

		let (s, r) = (seen.clone(), reply.clone());
		let id = stack
			.udp_new(
				IpAddr::V4(Ipv4Addr::UNSPECIFIED),
				0,
				Box::new(move |ev, out| {
					s.borrow_mut().push((ev.src, ev.data.to_vec()));
					if let Some(data) = r.borrow_mut().take() {
						out.send(&data);
					}
				}),
			)
			.unwrap();

		stack.udp_bind(id, lport);
		(id, seen, reply)
	}

	#[test]
	fn datagram_reaches_bound_association() {
		let (mut stack, frames) = stack();
		let (_, seen, _) = bound_assoc(&mut stack, 5683);

		stack.input(&udp4(PEER, HOST, 40000, 5683, b"ping"));

		let seen = seen.borrow();
		assert_eq!(seen.len(), 1);
		assert_eq!(seen[0].0, SocketAddr { addr: IpAddr::V4(PEER), port: 40000 });
		assert_eq!(seen[0].1, b"ping");
		assert!(frames.borrow().is_empty());
	}

	#[test]
	fn reply_is_emitted_with_valid_checksum() {
		let (mut stack, frames) = stack();
		let (_, _, reply) = bound_assoc(&mut stack, 5683);

		reply.borrow_mut().replace(b"pong".to_vec());
		stack.input(&udp4(PEER, HOST, 40000, 5683, b"ping"));

		let frames = frames.borrow();
		assert_eq!(frames.len(), 1);

		let f = &frames[0];
		assert_eq!(f[9], 17);
		assert_eq!(u16::from_be_bytes([f[20], f[21]]), 5683);
		assert_eq!(u16::from_be_bytes([f[22], f[23]]), 40000);
		assert_eq!(&f[16..20], &PEER.octets());
		assert_eq!(&f[28..], b"pong");

		// Checksum over the reply verifies.
		let mut csum = ip::pseudo(IpAddr::V4(HOST), IpAddr::V4(PEER), Protocol::Udp, (f.len() - 20) as u16);
		csum.push(&f[20..]);
		assert_eq!(csum.end(), [0, 0]);
	}

	#[test]
	fn unmatched_port_is_dropped() {
		let (mut stack, frames) = stack();
		let (_, seen, _) = bound_assoc(&mut stack, 5683);

		stack.input(&udp4(PEER, HOST, 40000, 9999, b"ping"));

		assert!(seen.borrow().is_empty());
		assert!(frames.borrow().is_empty());
	}

	#[test]
	fn remote_filter_applies() {
		let (mut stack, _) = stack();
		let seen: Rc<RefCell<Vec<(SocketAddr, Vec<u8>)>>> = Rc::default();

		let s = seen.clone();
		let id = stack
			.udp_new(
				IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)),
				1111,
				Box::new(move |ev, _| s.borrow_mut().push((ev.src, ev.data.to_vec()))),
			)
			.unwrap();
		stack.udp_bind(id, 5683);

		// Wrong source: filtered.
		stack.input(&udp4(PEER, HOST, 1111, 5683, b"x"));
		assert!(seen.borrow().is_empty());

		// Matching source and port: delivered.
		stack.input(&udp4(Ipv4Addr::new(10, 0, 0, 7), HOST, 1111, 5683, b"y"));
		assert_eq!(seen.borrow().len(), 1);
	}

	#[test]
	fn corrupt_checksum_is_dropped() {
		let (mut stack, _) = stack();
		let (_, seen, _) = bound_assoc(&mut stack, 5683);

		let mut f = udp4(PEER, HOST, 40000, 5683, b"ping");
		let n = f.len();
		f[n - 1] ^= 0xff;
		stack.input(&f);

		assert!(seen.borrow().is_empty());
	}

	#[test]
	fn send_builds_headers() {
		let (mut stack, frames) = stack();
		let id = stack.udp_new(IpAddr::V4(PEER), 7777, Box::new(|_, _| {})).unwrap();

		stack.udp_send(id, SocketAddr { addr: IpAddr::V4(PEER), port: 7777 }, b"hello").unwrap();

		let frames = frames.borrow();
		assert_eq!(frames.len(), 1);

		let f = &frames[0];
		assert_eq!(f[0], 0x45);
		assert_eq!(&f[12..16], &HOST.octets());
		assert_eq!(&f[16..20], &PEER.octets());
		assert_eq!(u16::from_be_bytes([f[22], f[23]]), 7777);
		assert_eq!(&f[28..], b"hello");
		assert_eq!(Checksum::of(&f[..20]).end(), [0, 0]);
	}
}
