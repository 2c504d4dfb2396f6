//! A fixed-capacity TCP/UDP/ICMP stack for constrained deployments.
//!
//! All connection state lives in compile-time sized tables owned by one
//! [`Stack`] value; the cooperative runtime drives it through `recv` and the
//! periodic tick, and every outbound frame leaves through the [`Link`].

use core::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use log::{debug, warn};
use stakker::{Fwd, CX};

pub mod buf;
pub mod config;
mod icmp;
pub mod ip;
pub mod tcp;
pub mod udp;

use buf::Buf;
use config::{MTU, PERIODIC_INTERVAL};
use ip::Protocol;

/// The frame egress seam. The link layer encapsulates and transmits frames
/// the stack hands it; it is free to copy.
pub trait Link {
	fn send(&mut self, frame: &[u8]);
}

/// Forward frames into an actor-owned link, e.g. a socket tap.
impl Link for Fwd<Box<[u8]>> {
	fn send(&mut self, frame: &[u8]) {
		self.fwd(frame.into());
	}
}

pub struct Stack<L: Link> {
	host4: Ipv4Addr,
	host6: Ipv6Addr,
	pub(crate) pool: buf::Pool,
	pub(crate) tcp: tcp::Tcp,
	pub(crate) udp: udp::Udp,
	pub(crate) link: L,
	ipid: u16,
	pub(crate) lastport: u16,
}

impl<L: Link> Stack<L> {
	pub fn new(host4: Ipv4Addr, host6: Ipv6Addr, link: L) -> Self {
		Self {
			host4,
			host6,
			pool: buf::Pool::default(),
			tcp: tcp::Tcp::default(),
			udp: udp::Udp::default(),
			link,
			ipid: 0,
			lastport: config::EPHEMERAL_LO,
		}
	}

	/// Hands one link-layer frame (starting at the IP header) to the stack.
	pub fn input(&mut self, frame: &[u8]) {
		if frame.is_empty() || frame.len() > MTU {
			return debug!("ip: unusable frame of {} bytes", frame.len());
		}

		let Some(b) = self.pool.alloc() else {
			// The application sees this as -ENOBUFS; nothing is queued.
			return warn!("ip: buffer pool exhausted, dropping frame");
		};

		{
			let pkt = self.pool.get_mut(b);
			pkt.data[..frame.len()].copy_from_slice(frame);
			pkt.len = frame.len();
		}

		match frame[0] >> 4 {
			4 => self.recv_v4(b),
			6 => self.recv_v6(b),
			v => {
				warn!("ip: invalid packet version {v}");
				self.drop_buf(b)
			}
		}
	}

	fn recv_v4(&mut self, b: Buf) {
		let (proto, src, dst) = {
			let pkt = self.pool.get(b);

			if pkt.len < ip::v4::HLEN {
				debug!("ip: runt packet");
				return self.drop_buf(b);
			}

			// Only the optionless 20-byte header is accepted.
			if pkt.data[0] != 0x45 {
				warn!("ip: invalid version or header length");
				return self.drop_buf(b);
			}

			let h = ip::v4::Header::of(&pkt.data);

			let reported = h.len.get() as usize;
			if reported > pkt.len || reported < ip::v4::HLEN {
				debug!("ip: packet shorter than reported in IP header");
				return self.drop_buf(b);
			}

			let frag = h.frg.get();
			if frag.more() || frag.ofst().value() != 0 {
				debug!("ip: fragment dropped");
				return self.drop_buf(b);
			}

			if ip::Checksum::of(&pkt.data[..ip::v4::HLEN]).end() != [0, 0] {
				warn!("ip: bad checksum");
				return self.drop_buf(b);
			}

			(h.proto.get(), Ipv4Addr::from(h.src), Ipv4Addr::from(h.dst), )
		};

		// Trim link padding down to the reported length.
		{
			let pkt = self.pool.get_mut(b);
			let h = ip::v4::Header::of(&pkt.data);
			pkt.len = h.len.get() as usize;
		}

		// Destination filter: our address, or a UDP broadcast.
		if dst != self.host4 && !(proto == Protocol::Udp && dst == Ipv4Addr::BROADCAST) {
			debug!("ip: packet for {dst}, not us");
			return self.drop_buf(b);
		}

		let src = IpAddr::V4(src);
		let dst = IpAddr::V4(dst);

		match proto {
			Protocol::Tcp => self.tcp_input(b, src, dst, ip::v4::HLEN),
			Protocol::Udp => self.udp_input(b, src, dst, ip::v4::HLEN),
			Protocol::Icmp => self.icmp_input_v4(b),
			other => {
				debug!("ip: unimplemented protocol {:?}", other);
				self.drop_buf(b)
			}
		}
	}

	fn recv_v6(&mut self, b: Buf) {
		let (proto, src, dst) = {
			let pkt = self.pool.get(b);

			if pkt.len < ip::v6::HLEN {
				debug!("ipv6: runt packet");
				return self.drop_buf(b);
			}

			let h = ip::v6::Header::of(&pkt.data);

			if h.ver.get().ver() != ip::Version::V6 {
				warn!("ipv6: invalid version");
				return self.drop_buf(b);
			}

			let total = ip::v6::HLEN + h.len.get() as usize;
			if total > pkt.len {
				debug!("ipv6: packet shorter than specified length field");
				return self.drop_buf(b);
			}

			(h.nxt.get(), Ipv6Addr::from(h.src), Ipv6Addr::from(h.dst))
		};

		{
			let pkt = self.pool.get_mut(b);
			let h = ip::v6::Header::of(&pkt.data);
			pkt.len = ip::v6::HLEN + h.len.get() as usize;
		}

		// Accept our address plus the whole ff02::/16 multicast range, which
		// blankets all-hosts and solicited-node traffic.
		if dst != self.host6 && dst.octets()[..2] != [0xff, 0x02] {
			debug!("ipv6: packet for {dst}, not us");
			return self.drop_buf(b);
		}

		let src = IpAddr::V6(src);
		let dst = IpAddr::V6(dst);

		match proto {
			Protocol::Tcp => self.tcp_input(b, src, dst, ip::v6::HLEN),
			Protocol::Udp => self.udp_input(b, src, dst, ip::v6::HLEN),
			Protocol::Icmpv6 => self.icmp_input_v6(b, src),
			other => {
				debug!("ipv6: unimplemented protocol {:?}", other);
				self.drop_buf(b)
			}
		}
	}

	fn icmp_input_v4(&mut self, b: Buf) {
		let host = self.host4;
		let id = self.next_ipid();

		{
			let pkt = self.pool.get_mut(b);
			let len = pkt.len;

			if icmp::echo_reply_v4(&mut pkt.data[ip::v4::HLEN..len]).is_err() {
				return self.drop_buf(b);
			}

			// Return to sender: the request's source becomes our
			// destination and we restamp the IP header.
			let h = ip::v4::Header::of_mut(&mut pkt.data);
			h.dst = h.src;
			h.src = host.octets();
			h.ttl = config::TTL;
			h.id = id.into();
			h.csm = [0, 0];
			h.csm = ip::Checksum::of(utils::bytes::as_slice(h)).end();
		}

		self.emit(b);
	}

	fn icmp_input_v6(&mut self, b: Buf, src: IpAddr) {
		let host = self.host6;

		{
			let pkt = self.pool.get_mut(b);
			let len = pkt.len;

			// The reply's checksum covers a pseudo-header with our address
			// as the source, even when the echo came in via multicast.
			if icmp::echo_reply_v6(&mut pkt.data[ip::v6::HLEN..len], src, IpAddr::V6(host)).is_err() {
				return self.drop_buf(b);
			}

			let h = ip::v6::Header::of_mut(&mut pkt.data);
			h.dst = h.src;
			h.src = host.octets();
			h.ttl = config::TTL;
		}

		self.emit(b);
	}

	/// Our address in the family of `peer`.
	pub(crate) fn local_addr(&self, peer: IpAddr) -> IpAddr {
		match peer {
			IpAddr::V4(_) => IpAddr::V4(self.host4),
			IpAddr::V6(_) => IpAddr::V6(self.host6),
		}
	}

	/// Writes the IP header for an outbound frame.
	pub(crate) fn fill_ip(&mut self, b: Buf, dst: IpAddr, proto: Protocol, total: usize) {
		self.fill_ip_ttl(b, dst, proto, total, config::TTL)
	}

	pub(crate) fn fill_ip_ttl(&mut self, b: Buf, dst: IpAddr, proto: Protocol, total: usize, ttl: u8) {
		match dst {
			IpAddr::V4(d) => {
				let id = self.next_ipid();
				let host = self.host4;
				let pkt = self.pool.get_mut(b);
				ip::v4::fill(&mut pkt.data, host, d, proto, total, id, ttl);
			}
			IpAddr::V6(d) => {
				let host = self.host6;
				let pkt = self.pool.get_mut(b);
				ip::v6::fill(&mut pkt.data, host, d, proto, total - ip::v6::HLEN, ttl);
			}
		}
	}

	fn next_ipid(&mut self) -> u16 {
		self.ipid = self.ipid.wrapping_add(1);
		self.ipid
	}

	/// Hands a finished frame to the link and releases our reference.
	pub(crate) fn emit(&mut self, b: Buf) {
		{
			let pkt = self.pool.get(b);
			self.link.send(&pkt.data[..pkt.len]);
		}

		self.pool.unref(b);
	}

	pub(crate) fn drop_buf(&mut self, b: Buf) {
		let pkt = self.pool.get(b);

		if pkt.sent_status != buf::status::OK {
			debug!("net: releasing buffer for {:?} with status {}", pkt.conn, pkt.sent_status);
		}

		self.pool.unref(b);
	}

	pub(crate) fn alloc_or_log(&mut self) -> Option<Buf> {
		let b = self.pool.alloc();

		if b.is_none() {
			warn!("net: buffer pool exhausted");
		}

		b
	}
}

/// Actor entry points, for running the stack under the cooperative loop.
impl<L: Link + 'static> Stack<L> {
	pub fn init(cx: CX![], host4: Ipv4Addr, host6: Ipv6Addr, link: L) -> Option<Self> {
		let this = Self::new(host4, host6, link);

		// Arm the periodic timer driving retransmissions and TIME_WAIT.
		let actor = cx.access_actor().clone();
		cx.after(PERIODIC_INTERVAL, move |s| actor.apply(s, |this, cx| this.tick(cx)));

		Some(this)
	}

	pub fn recv(&mut self, _: CX![], frame: Box<[u8]>) {
		self.input(&frame);
	}

	pub fn tick(&mut self, cx: CX![]) {
		self.periodic();

		let actor = cx.access_actor().clone();
		cx.after(PERIODIC_INTERVAL, move |s| actor.apply(s, |this, cx| this.tick(cx)));
	}
}
