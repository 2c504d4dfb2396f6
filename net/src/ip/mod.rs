use core::fmt::{Debug, Display};
use core::net::IpAddr;
use std::net::SocketAddrV4;

use bilge::prelude::*;

mod checksum;

pub mod v4;
pub mod v6;

pub use checksum::Checksum;

/// A transport endpoint: remote address plus port.
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
pub struct SocketAddr {
	pub addr: IpAddr,
	pub port: u16,
}

impl From<std::net::SocketAddr> for SocketAddr {
	fn from(sock: std::net::SocketAddr) -> Self {
		Self { addr: sock.ip(), port: sock.port() }
	}
}

impl From<SocketAddrV4> for SocketAddr {
	fn from(sock: SocketAddrV4) -> Self {
		std::net::SocketAddr::into(sock.into())
	}
}

impl Debug for SocketAddr {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		<Self as Display>::fmt(self, f)
	}
}

impl Display for SocketAddr {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self.addr {
			IpAddr::V4(addr) => f.write_fmt(format_args!("{}:{}", addr, self.port)),
			IpAddr::V6(addr) => f.write_fmt(format_args!("[{}]:{}", addr, self.port)),
		}
	}
}

#[bitsize(4)]
#[derive(FromBits, PartialEq, Debug)]
pub enum Version {
	V4 = 4,
	V6 = 6,
	#[fallback]
	Unknown,
}

#[repr(u8)]
#[bitsize(8)]
#[derive(Clone, Copy, FromBits, PartialEq, Debug)]
pub enum Protocol {
	Icmp = 1,
	Tcp = 6,
	Udp = 17,
	Icmpv6 = 58,
	#[fallback]
	Unknown(u8),
}

/// Computes the pseudo-header part of an upper-layer checksum.
pub fn pseudo(src: IpAddr, dst: IpAddr, proto: Protocol, len: u16) -> Checksum {
	let proto = u8::from(proto);

	match (src, dst) {
		(IpAddr::V4(s), IpAddr::V4(d)) => {
			let mut csum = Checksum::with(&s.octets());
			csum.push_chunk(&d.octets());
			csum.push_chunk(&[0, proto, (len >> 8) as u8, len as u8]);
			csum
		}
		(IpAddr::V6(s), IpAddr::V6(d)) => {
			let mut csum = Checksum::of(&s.octets());
			csum.push(&d.octets());
			csum.push_chunk(&[0, 0, (len >> 8) as u8, len as u8]);
			csum.push_chunk(&[0, 0, 0, proto]);
			csum
		}
		_ => unreachable!("mixed address families in one packet"),
	}
}
