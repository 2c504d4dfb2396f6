use core::net::Ipv6Addr;

use bilge::prelude::*;
use utils::bytes::{self, Cast};
use utils::endian::{b, u16be, BigEndian};

use super::Protocol;

pub(crate) const HLEN: usize = 40;

#[bitsize(32)]
#[derive(FromBits, Clone, Copy)]
pub(crate) struct Meta {
	pub flow: u20,
	pub class: u8,
	pub ver: super::Version,
}

#[derive(Cast)]
#[repr(C)]
pub(crate) struct Header {
	pub ver: BigEndian<Meta>,
	/// Length of the payload following the fixed header.
	pub len: u16be,
	pub nxt: b<Protocol>,
	pub ttl: u8,
	pub src: [u8; 16],
	pub dst: [u8; 16],
}

impl Header {
	pub fn of(data: &[u8]) -> &Self {
		bytes::cast(&data[..HLEN])
	}

	pub fn of_mut(data: &mut [u8]) -> &mut Self {
		bytes::cast_mut(&mut data[..HLEN])
	}
}

/// Writes a fresh header over `data[..HLEN]`.
pub(crate) fn fill(data: &mut [u8], src: Ipv6Addr, dst: Ipv6Addr, proto: Protocol, payload: usize, ttl: u8) {
	let header = Header::of_mut(data);

	header.ver = Meta::new(u20::new(0), 0, super::Version::V6).into();
	header.len = (payload as u16).into();
	header.nxt = proto.into();
	header.ttl = ttl;
	header.src = src.octets();
	header.dst = dst.octets();
}
