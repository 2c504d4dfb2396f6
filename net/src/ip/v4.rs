use core::net::Ipv4Addr;

use bilge::prelude::*;
use utils::bytes::{self, Cast};
use utils::endian::{b, u16be};

use super::{Checksum, Protocol};

pub(crate) const HLEN: usize = 20;

/// Version/IHL byte. The stack only generates and accepts the optionless
/// 20-byte header (0x45).
#[bitsize(8)]
#[derive(FromBits, Clone, Copy)]
pub(crate) struct Meta {
	pub ihl: u4,
	pub ver: super::Version,
}

/// Flags plus fragment offset.
#[bitsize(16)]
#[derive(FromBits, Clone, Copy)]
pub(crate) struct Fragment {
	pub ofst: u13,
	pub more: bool,
	pub dont: bool,
	pub reserved: bool,
}

#[derive(Cast)]
#[repr(C)]
pub(crate) struct Header {
	pub ver: b<Meta>,
	pub tos: u8,
	pub len: u16be,
	pub id: u16be,
	pub frg: b<Fragment>,
	pub ttl: u8,
	pub proto: b<Protocol>,
	pub csm: [u8; 2],
	pub src: [u8; 4],
	pub dst: [u8; 4],
}

impl Header {
	pub fn of(data: &[u8]) -> &Self {
		bytes::cast(&data[..HLEN])
	}

	pub fn of_mut(data: &mut [u8]) -> &mut Self {
		bytes::cast_mut(&mut data[..HLEN])
	}
}

/// Writes a fresh header over `data[..HLEN]` and stamps the checksum.
pub(crate) fn fill(data: &mut [u8], src: Ipv4Addr, dst: Ipv4Addr, proto: Protocol, total: usize, id: u16, ttl: u8) {
	let header = Header::of_mut(data);

	header.ver = Meta::new(u4::new(5), super::Version::V4).into();
	header.tos = 0;
	header.len = (total as u16).into();
	header.id = id.into();
	header.frg = Fragment::new(u13::new(0), false, false).into();
	header.ttl = ttl;
	header.proto = proto.into();
	header.src = src.octets();
	header.dst = dst.octets();

	header.csm = [0, 0];
	header.csm = Checksum::of(bytes::as_slice(header)).end();
}
