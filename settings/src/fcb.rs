//! The sectored append-log backend.
//!
//! Each save appends a `len | name=value` record to the newest sector of a
//! flash ring. A record is live iff no later record carries the same name;
//! an empty value is a tombstone. One sector is always kept erased; when
//! the ring fills up, live non-tombstone records of the oldest sector are
//! carried forward and the sector is erased.

use log::{debug, warn};

use crate::{Error, LoadSink, Reader, Store};

/// The flash driver contract: uniform sectors, block-aligned writes, and
/// sector-granular erase to 0xFF.
pub trait FlashArea {
	fn sector_count(&self) -> usize;
	fn sector_size(&self) -> usize;
	/// Write-block alignment; records are padded up to it.
	fn align(&self) -> usize;
	fn read(&self, sector: usize, off: usize, buf: &mut [u8]) -> Result<(), Error>;
	fn write(&mut self, sector: usize, off: usize, data: &[u8]) -> Result<(), Error>;
	fn erase(&mut self, sector: usize) -> Result<(), Error>;
}

/// Per-sector header: magic plus a wrapping rotation sequence.
const SECTOR_HDR: usize = 4;
const SECTOR_MAGIC: u16 = 0x4C53;

fn align_up(x: usize, align: usize) -> usize {
	(x + align - 1) / align * align
}

/// Whether `a` was written before `b` in wrapping sequence order.
fn seq_before(a: u16, b: u16) -> bool {
	b.wrapping_sub(a) < 0x8000 && a != b
}

struct Rec {
	sector: usize,
	name: Vec<u8>,
	val_off: usize,
	val_len: usize,
}

pub struct FcbStore<F: FlashArea> {
	flash: F,
	oldest: usize,
	newest: usize,
	seq: u16,
	write_off: usize,
	used: usize,
}

impl<F: FlashArea> FcbStore<F> {
	/// Attaches to (or initializes) the flash region.
	pub fn new(flash: F) -> Result<Self, Error> {
		let n = flash.sector_count();

		if n < 2 || flash.sector_size() < SECTOR_HDR + 4 {
			return Err(Error::NoSpace);
		}

		let mut chain: Vec<(usize, u16)> = Vec::new();

		for s in 0..n {
			let mut hdr = [0u8; SECTOR_HDR];
			flash.read(s, 0, &mut hdr)?;

			if u16::from_le_bytes([hdr[0], hdr[1]]) == SECTOR_MAGIC {
				chain.push((s, u16::from_le_bytes([hdr[2], hdr[3]])));
			}
		}

		let mut store = Self {
			flash,
			oldest: 0,
			newest: 0,
			seq: 0,
			write_off: SECTOR_HDR,
			used: 1,
		};

		if chain.is_empty() {
			store.write_header(0, 0)?;
			return Ok(store);
		}

		let &(oldest, _) = chain.iter().min_by(|a, b| if seq_before(a.1, b.1) { core::cmp::Ordering::Less } else { core::cmp::Ordering::Greater }).unwrap();
		let &(newest, seq) = chain.iter().max_by(|a, b| if seq_before(a.1, b.1) { core::cmp::Ordering::Less } else { core::cmp::Ordering::Greater }).unwrap();

		store.oldest = oldest;
		store.newest = newest;
		store.seq = seq;
		store.used = chain.len();

		// Find the append position after the last record of the newest
		// sector.
		store.write_off = SECTOR_HDR;
		for rec in store.sector_records(newest) {
			store.write_off = align_up(rec.val_off + rec.val_len, store.flash.align());
		}

		Ok(store)
	}

	pub fn into_flash(self) -> F {
		self.flash
	}

	fn write_header(&mut self, sector: usize, seq: u16) -> Result<(), Error> {
		let mut hdr = [0u8; SECTOR_HDR];
		hdr[..2].copy_from_slice(&SECTOR_MAGIC.to_le_bytes());
		hdr[2..].copy_from_slice(&seq.to_le_bytes());

		self.flash.write(sector, 0, &hdr)
	}

	/// Walks the records of one sector in write order. A record whose
	/// length field is erased or runs past the sector ends the walk, so a
	/// torn tail never surfaces as a live record.
	fn sector_records(&self, sector: usize) -> Vec<Rec> {
		let ss = self.flash.sector_size();
		let mut out = Vec::new();
		let mut off = SECTOR_HDR;

		while off + 2 <= ss {
			let mut lenb = [0u8; 2];

			if self.flash.read(sector, off, &mut lenb).is_err() {
				break;
			}

			let len = u16::from_le_bytes(lenb) as usize;

			if len == 0 || len == 0xFFFF {
				break;
			}

			if off + 2 + len > ss {
				warn!("settings: record overruns sector {sector}, truncating walk");
				break;
			}

			let mut body = vec![0u8; len];
			if self.flash.read(sector, off + 2, &mut body).is_err() {
				break;
			}

			let Some(eq) = body.iter().position(|&b| b == b'=') else {
				warn!("settings: record without name terminator, truncating walk");
				break;
			};

			out.push(Rec {
				sector,
				name: body[..eq].to_vec(),
				val_off: off + 2 + eq + 1,
				val_len: len - eq - 1,
			});

			off += align_up(2 + len, self.flash.align());
		}

		out
	}

	/// All records, oldest sector first.
	fn records(&self) -> Vec<Rec> {
		let n = self.flash.sector_count();
		let mut out = Vec::new();

		for p in 0..self.used {
			out.extend(self.sector_records((self.oldest + p) % n));
		}

		out
	}

	fn read_value(&self, rec: &Rec) -> Result<Vec<u8>, Error> {
		let mut out = vec![0u8; rec.val_len];
		self.flash.read(rec.sector, rec.val_off, &mut out)?;
		Ok(out)
	}

	fn append(&mut self, name: &[u8], value: &[u8]) -> Result<(), Error> {
		let body_len = name.len() + 1 + value.len();
		let need = align_up(2 + body_len, self.flash.align());
		let capacity = self.flash.sector_size() - SECTOR_HDR;

		if body_len >= 0xFFFF || need > capacity {
			return Err(Error::TooLarge);
		}

		let mut guard = 0;

		while self.write_off + need > self.flash.sector_size() {
			self.advance_sector()?;

			guard += 1;
			if guard > self.flash.sector_count() {
				return Err(Error::NoSpace);
			}
		}

		// Pad bytes stay erased so the next length read terminates the
		// walk.
		let mut buf = vec![0xFF; need];
		buf[..2].copy_from_slice(&(body_len as u16).to_le_bytes());
		buf[2..2 + name.len()].copy_from_slice(name);
		buf[2 + name.len()] = b'=';
		buf[2 + name.len() + 1..2 + body_len].copy_from_slice(value);

		self.flash.write(self.newest, self.write_off, &buf)?;
		self.write_off += need;

		Ok(())
	}

	/// Moves the append point into the spare sector, compacting when that
	/// was the last free one.
	fn advance_sector(&mut self) -> Result<(), Error> {
		let n = self.flash.sector_count();
		let next = (self.newest + 1) % n;

		self.seq = self.seq.wrapping_add(1);
		self.write_header(next, self.seq)?;
		self.newest = next;
		self.write_off = SECTOR_HDR;
		self.used += 1;

		if self.used == n {
			self.compress()?;
		}

		Ok(())
	}

	/// Carries the oldest sector's live non-tombstone records forward and
	/// erases it, restoring the spare.
	fn compress(&mut self) -> Result<(), Error> {
		debug!("settings: compressing sector {}", self.oldest);

		let recs = self.records();

		for (i, rec) in recs.iter().enumerate() {
			if rec.sector != self.oldest || rec.val_len == 0 {
				continue;
			}

			// Superseded records stay behind.
			if recs[i + 1..].iter().any(|r| r.name == rec.name) {
				continue;
			}

			let value = self.read_value(rec)?;
			let name = rec.name.clone();

			self.append(&name, &value)?;
		}

		self.flash.erase(self.oldest)?;
		self.oldest = (self.oldest + 1) % self.flash.sector_count();
		self.used -= 1;

		Ok(())
	}
}

/// Streams a value straight out of flash.
struct FlashReader<'a, F: FlashArea> {
	flash: &'a F,
	sector: usize,
	off: usize,
	remaining: usize,
	total: usize,
}

impl<F: FlashArea> Reader for FlashReader<'_, F> {
	fn len(&self) -> usize {
		self.total
	}

	fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
		let n = buf.len().min(self.remaining);

		self.flash.read(self.sector, self.off, &mut buf[..n])?;
		self.off += n;
		self.remaining -= n;

		Ok(n)
	}
}

impl<F: FlashArea> Store for FcbStore<F> {
	fn load(&mut self, sink: &mut LoadSink) -> Result<(), Error> {
		let recs = self.records();

		for (i, rec) in recs.iter().enumerate() {
			// Only the last record for a name is live, and a tombstone
			// hides the name entirely.
			if rec.val_len == 0 || recs[i + 1..].iter().any(|r| r.name == rec.name) {
				continue;
			}

			let Ok(name) = core::str::from_utf8(&rec.name) else {
				warn!("settings: undecodable record name, skipping");
				continue;
			};

			let mut reader = FlashReader {
				flash: &self.flash,
				sector: rec.sector,
				off: rec.val_off,
				remaining: rec.val_len,
				total: rec.val_len,
			};

			sink(name, &mut reader)?;
		}

		Ok(())
	}

	fn save(&mut self, name: &str, value: &[u8]) -> Result<(), Error> {
		let recs = self.records();
		let last = recs.iter().rev().find(|r| r.name == name.as_bytes());

		// Don't store duplicate values, and don't tombstone a name that is
		// already absent.
		match last {
			Some(rec) if rec.val_len == value.len() && self.read_value(rec)? == value => return Ok(()),
			None if value.is_empty() => return Ok(()),
			_ => {}
		}

		self.append(name.as_bytes(), value)
	}
}
