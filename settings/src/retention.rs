//! The retention-RAM backend.
//!
//! Sequential `u16 len_name | u16 len_value | name | value` records. There
//! is no update-in-place: a save pass clears the whole region first and
//! rewrites the full set, so the backend only supports whole-set
//! save/load. Two zero (or two erased 0xffff) length fields terminate the
//! record stream.

use crate::{Error, LoadSink, Reader, Store, MAX_NAME_LEN, MAX_VAL_LEN};

/// The retained-memory driver contract. `clear` zero-fills the region.
pub trait Retention {
	fn size(&self) -> usize;
	fn read(&self, off: usize, buf: &mut [u8]) -> Result<(), Error>;
	fn write(&mut self, off: usize, data: &[u8]) -> Result<(), Error>;
	fn clear(&mut self) -> Result<(), Error>;
}

pub struct RetentionStore<R: Retention> {
	dev: R,
	write_pos: usize,
}

impl<R: Retention> RetentionStore<R> {
	pub fn new(dev: R) -> Self {
		Self { dev, write_pos: 0 }
	}

	pub fn into_device(self) -> R {
		self.dev
	}

	fn read_u16(&self, off: usize) -> Result<u16, Error> {
		let mut b = [0u8; 2];
		self.dev.read(off, &mut b)?;
		Ok(u16::from_le_bytes(b))
	}
}

struct RetentionReader<'a, R: Retention> {
	dev: &'a R,
	off: usize,
	remaining: usize,
	total: usize,
}

impl<R: Retention> Reader for RetentionReader<'_, R> {
	fn len(&self) -> usize {
		self.total
	}

	fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
		let n = buf.len().min(self.remaining);

		self.dev.read(self.off, &mut buf[..n])?;
		self.off += n;
		self.remaining -= n;

		Ok(n)
	}
}

impl<R: Retention> Store for RetentionStore<R> {
	fn load(&mut self, sink: &mut LoadSink) -> Result<(), Error> {
		let mut pos = 0;

		loop {
			if pos + 4 > self.dev.size() {
				return Ok(());
			}

			let len_name = self.read_u16(pos)?;
			let len_value = self.read_u16(pos + 2)?;

			// Cleared or never-written space terminates the stream.
			if (len_name == 0 && len_value == 0) || (len_name == 0xffff && len_value == 0xffff) {
				return Ok(());
			}

			let (len_name, len_value) = (len_name as usize, len_value as usize);

			if len_name > MAX_NAME_LEN || len_value > MAX_VAL_LEN || pos + 4 + len_name + len_value > self.dev.size() {
				log::warn!("settings: corrupt retention record, stopping walk");
				return Ok(());
			}

			let mut name = vec![0u8; len_name];
			self.dev.read(pos + 4, &mut name)?;

			let Ok(name) = String::from_utf8(name) else {
				log::warn!("settings: undecodable retention name, stopping walk");
				return Ok(());
			};

			let mut reader = RetentionReader {
				dev: &self.dev,
				off: pos + 4 + len_name,
				remaining: len_value,
				total: len_value,
			};

			sink(&name, &mut reader)?;

			pos += 4 + len_name + len_value;
		}
	}

	fn save(&mut self, name: &str, value: &[u8]) -> Result<(), Error> {
		// Deletions have no representation: the set was cleared at
		// save_start and absent names are simply not rewritten.
		if value.is_empty() {
			return Ok(());
		}

		if name.len() > MAX_NAME_LEN || value.len() > MAX_VAL_LEN {
			return Err(Error::TooLarge);
		}

		let need = 4 + name.len() + value.len();

		// Keep room for the terminating length pair.
		if self.write_pos + need + 4 > self.dev.size() {
			return Err(Error::NoSpace);
		}

		let mut buf = Vec::with_capacity(need);
		buf.extend_from_slice(&(name.len() as u16).to_le_bytes());
		buf.extend_from_slice(&(value.len() as u16).to_le_bytes());
		buf.extend_from_slice(name.as_bytes());
		buf.extend_from_slice(value);

		self.dev.write(self.write_pos, &buf)?;
		self.write_pos += need;

		Ok(())
	}

	/// The whole region is rewritten: clear it and restart the cursor.
	fn save_start(&mut self) -> Result<(), Error> {
		self.dev.clear()?;
		self.write_pos = 0;
		Ok(())
	}
}
