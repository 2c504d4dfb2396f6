//! RAM simulators for the storage driver traits, plus small helpers.
#![allow(dead_code)]

use std::cell::Cell;
use std::collections::HashMap;

use settings::eeprom::Eeprom;
use settings::fcb::FlashArea;
use settings::retention::Retention;
use settings::zms::IdStore;
use settings::{read_value, Error, Store};

/// Sectored flash with erase-to-0xFF semantics and a write counter.
pub struct SimFlash {
	pub sectors: Vec<Vec<u8>>,
	pub sector_size: usize,
	pub align: usize,
	pub writes: Cell<usize>,
}

impl SimFlash {
	pub fn new(sector_count: usize, sector_size: usize, align: usize) -> Self {
		Self {
			sectors: vec![vec![0xFF; sector_size]; sector_count],
			sector_size,
			align,
			writes: Cell::new(0),
		}
	}
}

impl FlashArea for SimFlash {
	fn sector_count(&self) -> usize {
		self.sectors.len()
	}

	fn sector_size(&self) -> usize {
		self.sector_size
	}

	fn align(&self) -> usize {
		self.align
	}

	fn read(&self, sector: usize, off: usize, buf: &mut [u8]) -> Result<(), Error> {
		let s = self.sectors.get(sector).ok_or(Error::Io)?;
		buf.copy_from_slice(s.get(off..off + buf.len()).ok_or(Error::Io)?);
		Ok(())
	}

	fn write(&mut self, sector: usize, off: usize, data: &[u8]) -> Result<(), Error> {
		self.writes.set(self.writes.get() + 1);

		let s = self.sectors.get_mut(sector).ok_or(Error::Io)?;
		s.get_mut(off..off + data.len()).ok_or(Error::Io)?.copy_from_slice(data);
		Ok(())
	}

	fn erase(&mut self, sector: usize) -> Result<(), Error> {
		self.sectors.get_mut(sector).ok_or(Error::Io)?.fill(0xFF);
		Ok(())
	}
}

pub struct SimEeprom {
	pub data: Vec<u8>,
	pub writes: Cell<usize>,
}

impl SimEeprom {
	pub fn new(size: usize) -> Self {
		Self { data: vec![0xFF; size], writes: Cell::new(0) }
	}
}

impl Eeprom for SimEeprom {
	fn size(&self) -> usize {
		self.data.len()
	}

	fn read(&self, off: usize, buf: &mut [u8]) -> Result<(), Error> {
		buf.copy_from_slice(self.data.get(off..off + buf.len()).ok_or(Error::Io)?);
		Ok(())
	}

	fn write(&mut self, off: usize, data: &[u8]) -> Result<(), Error> {
		self.writes.set(self.writes.get() + 1);
		self.data.get_mut(off..off + data.len()).ok_or(Error::Io)?.copy_from_slice(data);
		Ok(())
	}
}

pub struct SimRetention {
	pub data: Vec<u8>,
}

impl SimRetention {
	pub fn new(size: usize) -> Self {
		Self { data: vec![0xFF; size] }
	}
}

impl Retention for SimRetention {
	fn size(&self) -> usize {
		self.data.len()
	}

	fn read(&self, off: usize, buf: &mut [u8]) -> Result<(), Error> {
		buf.copy_from_slice(self.data.get(off..off + buf.len()).ok_or(Error::Io)?);
		Ok(())
	}

	fn write(&mut self, off: usize, data: &[u8]) -> Result<(), Error> {
		self.data.get_mut(off..off + data.len()).ok_or(Error::Io)?.copy_from_slice(data);
		Ok(())
	}

	fn clear(&mut self) -> Result<(), Error> {
		self.data.fill(0);
		Ok(())
	}
}

#[derive(Default)]
pub struct SimIdStore {
	pub entries: HashMap<u32, Vec<u8>>,
}

impl IdStore for SimIdStore {
	fn length(&self, id: u32) -> Result<usize, Error> {
		self.entries.get(&id).map(|v| v.len()).ok_or(Error::NotFound)
	}

	fn read(&self, id: u32, buf: &mut [u8]) -> Result<usize, Error> {
		let v = self.entries.get(&id).ok_or(Error::NotFound)?;
		let n = buf.len().min(v.len());
		buf[..n].copy_from_slice(&v[..n]);
		Ok(n)
	}

	fn write(&mut self, id: u32, data: &[u8]) -> Result<(), Error> {
		self.entries.insert(id, data.to_vec());
		Ok(())
	}

	fn delete(&mut self, id: u32) -> Result<(), Error> {
		self.entries.remove(&id).map(|_| ()).ok_or(Error::NotFound)
	}
}

/// Collects every live record a store delivers, in walk order.
pub fn load_all(store: &mut dyn Store) -> Vec<(String, Vec<u8>)> {
	let mut out = Vec::new();

	store
		.load(&mut |name, reader| {
			out.push((name.to_string(), read_value(reader).unwrap()));
			Ok(())
		})
		.unwrap();

	out
}
