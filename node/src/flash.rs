//! A RAM-backed flash region standing in for the board's storage driver.
//! It keeps the driver contract (sector granularity, erase-to-0xFF,
//! block-aligned writes) so the settings log behaves as it would on
//! hardware.

use settings::fcb::FlashArea;
use settings::Error;

pub struct RamFlash {
	sectors: Vec<Vec<u8>>,
	sector_size: usize,
}

impl RamFlash {
	pub fn new(sector_count: usize, sector_size: usize) -> Self {
		Self {
			sectors: vec![vec![0xFF; sector_size]; sector_count],
			sector_size,
		}
	}
}

impl FlashArea for RamFlash {
	fn sector_count(&self) -> usize {
		self.sectors.len()
	}

	fn sector_size(&self) -> usize {
		self.sector_size
	}

	fn align(&self) -> usize {
		4
	}

	fn read(&self, sector: usize, off: usize, buf: &mut [u8]) -> Result<(), Error> {
		let s = self.sectors.get(sector).ok_or(Error::Io)?;
		buf.copy_from_slice(s.get(off..off + buf.len()).ok_or(Error::Io)?);
		Ok(())
	}

	fn write(&mut self, sector: usize, off: usize, data: &[u8]) -> Result<(), Error> {
		let s = self.sectors.get_mut(sector).ok_or(Error::Io)?;
		s.get_mut(off..off + data.len()).ok_or(Error::Io)?.copy_from_slice(data);
		Ok(())
	}

	fn erase(&mut self, sector: usize) -> Result<(), Error> {
		self.sectors.get_mut(sector).ok_or(Error::Io)?.fill(0xFF);
		Ok(())
	}
}
