//! Persistent key/value settings.
//!
//! Names are dotted paths (`a/b/c`); values are opaque byte strings
//! delivered through lazy readers. Handlers own name prefixes and resolve
//! by longest-prefix match with a `/` boundary. Storage backends implement
//! [`Store`] over narrow driver traits; whatever the physical layout, at
//! most one live value per name survives a load.

use std::sync::Mutex;

use log::{debug, warn};

pub mod eeprom;
pub mod fcb;
pub mod retention;
pub mod zms;

/// Longest stored name, excluding any terminator.
pub const MAX_NAME_LEN: usize = 63;
/// Longest stored value.
pub const MAX_VAL_LEN: usize = 256;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Error {
	/// The backing store is full, even after compaction.
	NoSpace,
	NotFound,
	TooLarge,
	/// A stored record failed validation and was treated as absent.
	Corrupt,
	Exists,
	Io,
}

/// Lazy access to a stored value.
pub trait Reader {
	/// Total value length.
	fn len(&self) -> usize;

	fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Copies the next bytes of the value into `buf`, returning how many
	/// were produced; zero at the end.
	fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error>;
}

/// Reads a whole value out of a reader.
pub fn read_value(r: &mut dyn Reader) -> Result<Vec<u8>, Error> {
	let mut out = vec![0; r.len()];
	let mut pos = 0;

	while pos < out.len() {
		let n = r.read(&mut out[pos..])?;

		if n == 0 {
			return Err(Error::Corrupt);
		}

		pos += n;
	}

	Ok(out)
}

/// A reader over an in-memory value, for runtime sets and tests.
pub struct SliceReader<'a> {
	data: &'a [u8],
	pos: usize,
}

impl<'a> SliceReader<'a> {
	pub fn new(data: &'a [u8]) -> Self {
		Self { data, pos: 0 }
	}
}

impl Reader for SliceReader<'_> {
	fn len(&self) -> usize {
		self.data.len()
	}

	fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
		let n = buf.len().min(self.data.len() - self.pos);
		buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
		self.pos += n;
		Ok(n)
	}
}

/// A consumer of settings under a name prefix.
pub trait Handler {
	/// The owned prefix, e.g. `net` or `net/ip`.
	fn name(&self) -> &str;

	/// Applies a loaded or runtime value. `key` is the name with the
	/// handler prefix stripped ("" for the prefix itself).
	fn set(&mut self, key: &str, value: &mut dyn Reader) -> Result<(), Error>;

	/// All values of a load pass have been delivered.
	fn commit(&mut self) -> Result<(), Error> {
		Ok(())
	}

	/// Writes the handler's current values through `save`.
	fn export(&mut self, _save: &mut dyn FnMut(&str, &[u8]) -> Result<(), Error>) -> Result<(), Error> {
		Ok(())
	}

	/// Reads a current value back for runtime access.
	fn get(&mut self, _key: &str, _buf: &mut [u8]) -> Result<usize, Error> {
		Err(Error::NotFound)
	}
}

/// The sink a store feeds records into during a load walk.
pub type LoadSink<'s> = dyn FnMut(&str, &mut dyn Reader) -> Result<(), Error> + 's;

/// A storage backend.
pub trait Store {
	/// Walks the live records in storage order. Superseded and tombstoned
	/// names are not delivered.
	fn load(&mut self, sink: &mut LoadSink) -> Result<(), Error>;

	/// Persists one value; an empty `value` deletes the name.
	fn save(&mut self, name: &str, value: &[u8]) -> Result<(), Error>;

	/// A full-set save is starting.
	fn save_start(&mut self) -> Result<(), Error> {
		Ok(())
	}

	fn save_end(&mut self) -> Result<(), Error> {
		Ok(())
	}
}

/// Compares `name` against the prefix `key` with the `/` boundary rule.
/// Returns the remainder after the boundary: `Some("bar")` for
/// `("foo/bar", "foo")`, `Some("")` for an exact match, and `None` for
/// `("foobar", "foo")`.
pub fn name_steq<'a>(name: &'a str, key: &str) -> Option<&'a str> {
	let rest = name.strip_prefix(key)?;

	match rest.as_bytes().first() {
		None => Some(rest),
		Some(b'/') => Some(&rest[1..]),
		Some(_) => None,
	}
}

/// Splits the first `/`-delimited element off `name`, returning it and the
/// remainder.
pub fn name_next(name: &str) -> (&str, Option<&str>) {
	match name.split_once('/') {
		Some((head, tail)) => (head, Some(tail)),
		None => (name, None),
	}
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct StoreId(usize);

/// The settings registry: handlers, load sources, and the save destination.
#[derive(Default)]
pub struct Settings {
	/// Registration and commit serialize against load through this lock;
	/// handlers themselves run single-threaded.
	handlers: Mutex<Vec<Box<dyn Handler>>>,
	stores: Vec<Box<dyn Store>>,
	srcs: Vec<usize>,
	dst: Option<usize>,
}

impl Settings {
	pub fn new() -> Self {
		Self::default()
	}

	/// Installs a handler; prefixes must be unique.
	pub fn register(&mut self, handler: Box<dyn Handler>) -> Result<(), Error> {
		let mut handlers = self.handlers.lock().unwrap();

		if handlers.iter().any(|h| h.name() == handler.name()) {
			return Err(Error::Exists);
		}

		handlers.push(handler);
		Ok(())
	}

	/// Adds a store to the load path.
	pub fn src_register(&mut self, store: Box<dyn Store>) -> StoreId {
		self.stores.push(store);
		let id = StoreId(self.stores.len() - 1);
		self.srcs.push(id.0);
		id
	}

	/// Selects the save destination.
	pub fn dst_register(&mut self, id: StoreId) {
		self.dst = Some(id.0);
	}

	pub fn load(&mut self) -> Result<(), Error> {
		self.load_subtree(None)
	}

	/// Loads every live record (optionally restricted to `subtree`) into
	/// the registered handlers, then commits.
	pub fn load_subtree(&mut self, subtree: Option<&str>) -> Result<(), Error> {
		{
			let mut guard = self.handlers.lock().unwrap();
			let handlers = &mut *guard;

			for &i in &self.srcs {
				self.stores[i].load(&mut |name, reader| dispatch(handlers, subtree, name, reader))?;
			}
		}

		self.commit_subtree(subtree)
	}

	/// Loads records directly into `cb`, bypassing the handler table. The
	/// callback sees names with `subtree` stripped.
	pub fn load_subtree_direct(&mut self, subtree: Option<&str>, cb: &mut LoadSink) -> Result<(), Error> {
		let _guard = self.handlers.lock().unwrap();

		for &i in &self.srcs {
			self.stores[i].load(&mut |name, reader| {
				let key = match subtree {
					Some(st) => match name_steq(name, st) {
						Some(rest) => rest,
						None => return Ok(()),
					},
					None => name,
				};

				cb(key, reader)
			})?;
		}

		Ok(())
	}

	/// Persists one value; later loads yield it until overwritten.
	pub fn save_one(&mut self, name: &str, value: &[u8]) -> Result<(), Error> {
		if name.len() > MAX_NAME_LEN {
			return Err(Error::TooLarge);
		}

		if value.len() > MAX_VAL_LEN {
			return Err(Error::TooLarge);
		}

		let dst = self.dst.ok_or(Error::NotFound)?;
		let _guard = self.handlers.lock().unwrap();

		self.stores[dst].save(name, value)
	}

	/// Tombstones a name; a later save resurrects it.
	pub fn delete(&mut self, name: &str) -> Result<(), Error> {
		self.save_one(name, &[])
	}

	/// Exports every handler's values into the destination store.
	pub fn save(&mut self) -> Result<(), Error> {
		self.save_subtree(None)
	}

	pub fn save_subtree(&mut self, subtree: Option<&str>) -> Result<(), Error> {
		let dst = self.dst.ok_or(Error::NotFound)?;

		self.stores[dst].save_start()?;

		let mut rc = Ok(());

		{
			let mut guard = self.handlers.lock().unwrap();
			let handlers = &mut *guard;
			let store = &mut self.stores[dst];

			for h in handlers.iter_mut() {
				if subtree.is_some_and(|st| name_steq(h.name(), st).is_none()) {
					continue;
				}

				let r = h.export(&mut |name, value| store.save(name, value));

				if rc.is_ok() {
					rc = r;
				}
			}
		}

		self.stores[dst].save_end()?;
		rc
	}

	pub fn commit(&mut self) -> Result<(), Error> {
		self.commit_subtree(None)
	}

	pub fn commit_subtree(&mut self, subtree: Option<&str>) -> Result<(), Error> {
		let mut rc = Ok(());

		let mut guard = self.handlers.lock().unwrap();
		let handlers = &mut *guard;

		for h in handlers.iter_mut() {
			if subtree.is_some_and(|st| name_steq(h.name(), st).is_none()) {
				continue;
			}

			let r = h.commit();

			if rc.is_ok() {
				rc = r;
			}
		}

		rc
	}

	/// Applies a value to its handler without touching storage.
	pub fn runtime_set(&mut self, name: &str, value: &[u8]) -> Result<(), Error> {
		let mut guard = self.handlers.lock().unwrap();
		dispatch(&mut guard, None, name, &mut SliceReader::new(value))
	}

	/// Reads a value back from its handler.
	pub fn runtime_get(&mut self, name: &str, buf: &mut [u8]) -> Result<usize, Error> {
		let mut guard = self.handlers.lock().unwrap();
		let handlers = &mut *guard;

		let (idx, key) = lookup(handlers, name).ok_or(Error::NotFound)?;
		let key = key.to_string();

		handlers[idx].get(&key, buf)
	}
}

/// Longest-prefix handler lookup; returns the index and the remaining key.
fn lookup<'a>(handlers: &[Box<dyn Handler>], name: &'a str) -> Option<(usize, &'a str)> {
	let mut best: Option<(usize, &'a str)> = None;

	for (i, h) in handlers.iter().enumerate() {
		if let Some(rest) = name_steq(name, h.name()) {
			match best {
				Some((b, _)) if handlers[b].name().len() >= h.name().len() => {}
				_ => best = Some((i, rest)),
			}
		}
	}

	best
}

/// Routes one record: subtree filter, then the longest-prefix handler.
/// Handler failures are logged and skipped so one bad value cannot abort a
/// whole load walk.
fn dispatch(handlers: &mut Vec<Box<dyn Handler>>, subtree: Option<&str>, name: &str, reader: &mut dyn Reader) -> Result<(), Error> {
	if let Some(st) = subtree {
		if name_steq(name, st).is_none() {
			return Ok(());
		}
	}

	let Some((idx, key)) = lookup(handlers, name) else {
		debug!("settings: no handler for {name}");
		return Ok(());
	};

	let key = key.to_string();

	if let Err(e) = handlers[idx].set(&key, reader) {
		warn!("settings: set failed for {name}: {e:?}");
	}

	Ok(())
}
