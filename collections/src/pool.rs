use core::fmt;

/// A handle to an entry in a [`Pool`]. Plain index; entries are correlated
/// by protocol keys (MID, ports, tokens), so no generation tag is carried.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(usize);

impl Handle {
	#[inline]
	pub fn index(self) -> usize {
		self.0
	}
}

impl fmt::Debug for Handle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "#{}", self.0)
	}
}

/// A fixed-capacity slot pool. Allocation scans for the first free slot;
/// exhaustion is an `None`, never an allocation.
pub struct Pool<T, const N: usize> {
	slots: [Option<T>; N],
}

impl<T, const N: usize> Default for Pool<T, N> {
	fn default() -> Self {
		Self { slots: core::array::from_fn(|_| None) }
	}
}

impl<T, const N: usize> Pool<T, N> {
	/// Places `t` into the first free slot, returning its handle, or gives
	/// `t` back when the pool is full.
	pub fn alloc(&mut self, t: T) -> Result<Handle, T> {
		match self.slots.iter_mut().enumerate().find(|(_, s)| s.is_none()) {
			Some((i, slot)) => {
				*slot = Some(t);
				Ok(Handle(i))
			}
			None => Err(t),
		}
	}

	#[inline]
	pub fn get(&self, h: Handle) -> Option<&T> {
		self.slots.get(h.0)?.as_ref()
	}

	#[inline]
	pub fn get_mut(&mut self, h: Handle) -> Option<&mut T> {
		self.slots.get_mut(h.0)?.as_mut()
	}

	/// Releases the slot, returning its contents.
	pub fn free(&mut self, h: Handle) -> Option<T> {
		self.slots.get_mut(h.0)?.take()
	}

	pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
		self.slots.iter().enumerate().filter_map(|(i, s)| Some((Handle(i), s.as_ref()?)))
	}

	pub fn iter_mut(&mut self) -> impl Iterator<Item = (Handle, &mut T)> {
		self.slots.iter_mut().enumerate().filter_map(|(i, s)| Some((Handle(i), s.as_mut()?)))
	}

	/// Finds the first live entry satisfying `f`.
	pub fn find(&self, mut f: impl FnMut(&T) -> bool) -> Option<Handle> {
		self.iter().find(|(_, t)| f(t)).map(|(h, _)| h)
	}

	/// Drops every live entry that fails the predicate, returning how many
	/// were removed.
	pub fn retain(&mut self, mut f: impl FnMut(&T) -> bool) -> usize {
		let mut removed = 0;

		for slot in &mut self.slots {
			if slot.as_ref().is_some_and(|t| !f(t)) {
				*slot = None;
				removed += 1;
			}
		}

		removed
	}

	pub fn len(&self) -> usize {
		self.slots.iter().filter(|s| s.is_some()).count()
	}

	pub fn is_empty(&self) -> bool {
		self.slots.iter().all(|s| s.is_none())
	}
}
