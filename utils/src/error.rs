#[doc(hidden)]
pub trait Ext<T, E> {
	/// Converts a `Result` into an `Option`, handing the error to `f`. Used
	/// to log an error at the site where it is discovered and continue.
	fn ok_or(self, f: impl FnOnce(E)) -> Option<T>;
}

impl<T, E> Ext<T, E> for result::Result<T, E> {
	fn ok_or(self, f: impl FnOnce(E)) -> Option<T> {
		match self {
			Ok(v) => Some(v),
			Err(e) => {
				f(e);
				None
			}
		}
	}
}

#[doc(hidden)]
pub trait ExtOpaque<T> {
	/// Runs `f` when the option is empty, passing the option through.
	fn some_or(self, f: impl FnOnce()) -> Option<T>;
}

impl<T> ExtOpaque<T> for Option<T> {
	fn some_or(self, f: impl FnOnce()) -> Option<T> {
		if self.is_none() {
			f();
		}

		self
	}
}

/// The data-plane result type. The error carries no payload; failures are
/// logged where they are found.
pub type Result<T = (), E = ()> = result::Result<T, E>;

use core::result;

pub use Ext as _;
