use core::time::Duration;
use std::time::SystemTime;

/// How long the runtime has been executing.
pub fn uptime(core: &stakker::Core) -> Duration {
	core.now() - core.start_instant()
}

/// The current wall-clock time, reconstructed from the monotonic clock so
/// that host clock steps after startup cannot move it backwards.
pub fn system(core: &stakker::Core) -> SystemTime {
	core.systime() + uptime(core)
}

/// Seconds since the UNIX epoch, in the 32-bit width the wire formats
/// carry. A clock set before 1970 reads as zero.
pub fn unix(core: &stakker::Core) -> u32 {
	system(core)
		.duration_since(SystemTime::UNIX_EPOCH)
		.map_or(0, |d| d.as_secs() as u32)
}
