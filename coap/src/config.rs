//! Compile-time sizing and protocol timing. Pools are fixed arrays; the
//! timing constants follow RFC 7252 §4.8 with ACK_RANDOM_FACTOR 1.5.

/// Engine time, in milliseconds since context start.
pub type Ticks = u64;

/// Concurrent messages that can be held for retransmission.
pub const MAX_OPEN_TRANSACTIONS: usize = 4;

/// Server-side observer slots.
pub const MAX_OBSERVERS: usize = MAX_OPEN_TRANSACTIONS - 1;

/// Client-side observee slots.
pub const MAX_OBSERVEES: usize = 4;

/// Every this many notifications, a NON notification is promoted to CON to
/// verify the observer is still alive.
pub const OBSERVE_REFRESH_INTERVAL: u32 = 20;

/// Retransmissions of a CON before the sender gives up.
pub const MAX_RETRANSMIT: u8 = 4;

/// Base ACK timeout.
pub const RESPONSE_TIMEOUT: Ticks = 2000;

/// The initial retransmission interval is `RESPONSE_TIMEOUT` plus a random
/// value below this, yielding the \[1.0, 1.5) ACK_RANDOM_FACTOR window.
pub const BACKOFF_JITTER: Ticks = RESPONSE_TIMEOUT / 2 + 1;

/// Largest payload chunk a resource handler produces at once.
pub const REST_MAX_CHUNK_SIZE: usize = 256;

/// Conservative bound for a serialized header: base header, token, three
/// small integer options, two ETags, Observe, Block, and path text.
pub const MAX_HEADER_SIZE: usize = 4 + TOKEN_LEN + 3 + 1 + ETAG_LEN + 4 + 4 + 30;

pub const MAX_PACKET_SIZE: usize = MAX_HEADER_SIZE + REST_MAX_CHUNK_SIZE;

/// Preferred block size for blockwise transfers; a power of two within
/// [16, 2048] no larger than the chunk size.
pub const MAX_BLOCK_SIZE: u16 = 256;

pub const TOKEN_LEN: usize = 8;
pub const ETAG_LEN: usize = 8;

/// Max-Age when the option is absent.
pub const DEFAULT_MAX_AGE: u32 = 60;

pub const DEFAULT_PORT: u16 = 5683;
pub const DEFAULT_SECURE_PORT: u16 = 5684;
