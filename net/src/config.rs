//! Compile-time sizing of the stack. Every table below is a fixed array;
//! nothing is allocated after startup.

use core::time::Duration;

/// Number of TCP connection slots.
pub const N_CONNS: usize = 8;
/// Number of listening TCP ports.
pub const N_LISTEN: usize = 8;
/// Number of UDP associations.
pub const N_UDP: usize = 8;
/// Number of packet buffers in the shared pool.
pub const N_BUFS: usize = 16;

/// The largest frame the stack will carry, including the IP header.
pub const MTU: usize = 1500;

/// Advertised TCP MSS for IPv4 peers.
pub const TCP_MSS_V4: u16 = 536;
/// Advertised TCP MSS for IPv6 peers.
pub const TCP_MSS_V6: u16 = 1220;

/// The retransmission timeout, in periodic ticks.
pub const RTO: i16 = 3;
/// Retransmission limit for established connections.
pub const MAX_RTX: u8 = 8;
/// Retransmission limit while a handshake is in progress.
pub const MAX_SYN_RTX: u8 = 5;
/// Ticks a connection lingers in TIME_WAIT / idle FIN_WAIT_2.
pub const TIME_WAIT_TIMEOUT: i16 = 120;

/// IP TTL for generated packets.
pub const TTL: u8 = 64;

/// Interval of the periodic timer driving retransmissions and TIME_WAIT.
pub const PERIODIC_INTERVAL: Duration = Duration::from_millis(500);

/// First ephemeral port; allocation wraps within 4096..32000.
pub const EPHEMERAL_LO: u16 = 4096;
pub const EPHEMERAL_HI: u16 = 32000;
