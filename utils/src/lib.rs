/// Byte-view casting for wire-format structs.
pub mod bytes;
/// Utilities for storing integer-like data in different byteorders.
pub mod endian;
/// Error-handling utilities.
pub mod error;
