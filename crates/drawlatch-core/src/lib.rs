//! Foundational low-level utilities shared across Drawlatch crates.
//!
//! Provides atomic file-write helpers, hex codecs, and time utilities used by
//! key persistence, config mutation, and event timestamping.

pub mod atomic_io;
pub mod hex;
pub mod time_utils;

pub use atomic_io::{write_text_atomic, write_text_atomic_with_mode};
pub use hex::{decode_hex, encode_hex};
pub use time_utils::{current_unix_timestamp, current_unix_timestamp_ms, rfc3339_timestamp};
