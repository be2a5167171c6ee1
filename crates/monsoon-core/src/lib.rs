//! Foundational low-level utilities shared across Monsoon crates.
//!
//! Provides atomic file-write helpers and time utilities used by the delivery
//! backlog journal and runtime summaries.

pub mod atomic_io;
pub mod time_utils;

pub use atomic_io::write_text_atomic;
pub use time_utils::current_unix_timestamp_ms;
