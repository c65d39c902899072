//! Millisecond unix timestamps
//!
//! The pool and credential store represent every timestamp as an absolute
//! unix millisecond value (never a delta, never `Instant`), so they survive
//! a process restart and serialize directly into the persisted document.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as milliseconds since the unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
