//! Timestamps as unix seconds. Good enough for `created`/`updated` metadata
//! and conflict-rename suffixes; ordering across devices is advisory only.

use std::time::{SystemTime, UNIX_EPOCH};

pub type Timestamp = u64;

/// Current time as unix seconds.
pub fn now_ts() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
