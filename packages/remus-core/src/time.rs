//! Clock helpers. Every persisted timestamp in the node is unix milliseconds.

use chrono::Utc;

/// Current unix time in milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Current unix time in seconds.
pub fn now_secs() -> i64 {
    Utc::now().timestamp()
}
