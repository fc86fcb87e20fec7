#![forbid(unsafe_code)]

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in unix milliseconds. Display-only; never an
/// ordering key.
pub fn unix_ms_now() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or_default()
		.as_millis() as i64
}
