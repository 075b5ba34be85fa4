pub mod channel;
pub mod ids;
pub mod session;

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch.
///
/// All timestamps carried in session records and outbound envelopes use this
/// clock.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|it| it.as_millis() as u64)
        .unwrap_or(0)
}
