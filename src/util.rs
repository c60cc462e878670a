//! Shared utility functions.

use crate::error::{Error, Result};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();

    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Convert a MAC address to the host's native form: twelve hex digits with
/// no separators, e.g. `02:00:4c:4f:4f:50` becomes `02004c4f4f50`.
pub fn native_mac(mac: &str) -> Result<String> {
    let digits: String = mac.chars().filter(|c| *c != ':' && *c != '-').collect();
    if digits.len() != 12 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::InvalidCommand(format!("invalid MAC address '{}'", mac)));
    }
    Ok(digits)
}
