//! Connection id generation.
//!
//! Ids are the nanosecond wall clock rendered in base-36: short,
//! time-ordered, and unique enough for a registry of live connections
//! (two upgrades would need to land on the same nanosecond to collide).

use std::time::{SystemTime, UNIX_EPOCH};

/// Generate a connection id: current Unix time in nanoseconds, base-36.
pub fn connection_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    to_base36(nanos)
}

fn to_base36(mut value: u128) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    // u128 needs at most 25 base-36 digits.
    let mut buf = [0u8; 25];
    let mut at = buf.len();
    while value > 0 {
        at -= 1;
        buf[at] = DIGITS[(value % 36) as usize];
        value /= 36;
    }
    String::from_utf8_lossy(&buf[at..]).into_owned()
}
