use std::sync::OnceLock;
use std::time::{Instant, SystemTime};

/// 100ns ticks, as used throughout the wire format and the timer deadlines.
pub type DateTime = i64;

pub const TICKS_PER_MSEC: i64 = 10_000;
pub const TICKS_PER_SEC: i64 = 1_000 * TICKS_PER_MSEC;

/// Offset between the Windows/OPC UA epoch (1601-01-01) and the Unix epoch,
/// in 100ns ticks. Mirrors the constant used throughout the original C stack.
pub const UNIX_TO_OPCUA_EPOCH_OFFSET: i64 = 11_644_473_600 * TICKS_PER_SEC;

fn monotonic_anchor() -> &'static Instant {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    ANCHOR.get_or_init(Instant::now)
}

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01).
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_secs()
}

/// Monotonic "DateTime" in 100ns ticks since an arbitrary, process-local
/// epoch. Never observed to go backwards; the only thing that matters is
/// the difference between two readings.
#[inline]
pub fn now_monotonic() -> DateTime {
    let elapsed = monotonic_anchor().elapsed();
    elapsed.as_secs() as i64 * TICKS_PER_SEC + i64::from(elapsed.subsec_nanos()) / 100
}

/// Wall-clock "DateTime" in 100ns ticks since the OPC UA (1601) epoch.
#[inline]
pub fn now_utc() -> DateTime {
    let since_unix = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("system clock is before the Unix epoch");
    since_unix.as_secs() as i64 * TICKS_PER_SEC
        + i64::from(since_unix.subsec_nanos()) / 100
        + UNIX_TO_OPCUA_EPOCH_OFFSET
}

/// Converts a `DateTime` in the 100ns-since-1601 domain into nanoseconds
/// since the Unix epoch, as required by `SO_TXTIME` control messages.
#[inline]
pub fn to_unix_nanos(dt: DateTime) -> i64 {
    (dt - UNIX_TO_OPCUA_EPOCH_OFFSET) * 100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_is_nondecreasing() {
        let a = now_monotonic();
        let b = now_monotonic();
        assert!(b >= a);
    }

    #[test]
    fn unix_nanos_roundtrip_is_scaled_by_100() {
        let dt = UNIX_TO_OPCUA_EPOCH_OFFSET + 12_345 * TICKS_PER_SEC;
        assert_eq!(to_unix_nanos(dt), 12_345 * 1_000_000_000);
    }
}
