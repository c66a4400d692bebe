/*
[INPUT]:  Wall clock and exchange millisecond timestamps
[OUTPUT]: Microsecond epoch timestamps for output records
[POS]:    Utility - time unit conversion
[UPDATE]: When output timestamp resolution changes
*/

use chrono::Utc;

/// Current wall-clock time in microseconds since epoch.
pub fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

/// Exchange milliseconds to microseconds. A zero (missing) server time falls back to `local_us`.
pub fn server_micros(server_ms: i64, local_us: i64) -> i64 {
    if server_ms > 0 {
        server_ms.saturating_mul(1000)
    } else {
        local_us
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_micros() {
        assert_eq!(server_micros(1765418142168, 5), 1765418142168000);
        assert_eq!(server_micros(0, 42), 42);
    }

    #[test]
    fn test_now_micros_is_recent() {
        // 2020-01-01 in microseconds.
        assert!(now_micros() > 1_577_836_800_000_000);
    }
}
