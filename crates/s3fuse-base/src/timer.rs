//! HTTP timestamp helpers.

use chrono::{DateTime, Utc};

/// Current time formatted for a `Date` header (RFC 1123, always GMT).
pub fn http_time() -> String {
    format_http_time(Utc::now())
}

/// Formats an arbitrary instant for a `Date` header.
pub fn format_http_time(t: DateTime<Utc>) -> String {
    t.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Parses a `Last-Modified` header into seconds since the epoch.
///
/// Returns 0 when the header is absent or unparseable; callers treat 0 as
/// "no server timestamp".
pub fn parse_http_time(value: &str) -> i64 {
    DateTime::parse_from_rfc2822(value)
        .map(|t| t.timestamp())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_is_rfc_1123() {
        let t = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        assert_eq!(format_http_time(t), "Tue, 14 Nov 2023 22:13:20 GMT");
    }

    #[test]
    fn test_parse_round_trip() {
        let t = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        assert_eq!(parse_http_time(&format_http_time(t)), 1_700_000_000);
    }

    #[test]
    fn test_parse_garbage_is_zero() {
        assert_eq!(parse_http_time("not a date"), 0);
        assert_eq!(parse_http_time(""), 0);
    }
}
