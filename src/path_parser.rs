//! Extracts the collection timestamp embedded in an archive path, and floors timestamps to the
//! hour boundary used to key hour buckets and storage prefixes.

use crate::error::PathParseError;
use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use regex::Regex;
use std::sync::OnceLock;

fn archive_path_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^archives/compressed/[0-9a-fA-F]+/[0-9a-fA-F-]+/(20\d{2})(\d{2})/(\d{2})/(\d{2})(\d{2})(\d{2})\.tar\.gz$",
        )
        .expect("archive path pattern is a valid regex")
    })
}

/// Parses the `YYYYMM/DD/HHMMSS` segment of an archive path into a UTC timestamp.
///
/// Matching alone does not guarantee a valid calendar date (e.g. `0230`); the final RFC3339
/// parse is what rejects those.
pub fn extract_collected_date(path: &str) -> Result<DateTime<Utc>, PathParseError> {
    let captures = archive_path_pattern()
        .captures(path)
        .ok_or_else(|| PathParseError::NoMatch(path.to_string()))?;

    let year = &captures[1];
    let month = &captures[2];
    let day = &captures[3];
    let hour = &captures[4];
    let minute = &captures[5];
    let second = &captures[6];

    let rfc3339 = format!("{year}-{month}-{day}T{hour}:{minute}:{second}Z");
    DateTime::parse_from_rfc3339(&rfc3339)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|source| PathParseError::InvalidTimestamp {
            path: path.to_string(),
            source,
        })
}

/// Truncates a timestamp to the start of its hour (minutes/seconds/nanoseconds zeroed).
pub fn hour_floor(ts: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(ts.year(), ts.month(), ts.day(), ts.hour(), 0, 0)
        .single()
        .unwrap_or(ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone as _;

    #[test]
    fn parses_a_valid_path() {
        let path = "archives/compressed/aa/aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee/202101/20/031044.tar.gz";
        let parsed = extract_collected_date(path).expect("should parse");
        assert_eq!(parsed, Utc.with_ymd_and_hms(2021, 1, 20, 3, 10, 44).unwrap());
    }

    #[test]
    fn rejects_unmatched_paths() {
        assert!(extract_collected_date("not/an/archive/path").is_err());
        assert!(extract_collected_date(
            "archives/compressed/aa/uuid/202101/20/031044.zip"
        )
        .is_err());
    }

    #[test]
    fn rejects_invalid_calendar_dates() {
        let path = "archives/compressed/aa/aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee/202102/30/031044.tar.gz";
        assert!(extract_collected_date(path).is_err());
    }

    #[test]
    fn rejects_out_of_range_hour() {
        let path = "archives/compressed/aa/aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee/202101/20/251044.tar.gz";
        assert!(extract_collected_date(path).is_err());
    }

    #[test]
    fn rejects_year_outside_2000_to_2099() {
        let path = "archives/compressed/aa/aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee/199901/20/031044.tar.gz";
        assert!(extract_collected_date(path).is_err());
    }

    #[test]
    fn hour_floor_truncates_minutes_and_seconds() {
        let ts = Utc.with_ymd_and_hms(2021, 1, 20, 3, 10, 44).unwrap();
        let floored = hour_floor(ts);
        assert_eq!(floored, Utc.with_ymd_and_hms(2021, 1, 20, 3, 0, 0).unwrap());
        assert!(floored <= ts);
        assert!(ts < floored + chrono::Duration::hours(1));
        assert_eq!(floored.timestamp() % 3600, 0);
    }
}
