//! Serde helpers for `DateTime<Utc>` ↔ `"/Date(<unix-ms>)/"` strings.
//!
//! The viewer parses profile start times in the legacy ASP.NET JSON date
//! encoding: milliseconds since the Unix epoch wrapped in `/Date(...)/`.
//! Sub-millisecond precision is not representable, so producers should
//! truncate timestamps to whole milliseconds (see [`truncate_to_millis`]) if
//! they need exact round-trips.
//!
//! Apply via `#[serde(with = "crate::serde_date")]`.

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serializer};

const PREFIX: &str = "/Date(";
const SUFFIX: &str = ")/";

/// Formats a timestamp as `"/Date(<unix-ms>)/"`.
pub fn format(date: &DateTime<Utc>) -> String {
    format!("{PREFIX}{}{SUFFIX}", date.timestamp_millis())
}

/// Parses a `"/Date(<unix-ms>)/"` string.
///
/// Returns `None` if the wrapper is missing, the number does not parse, or
/// the value is out of chrono's representable range.
pub fn parse(s: &str) -> Option<DateTime<Utc>> {
    let millis = s.strip_prefix(PREFIX)?.strip_suffix(SUFFIX)?;
    let millis: i64 = millis.parse().ok()?;
    DateTime::from_timestamp_millis(millis)
}

/// Drops everything below millisecond precision.
///
/// A timestamp passed through this function survives a `format`/`parse`
/// round-trip unchanged.
pub fn truncate_to_millis(date: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(date.timestamp_millis()).unwrap_or(date)
}

/// Serialize a timestamp as a `"/Date(<unix-ms>)/"` string.
pub fn serialize<S: Serializer>(
    date: &DateTime<Utc>,
    s: S,
) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format(date))
}

/// Deserialize a `"/Date(<unix-ms>)/"` string into a timestamp.
pub fn deserialize<'de, D: Deserializer<'de>>(
    d: D,
) -> Result<DateTime<Utc>, D::Error> {
    let raw = String::deserialize(d)?;
    parse(&raw).ok_or_else(|| {
        D::Error::custom(format_args!("invalid /Date(ms)/ timestamp: {raw:?}"))
    })
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn formats_unix_millis() {
        let date = Utc.timestamp_millis_opt(1_363_046_400_123).unwrap();
        assert_eq!(format(&date), "/Date(1363046400123)/");
    }

    #[test]
    fn parses_what_it_formats() {
        let date = Utc.timestamp_millis_opt(1_700_000_000_001).unwrap();
        assert_eq!(parse(&format(&date)), Some(date));
    }

    #[test]
    fn parses_pre_epoch_dates() {
        let date = parse("/Date(-1000)/").expect("negative millis are valid");
        assert_eq!(date.timestamp(), -1);
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(parse("2013-03-12T00:00:00Z").is_none());
        assert!(parse("/Date(abc)/").is_none());
        assert!(parse("/Date(12)").is_none());
        assert!(parse("").is_none());
    }

    #[test]
    fn truncation_makes_roundtrip_exact() {
        let date = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        let truncated = truncate_to_millis(date);
        assert_eq!(truncated.timestamp_subsec_nanos(), 123_000_000);
        assert_eq!(parse(&format(&truncated)), Some(truncated));
    }
}
