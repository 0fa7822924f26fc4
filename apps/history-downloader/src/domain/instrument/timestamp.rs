//! Protocol timestamp parsing and formatting.
//!
//! The service reports dates in a handful of shapes depending on the request
//! and the `formatDate` option:
//!
//! - `20200103` (daily bars)
//! - `20200103 09:30:00` or `20200103  09:30:00` (intraday, two spaces is
//!   the classic wire form)
//! - `20200103-09:30:00` (UTC form)
//! - `1578043800` (epoch seconds)

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};

/// Format used for outbound end-of-window timestamps.
pub const REQUEST_FORMAT: &str = "%Y%m%d %H:%M:%S";

/// Timestamp could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid timestamp: {raw:?}")]
pub struct TimestampError {
    /// Raw text received.
    pub raw: String,
}

/// Parse a protocol timestamp.
///
/// # Errors
///
/// Returns [`TimestampError`] if the text matches none of the known shapes.
pub fn parse_timestamp(raw: &str) -> Result<NaiveDateTime, TimestampError> {
    let text = raw.trim();
    let err = || TimestampError {
        raw: raw.to_string(),
    };

    if text.len() > 8 && text.bytes().all(|b| b.is_ascii_digit()) {
        let secs: i64 = text.parse().map_err(|_| err())?;
        return DateTime::from_timestamp(secs, 0)
            .map(|dt| dt.naive_utc())
            .ok_or_else(err);
    }

    let Some(date_part) = text.get(..8) else {
        return Err(err());
    };
    let date = NaiveDate::parse_from_str(date_part, "%Y%m%d").map_err(|_| err())?;

    let rest = text[8..].trim_start_matches([' ', '-']);
    if rest.is_empty() {
        return Ok(date.and_time(NaiveTime::MIN));
    }

    // Trailing time zone names ("US/Central") are ignored.
    let time_part = rest.split_whitespace().next().unwrap_or(rest);
    let time = NaiveTime::parse_from_str(time_part, "%H:%M:%S").map_err(|_| err())?;
    Ok(date.and_time(time))
}

/// Format a timestamp for an outbound request.
#[must_use]
pub fn format_request_timestamp(ts: NaiveDateTime) -> String {
    ts.format(REQUEST_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, s)
            .unwrap()
    }

    #[test_case("20200103", at(2020, 1, 3, 0, 0, 0) ; "date only")]
    #[test_case("20200103 09:30:00", at(2020, 1, 3, 9, 30, 0) ; "single space")]
    #[test_case("20200103  09:30:00", at(2020, 1, 3, 9, 30, 0) ; "double space")]
    #[test_case("20200103-14:30:00", at(2020, 1, 3, 14, 30, 0) ; "utc dash")]
    #[test_case("20200103 09:30:00 US/Central", at(2020, 1, 3, 9, 30, 0) ; "with zone")]
    #[test_case("1578043800", at(2020, 1, 3, 9, 30, 0) ; "epoch seconds")]
    fn parses_known_shapes(raw: &str, expected: NaiveDateTime) {
        assert_eq!(parse_timestamp(raw).unwrap(), expected);
    }

    #[test_case("" ; "empty")]
    #[test_case("2020-01-03" ; "iso date")]
    #[test_case("20201341" ; "bad month")]
    #[test_case("20200103 25:00:00" ; "bad hour")]
    fn rejects_garbage(raw: &str) {
        assert_eq!(
            parse_timestamp(raw).unwrap_err(),
            TimestampError {
                raw: raw.to_string()
            }
        );
    }

    #[test]
    fn request_format_round_trips_through_parser() {
        let ts = at(2020, 1, 3, 23, 59, 59);
        let text = format_request_timestamp(ts);
        assert_eq!(text, "20200103 23:59:59");
        assert_eq!(parse_timestamp(&text).unwrap(), ts);
    }
}
