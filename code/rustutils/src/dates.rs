/// Everything is UTC internally.  The scheduler reports times in the local time of the server
/// (ctime(3) format) and those are converted on the way in.
///
/// Stored timestamps are always rendered with `format_timestamp`, which is fixed-width, so that
/// comparing the strings compares the times.  The database relies on that.
use anyhow::{bail, Result};
use chrono::{DateTime, Datelike, Local, NaiveDateTime, TimeZone, Timelike, Utc};

pub type Timestamp = DateTime<Utc>;

const STORED_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";
const SCHEDULER_FORMAT: &str = "%a %b %d %H:%M:%S %Y";

pub fn now() -> Timestamp {
    let t = Utc::now();
    t.with_nanosecond(0).unwrap_or(t)
}

pub fn epoch() -> Timestamp {
    Utc.timestamp_opt(0, 0).unwrap()
}

pub fn timestamp_from_ymdhms(year: i32, month: u32, day: u32, h: u32, m: u32, s: u32) -> Timestamp {
    Utc.with_ymd_and_hms(year, month, day, h, m, s).unwrap()
}

pub fn format_timestamp(t: Timestamp) -> String {
    t.format(STORED_FORMAT).to_string()
}

pub fn format_date(t: Timestamp) -> String {
    t.format("%Y-%m-%d").to_string()
}

pub fn parse_timestamp(s: &str) -> Result<Timestamp> {
    match DateTime::parse_from_rfc3339(s.trim()) {
        Ok(t) => Ok(t.with_timezone(&Utc)),
        Err(e) => bail!("Invalid timestamp '{s}': {e}"),
    }
}

// PBS prints `stime` as "Mon Oct 14 10:22:03 2024" in server-local time.  Newer tooling may give
// RFC 3339 or epoch seconds, so accept those too.  Sub-second precision is dropped.  Times whose
// year does not have exactly four digits can't be stored in the fixed-width form and are
// rejected like any other nonsense.

pub fn parse_scheduler_time(s: &str) -> Option<Timestamp> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let t = if let Ok(naive) = NaiveDateTime::parse_from_str(s, SCHEDULER_FORMAT) {
        Local
            .from_local_datetime(&naive)
            .earliest()
            .map(|t| t.with_timezone(&Utc))
    } else if s.bytes().all(|c| c.is_ascii_digit()) {
        s.parse::<i64>()
            .ok()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
    } else {
        DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    };
    t.filter(|t| (0..=9999).contains(&t.year()))
        .and_then(|t| t.with_nanosecond(0))
}

#[test]
fn test_stored_format_roundtrip_and_order() {
    let a = timestamp_from_ymdhms(2024, 3, 9, 8, 5, 1);
    let b = timestamp_from_ymdhms(2024, 10, 14, 10, 22, 3);
    let sa = format_timestamp(a);
    let sb = format_timestamp(b);
    assert!(sa == "2024-03-09T08:05:01Z");
    assert!(sa.len() == sb.len());
    assert!(sa < sb);
    assert!(parse_timestamp(&sa).unwrap() == a);
    assert!(parse_timestamp("yesterday").is_err());
}

#[test]
fn test_parse_scheduler_time() {
    let expected = Local
        .with_ymd_and_hms(2024, 10, 14, 10, 22, 3)
        .earliest()
        .unwrap()
        .with_timezone(&Utc);
    assert!(parse_scheduler_time("Mon Oct 14 10:22:03 2024") == Some(expected));

    // ctime pads single-digit days with a space
    let expected = Local
        .with_ymd_and_hms(2024, 10, 7, 9, 0, 0)
        .earliest()
        .unwrap()
        .with_timezone(&Utc);
    assert!(parse_scheduler_time("Mon Oct  7 09:00:00 2024") == Some(expected));

    assert!(
        parse_scheduler_time("2024-10-14T10:22:03.5Z")
            == Some(timestamp_from_ymdhms(2024, 10, 14, 10, 22, 3))
    );
    assert!(parse_scheduler_time("1728901323") == Some(Utc.timestamp_opt(1728901323, 0).unwrap()));
    assert!(parse_scheduler_time("").is_none());
    assert!(parse_scheduler_time("  ").is_none());
    assert!(parse_scheduler_time("not a date").is_none());

    // Out of the four-digit year range
    assert!(parse_scheduler_time("999999999999").is_none());
    assert!(
        parse_scheduler_time("253402300799")
            == Some(timestamp_from_ymdhms(9999, 12, 31, 23, 59, 59))
    );
    assert!(parse_scheduler_time("253402300800").is_none());
}

#[test]
fn test_now_is_whole_seconds() {
    assert!(now().nanosecond() == 0);
    assert!(epoch() < now());
    assert!(format_date(timestamp_from_ymdhms(2026, 1, 2, 23, 59, 59)) == "2026-01-02");
}
