// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Calendar bucket arithmetic
//!
//! A [`Bucket`] identifies one grid-aligned calendar interval (the year
//! 2006, the ISO week starting 2006-01-02, ...) in a given timezone. Two
//! instants fall in the same bucket iff [`bucket`] returns equal values
//! for them. All boundary crossings are computed on the wall clock of the
//! timezone, so a "day" across a DST transition may span 23 or 25 hours.

use chrono::offset::LocalResult;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// The calendar granularities a preservation policy can use, coarsest
/// first. The derived order is the canonical evaluation order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Timeframe {
    Years,
    Quarters,
    Months,
    Weeks,
    Days,
    Hours,
    Minutes,
    Seconds,
}

impl Timeframe {
    pub const ALL: [Timeframe; 8] = [
        Timeframe::Years,
        Timeframe::Quarters,
        Timeframe::Months,
        Timeframe::Weeks,
        Timeframe::Days,
        Timeframe::Hours,
        Timeframe::Minutes,
        Timeframe::Seconds,
    ];

    /// The single-character unit used in policy strings. Note `M` is
    /// minutes and `m` is months.
    #[must_use]
    pub fn unit(self) -> char {
        match self {
            Timeframe::Years => 'y',
            Timeframe::Quarters => 'q',
            Timeframe::Months => 'm',
            Timeframe::Weeks => 'w',
            Timeframe::Days => 'd',
            Timeframe::Hours => 'h',
            Timeframe::Minutes => 'M',
            Timeframe::Seconds => 's',
        }
    }

    #[must_use]
    pub fn from_unit(c: char) -> Option<Timeframe> {
        Timeframe::ALL.into_iter().find(|tf| tf.unit() == c)
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Timeframe::Years => "years",
            Timeframe::Quarters => "quarters",
            Timeframe::Months => "months",
            Timeframe::Weeks => "weeks",
            Timeframe::Days => "days",
            Timeframe::Hours => "hours",
            Timeframe::Minutes => "minutes",
            Timeframe::Seconds => "seconds",
        };
        f.write_str(name)
    }
}

/// Identity of one calendar interval: the timeframe plus the UTC instant
/// of its wall-clock start in the governing timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Bucket {
    pub timeframe: Timeframe,
    pub start: DateTime<Utc>,
}

/// Truncate a wall-clock time down to the start of its enclosing interval.
fn truncate(tf: Timeframe, t: NaiveDateTime) -> NaiveDateTime {
    let date = t.date();
    let midnight = |d: NaiveDate| d.and_hms_opt(0, 0, 0).expect("midnight is valid");
    match tf {
        Timeframe::Years => midnight(
            NaiveDate::from_ymd_opt(date.year(), 1, 1).expect("jan 1 is valid"),
        ),
        Timeframe::Quarters => {
            let month = date.month0() / 3 * 3 + 1;
            midnight(NaiveDate::from_ymd_opt(date.year(), month, 1).expect("quarter start"))
        }
        Timeframe::Months => midnight(
            NaiveDate::from_ymd_opt(date.year(), date.month(), 1).expect("first of month"),
        ),
        // ISO week: Monday 00:00.
        Timeframe::Weeks => midnight(
            date - Duration::days(i64::from(date.weekday().num_days_from_monday())),
        ),
        Timeframe::Days => midnight(date),
        Timeframe::Hours => t
            .with_minute(0)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .expect("top of hour"),
        Timeframe::Minutes => t
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .expect("top of minute"),
        Timeframe::Seconds => t.with_nanosecond(0).expect("whole second"),
    }
}

/// Map a wall-clock time to a UTC instant, deterministically.
///
/// An ambiguous local time (DST fall-back) resolves to the earlier
/// instant. A nonexistent local time (DST gap) resolves to the first
/// valid wall time after the nominal boundary, probing in 15-minute
/// steps; the largest gap in the tz database is a skipped calendar day.
fn resolve_local(tz: Tz, naive: NaiveDateTime) -> DateTime<Utc> {
    let mut probe = naive;
    for _ in 0..200 {
        match tz.from_local_datetime(&probe) {
            LocalResult::Single(t) => return t.with_timezone(&Utc),
            LocalResult::Ambiguous(earliest, _) => return earliest.with_timezone(&Utc),
            LocalResult::None => probe += Duration::minutes(15),
        }
    }
    Utc.from_utc_datetime(&naive)
}

/// The bucket containing instant `t` at timeframe `tf` in timezone `tz`.
#[must_use]
pub fn bucket(tf: Timeframe, t: DateTime<Utc>, tz: Tz) -> Bucket {
    let start = resolve_local(tz, truncate(tf, t.with_timezone(&tz).naive_local()));
    Bucket { timeframe: tf, start }
}

/// The `count` most recent buckets at `tf`, oldest first, ending with the
/// bucket containing `now`.
#[must_use]
pub fn enumerate_buckets(tf: Timeframe, now: DateTime<Utc>, count: u32, tz: Tz) -> Vec<Bucket> {
    let mut out = Vec::with_capacity(count as usize);
    if count == 0 {
        return out;
    }
    let mut current = bucket(tf, now, tz);
    for _ in 0..count {
        out.push(current);
        // One second before a bucket's start lies in the previous bucket,
        // whatever the local calendar did across the boundary.
        let Some(before) = current.start.checked_sub_signed(Duration::seconds(1)) else {
            break;
        };
        current = bucket(tf, before, tz);
    }
    out.reverse();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Tz;

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn start_of(tf: Timeframe, t: &str, tz: Tz) -> DateTime<Utc> {
        bucket(tf, utc(t), tz).start
    }

    #[test]
    fn utc_bucket_starts() {
        let tz = Tz::UTC;
        let t = "2006-07-15T12:34:56Z";
        assert_eq!(start_of(Timeframe::Years, t, tz), utc("2006-01-01T00:00:00Z"));
        assert_eq!(start_of(Timeframe::Quarters, t, tz), utc("2006-07-01T00:00:00Z"));
        assert_eq!(start_of(Timeframe::Months, t, tz), utc("2006-07-01T00:00:00Z"));
        // 2006-07-10 was a Monday.
        assert_eq!(start_of(Timeframe::Weeks, t, tz), utc("2006-07-10T00:00:00Z"));
        assert_eq!(start_of(Timeframe::Days, t, tz), utc("2006-07-15T00:00:00Z"));
        assert_eq!(start_of(Timeframe::Hours, t, tz), utc("2006-07-15T12:00:00Z"));
        assert_eq!(start_of(Timeframe::Minutes, t, tz), utc("2006-07-15T12:34:00Z"));
        assert_eq!(start_of(Timeframe::Seconds, t, tz), utc("2006-07-15T12:34:56Z"));
    }

    #[test]
    fn same_bucket_iff_same_interval() {
        let tz = Tz::UTC;
        let a = bucket(Timeframe::Days, utc("2006-01-02T00:00:00Z"), tz);
        let b = bucket(Timeframe::Days, utc("2006-01-02T23:59:59Z"), tz);
        let c = bucket(Timeframe::Days, utc("2006-01-03T00:00:00Z"), tz);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn week_starts_monday() {
        // 2006-01-04 was a Wednesday; 2006-01-02 a Monday.
        assert_eq!(
            start_of(Timeframe::Weeks, "2006-01-04T10:00:00Z", Tz::UTC),
            utc("2006-01-02T00:00:00Z")
        );
    }

    #[test]
    fn timezone_shifts_bucket_membership() {
        // Midnight UTC on Jan 1 is still Dec 31 in Los Angeles.
        let la: Tz = "America/Los_Angeles".parse().unwrap();
        let t = utc("2006-01-01T00:00:00Z");
        assert_eq!(bucket(Timeframe::Years, t, Tz::UTC).start, utc("2006-01-01T00:00:00Z"));
        assert_eq!(
            bucket(Timeframe::Years, t, la).start,
            utc("2005-01-01T08:00:00Z")
        );
    }

    #[test]
    fn dst_spring_forward_shortens_the_day() {
        // US DST began 2006-04-02 at 02:00 local.
        let la: Tz = "America/Los_Angeles".parse().unwrap();
        let before = start_of(Timeframe::Days, "2006-04-02T12:00:00Z", la);
        let after = start_of(Timeframe::Days, "2006-04-03T12:00:00Z", la);
        assert_eq!(before, utc("2006-04-02T08:00:00Z"));
        assert_eq!(after, utc("2006-04-03T07:00:00Z"));
        assert_eq!((after - before).num_hours(), 23);
    }

    #[test]
    fn dst_gap_at_midnight_resolves_forward() {
        // Sao Paulo DST 2018 started at midnight Nov 4: 00:00 jumped to
        // 01:00, so the day's first valid wall time is 01:00 (-02:00).
        let sp: Tz = "America/Sao_Paulo".parse().unwrap();
        assert_eq!(
            start_of(Timeframe::Days, "2018-11-04T15:00:00Z", sp),
            utc("2018-11-04T03:00:00Z")
        );
    }

    #[test]
    fn enumerate_ends_at_now_bucket() {
        let tz = Tz::UTC;
        let now = utc("2006-01-03T00:00:01Z");
        let days = enumerate_buckets(Timeframe::Days, now, 3, tz);
        let starts: Vec<_> = days.iter().map(|b| b.start).collect();
        assert_eq!(
            starts,
            vec![
                utc("2006-01-01T00:00:00Z"),
                utc("2006-01-02T00:00:00Z"),
                utc("2006-01-03T00:00:00Z"),
            ]
        );
    }

    #[test]
    fn enumerate_months_crosses_year_boundary() {
        let tz = Tz::UTC;
        let months = enumerate_buckets(Timeframe::Months, utc("2006-02-15T00:00:00Z"), 3, tz);
        let starts: Vec<_> = months.iter().map(|b| b.start).collect();
        assert_eq!(
            starts,
            vec![
                utc("2005-12-01T00:00:00Z"),
                utc("2006-01-01T00:00:00Z"),
                utc("2006-02-01T00:00:00Z"),
            ]
        );
    }

    #[test]
    fn enumerate_zero_is_empty() {
        assert!(enumerate_buckets(Timeframe::Years, utc("2006-01-01T00:00:00Z"), 0, Tz::UTC)
            .is_empty());
    }
}
