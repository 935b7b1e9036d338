// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Preservation parameters and the fixed-now policy
//!
//! Parameters use the btrbk retention grammar: `1y 4q 12m 6w 30d 24h 60M
//! 60s`, any subset, any order, at most one entry per unit, at least one
//! entry nonzero. `M` is minutes, `m` is months.
//!
//! A [`Policy`] binds parameters to a specific "now" and timezone and
//! precomputes the wanted buckets per timeframe, so that resolution is a
//! pure function of its inputs.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::timeframe::{bucket, enumerate_buckets, Bucket, Timeframe};
use crate::{Result, ScheduleError};

/// How many intervals back to preserve, per timeframe. Zero means the
/// timeframe is unused.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Params {
    pub years: u32,
    pub quarters: u32,
    pub months: u32,
    pub weeks: u32,
    pub days: u32,
    pub hours: u32,
    pub minutes: u32,
    pub seconds: u32,
}

impl Params {
    #[must_use]
    pub fn count(&self, tf: Timeframe) -> u32 {
        match tf {
            Timeframe::Years => self.years,
            Timeframe::Quarters => self.quarters,
            Timeframe::Months => self.months,
            Timeframe::Weeks => self.weeks,
            Timeframe::Days => self.days,
            Timeframe::Hours => self.hours,
            Timeframe::Minutes => self.minutes,
            Timeframe::Seconds => self.seconds,
        }
    }

    fn count_mut(&mut self, tf: Timeframe) -> &mut u32 {
        match tf {
            Timeframe::Years => &mut self.years,
            Timeframe::Quarters => &mut self.quarters,
            Timeframe::Months => &mut self.months,
            Timeframe::Weeks => &mut self.weeks,
            Timeframe::Days => &mut self.days,
            Timeframe::Hours => &mut self.hours,
            Timeframe::Minutes => &mut self.minutes,
            Timeframe::Seconds => &mut self.seconds,
        }
    }

    /// The active `(timeframe, count)` entries, coarsest first.
    #[must_use]
    pub fn entries(&self) -> Vec<(Timeframe, u32)> {
        Timeframe::ALL
            .into_iter()
            .filter_map(|tf| {
                let n = self.count(tf);
                (n > 0).then_some((tf, n))
            })
            .collect()
    }

    /// Parse a description string like `1y 3m 30d`.
    ///
    /// Entry order in the string is free; evaluation order is always
    /// coarsest first.
    pub fn parse(desc: &str) -> Result<Self> {
        let invalid = || ScheduleError::InvalidParams(desc.to_string());
        let mut params = Params::default();
        let mut seen = Vec::new();
        for token in desc.split_whitespace() {
            let digits = token
                .find(|c: char| !c.is_ascii_digit())
                .ok_or_else(invalid)?;
            let count: u32 = token[..digits].parse().map_err(|_| invalid())?;
            let mut units = token[digits..].chars();
            let tf = units
                .next()
                .filter(|_| units.next().is_none())
                .and_then(Timeframe::from_unit)
                .ok_or_else(invalid)?;
            if seen.contains(&tf) {
                return Err(invalid());
            }
            seen.push(tf);
            *params.count_mut(tf) = count;
        }
        if params.entries().is_empty() {
            return Err(invalid());
        }
        Ok(params)
    }
}

impl std::fmt::Display for Params {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (tf, n) in self.entries() {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{n}{}", tf.unit())?;
            first = false;
        }
        Ok(())
    }
}

/// Preservation parameters bound to a fixed "now" and timezone.
#[derive(Debug, Clone)]
pub struct Policy {
    params: Params,
    now: DateTime<Utc>,
    tz: Tz,
    /// Wanted buckets per active timeframe, coarsest timeframe first,
    /// buckets oldest first.
    wanted: Vec<(Timeframe, Vec<Bucket>)>,
}

impl Policy {
    pub fn new(params: Params, now: DateTime<Utc>, tz: Tz) -> Result<Self> {
        let entries = params.entries();
        if entries.is_empty() {
            return Err(ScheduleError::InvalidParams(
                "at least one timeframe must be preserved".to_string(),
            ));
        }
        let wanted = entries
            .into_iter()
            .map(|(tf, n)| (tf, enumerate_buckets(tf, now, n, tz)))
            .collect();
        Ok(Policy { params, now, tz, wanted })
    }

    #[must_use]
    pub fn params(&self) -> &Params {
        &self.params
    }

    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    #[must_use]
    pub fn tz(&self) -> Tz {
        self.tz
    }

    /// Active timeframes, coarsest first.
    pub fn timeframes(&self) -> impl Iterator<Item = Timeframe> + '_ {
        self.wanted.iter().map(|(tf, _)| *tf)
    }

    #[must_use]
    pub fn root_timeframe(&self) -> Timeframe {
        self.wanted[0].0
    }

    #[must_use]
    pub fn finest_timeframe(&self) -> Timeframe {
        self.wanted[self.wanted.len() - 1].0
    }

    /// Wanted buckets at `tf`; empty when `tf` is not in the policy.
    #[must_use]
    pub fn wanted(&self, tf: Timeframe) -> &[Bucket] {
        self.wanted
            .iter()
            .find(|(t, _)| *t == tf)
            .map_or(&[], |(_, buckets)| buckets.as_slice())
    }

    #[must_use]
    pub fn is_wanted(&self, b: &Bucket) -> bool {
        self.wanted(b.timeframe).contains(b)
    }

    /// The bucket containing `t` at `tf`, in this policy's timezone.
    #[must_use]
    pub fn bucket_of(&self, tf: Timeframe, t: DateTime<Utc>) -> Bucket {
        bucket(tf, t, self.tz)
    }
}
