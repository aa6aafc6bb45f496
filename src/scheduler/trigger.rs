//! Timezone-aware trigger time computation.
//!
//! Daily rules name a local wall-clock time. A local time that does not
//! exist (DST gap) resolves to the first valid local minute after it; a
//! local time that occurs twice (DST overlap) resolves to the earlier
//! instant. All results are UTC.

use std::str::FromStr;

use chrono::{
    DateTime, Days, Duration, FixedOffset, LocalResult, NaiveDate, NaiveDateTime, NaiveTime,
    TimeZone, Timelike, Utc,
};
use chrono_tz::Tz;

use crate::models::schedule::TimeSpec;
use crate::{AppError, Result};

/// Longest local-time gap we will step across, in minutes.
const MAX_GAP_MINUTES: u32 = 24 * 60;

/// Days scanned on either side of a reference date.
const SCAN_DAYS: i64 = 3;

/// A resolved timezone: IANA name or fixed UTC offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zone {
    /// IANA zone with DST rules.
    Named(Tz),
    /// Constant offset from UTC.
    Fixed(FixedOffset),
}

impl Zone {
    /// Parse a zone identifier.
    ///
    /// Accepts IANA names (`Asia/Jakarta`), `UTC`/`Z`, and offsets such as
    /// `+07:00`, `-0330`, `+7`, or `UTC+07:00`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Timezone` if the identifier cannot be resolved.
    pub fn parse(raw: &str) -> Result<Self> {
        let s = raw.trim();
        if s.is_empty() {
            return Err(AppError::Timezone("empty timezone identifier".into()));
        }
        if s.eq_ignore_ascii_case("utc") || s == "Z" {
            return Ok(Self::Fixed(utc_offset()?));
        }

        let offset = s
            .strip_prefix("UTC")
            .or_else(|| s.strip_prefix("GMT"))
            .unwrap_or(s);
        if offset.starts_with(['+', '-']) {
            return parse_offset(offset)
                .map(Self::Fixed)
                .ok_or_else(|| AppError::Timezone(format!("invalid utc offset '{raw}'")));
        }

        Tz::from_str(s)
            .map(Self::Named)
            .map_err(|_| AppError::Timezone(format!("unknown timezone '{raw}'")))
    }

    /// Local calendar date of `at` in this zone.
    #[must_use]
    pub fn local_date(&self, at: DateTime<Utc>) -> NaiveDate {
        match self {
            Self::Named(tz) => at.with_timezone(tz).date_naive(),
            Self::Fixed(off) => at.with_timezone(off).date_naive(),
        }
    }

    /// Map a local wall-clock time to a UTC instant.
    ///
    /// Returns `None` only if no valid local time exists within a day
    /// after `local`.
    #[must_use]
    pub fn resolve(&self, local: NaiveDateTime) -> Option<DateTime<Utc>> {
        match self {
            Self::Named(tz) => resolve_in(tz, local),
            Self::Fixed(off) => resolve_in(off, local),
        }
    }
}

fn utc_offset() -> Result<FixedOffset> {
    FixedOffset::east_opt(0).ok_or_else(|| AppError::Timezone("utc offset".into()))
}

/// Parse `+HH`, `+HHMM` or `+HH:MM` (sign required).
fn parse_offset(s: &str) -> Option<FixedOffset> {
    let (sign, rest) = if let Some(rest) = s.strip_prefix('+') {
        (1, rest)
    } else {
        (-1, s.strip_prefix('-')?)
    };
    if rest.is_empty() || !rest.chars().all(|c| c.is_ascii_digit() || c == ':') {
        return None;
    }

    let (hours, minutes) = match (rest.len(), rest.split_once(':')) {
        (_, Some((h, m))) if (1..=2).contains(&h.len()) && m.len() == 2 => (h, m),
        (1 | 2, None) => (rest, "0"),
        (4, None) => rest.split_at(2),
        _ => return None,
    };
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

fn resolve_in<Z: TimeZone>(zone: &Z, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    let mut candidate = local;
    for _ in 0..=MAX_GAP_MINUTES {
        match zone.from_local_datetime(&candidate) {
            LocalResult::Single(at) => return Some(at.with_timezone(&Utc)),
            LocalResult::Ambiguous(earliest, _) => return Some(earliest.with_timezone(&Utc)),
            LocalResult::None => {
                candidate = candidate
                    .with_second(0)?
                    .with_nanosecond(0)?
                    .checked_add_signed(Duration::minutes(1))?;
            }
        }
    }
    None
}

fn shift(date: NaiveDate, days: i64) -> Option<NaiveDate> {
    let magnitude = Days::new(days.unsigned_abs());
    if days >= 0 {
        date.checked_add_days(magnitude)
    } else {
        date.checked_sub_days(magnitude)
    }
}

/// First occurrence of local `time` in `zone` strictly after `after`.
#[must_use]
pub fn next_occurrence(time: NaiveTime, zone: &Zone, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let anchor = zone.local_date(after);
    (-1..=SCAN_DAYS)
        .filter_map(|offset| shift(anchor, offset))
        .filter_map(|date| zone.resolve(date.and_time(time)))
        .find(|at| *at > after)
}

/// Latest occurrence of local `time` in `zone` at or before `at`.
#[must_use]
pub fn latest_occurrence(time: NaiveTime, zone: &Zone, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let anchor = zone.local_date(at);
    (-SCAN_DAYS..=1)
        .rev()
        .filter_map(|offset| shift(anchor, offset))
        .filter_map(|date| zone.resolve(date.and_time(time)))
        .find(|occurrence| *occurrence <= at)
}

/// Next trigger of `spec` strictly after `after`.
///
/// One-time rules yield their instant only while it is still ahead.
#[must_use]
pub fn next_fire_after(spec: &TimeSpec, zone: &Zone, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match *spec {
        TimeSpec::OneTime { at } => (at > after).then_some(at),
        TimeSpec::Daily { time } => next_occurrence(time, zone, after),
    }
}
