//! Dashboard time boundary translation.
//!
//! Dashboards express range boundaries as `now`, relative shorthand such as
//! `now-6h`, date math such as `now-1d/d` or `2015-05-01||+1M`, or absolute
//! instants. The backend understands `now` and its own relative syntax
//! (`-6h`, `-5min`) natively, everything else is sent as epoch seconds.
//!
//! All naive dates are interpreted as UTC.

use std::fmt;

use chrono::{
    DateTime, Datelike, Months, NaiveDate, NaiveDateTime, TimeDelta, Timelike, Utc,
};
use serde::{Deserialize, Serialize};

use crate::error::{DatasourceError, Result};

/// Rounding direction applied while translating a boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Rounding {
    /// Round towards the end of the period (`until` boundaries).
    Up,
    /// Round towards the start of the period (`from` boundaries).
    Down,
}

/// A time range boundary as handed over by the dashboard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeBoundary {
    /// `now`, relative shorthand, date math or an absolute date string.
    Text(String),
    /// An already resolved instant.
    Instant(DateTime<Utc>),
}

impl From<&str> for TimeBoundary {
    fn from(value: &str) -> Self {
        TimeBoundary::Text(value.to_string())
    }
}

impl From<String> for TimeBoundary {
    fn from(value: String) -> Self {
        TimeBoundary::Text(value)
    }
}

impl From<DateTime<Utc>> for TimeBoundary {
    fn from(value: DateTime<Utc>) -> Self {
        TimeBoundary::Instant(value)
    }
}

/// The `from`/`to` pair of a dashboard query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeRange {
    pub from: TimeBoundary,
    pub to: TimeBoundary,
}

impl TimeRange {
    pub fn new(from: impl Into<TimeBoundary>, to: impl Into<TimeBoundary>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// A translated boundary, ready to be put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeValue {
    /// Backend-native shorthand (`now`, `-1h`, `-5min`).
    Shorthand(String),
    /// Seconds since the Unix epoch.
    Epoch(i64),
}

impl fmt::Display for TimeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shorthand(s) => write!(f, "{s}"),
            Self::Epoch(secs) => write!(f, "{secs}"),
        }
    }
}

/// Source of the current instant for `now`-anchored date math.
#[derive(Debug, Clone, Copy, Default)]
pub enum Clock {
    #[default]
    System,
    Fixed(DateTime<Utc>),
}

impl Clock {
    pub fn now(&self) -> DateTime<Utc> {
        match self {
            Self::System => Utc::now(),
            Self::Fixed(instant) => *instant,
        }
    }
}

/// Translates dashboard boundaries into backend time parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeTranslator {
    clock: Clock,
}

impl TimeTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(clock: Clock) -> Self {
        Self { clock }
    }

    /// Translate a boundary, applying the given rounding direction.
    ///
    /// Relative shorthand is passed through untouched (only its units are
    /// respelled), so rounding is a no-op for it. For everything else the
    /// range is widened by one minute when the instant is not minute-aligned,
    /// because the backend treats range bounds as exclusive.
    pub fn translate(
        &self,
        boundary: &TimeBoundary,
        rounding: Option<Rounding>,
    ) -> Result<TimeValue> {
        let instant = match boundary {
            TimeBoundary::Text(text) => {
                if text == "now" {
                    return Ok(TimeValue::Shorthand("now".to_string()));
                }
                if let Some(shorthand) = relative_shorthand(text) {
                    return Ok(TimeValue::Shorthand(shorthand));
                }
                parse_date_math(text, rounding, self.clock.now())?
            }
            TimeBoundary::Instant(instant) => *instant,
        };

        let adjusted = if instant.second() == 0 {
            instant
        } else {
            match rounding {
                Some(Rounding::Up) => instant + TimeDelta::minutes(1),
                Some(Rounding::Down) => instant - TimeDelta::minutes(1),
                None => instant,
            }
        };

        Ok(TimeValue::Epoch(adjusted.timestamp()))
    }
}

/// `now-6h` -> `-6h`, `now-5m` -> `-5min`, `now-2M` -> `-2mon`.
///
/// Only applies to bare shorthand; anything with a `/` rounding modifier is
/// date math and must be resolved locally.
fn relative_shorthand(text: &str) -> Option<String> {
    if !text.contains("now-") || text.contains('/') {
        return None;
    }
    let shorthand = text
        .strip_prefix("now")
        .unwrap_or(text)
        .replacen('m', "min", 1)
        .replacen('M', "mon", 1);
    Some(shorthand)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unit {
    Year,
    Month,
    Week,
    Day,
    Hour,
    Minute,
    Second,
}

impl Unit {
    fn from_char(c: char) -> Option<Self> {
        match c {
            'y' => Some(Self::Year),
            'M' => Some(Self::Month),
            'w' => Some(Self::Week),
            'd' => Some(Self::Day),
            'h' => Some(Self::Hour),
            'm' => Some(Self::Minute),
            's' => Some(Self::Second),
            _ => None,
        }
    }

    fn seconds(self) -> Option<i64> {
        match self {
            Self::Week => Some(7 * 86_400),
            Self::Day => Some(86_400),
            Self::Hour => Some(3_600),
            Self::Minute => Some(60),
            Self::Second => Some(1),
            Self::Year | Self::Month => None,
        }
    }
}

/// Parse a date math expression into an instant.
///
/// The expression is either `now` or an absolute anchor followed by `||`,
/// then any number of `+N<unit>`, `-N<unit>` and `/<unit>` operations.
/// `/<unit>` snaps to the start of the unit, or to its last millisecond when
/// rounding up.
pub fn parse_date_math(
    text: &str,
    rounding: Option<Rounding>,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    let (anchor, math) = match text.strip_prefix("now") {
        Some(rest) => (now, rest),
        None => match text.find("||") {
            Some(idx) => (parse_absolute(&text[..idx])?, &text[idx + 2..]),
            None => (parse_absolute(text)?, ""),
        },
    };

    apply_math(text, anchor, math, rounding)
}

fn apply_math(
    text: &str,
    mut instant: DateTime<Utc>,
    math: &str,
    rounding: Option<Rounding>,
) -> Result<DateTime<Utc>> {
    let mut chars = math.chars().peekable();

    while let Some(op) = chars.next() {
        if !matches!(op, '/' | '+' | '-') {
            return Err(DatasourceError::invalid_time(
                text,
                format!("unexpected '{op}' in date math"),
            ));
        }

        let mut digits = String::new();
        while let Some(c) = chars.peek().copied().filter(char::is_ascii_digit) {
            digits.push(c);
            chars.next();
        }
        let amount: i64 = if digits.is_empty() {
            1
        } else {
            digits
                .parse()
                .map_err(|_| DatasourceError::invalid_time(text, "amount out of range"))?
        };

        let unit = chars
            .next()
            .and_then(Unit::from_char)
            .ok_or_else(|| DatasourceError::invalid_time(text, "missing or unknown unit"))?;

        let next = match op {
            '/' => {
                if amount != 1 {
                    return Err(DatasourceError::invalid_time(
                        text,
                        "rounding only supports a single unit",
                    ));
                }
                match rounding {
                    Some(Rounding::Up) => end_of(instant, unit),
                    _ => start_of(instant, unit),
                }
            }
            '+' => shift(instant, unit, amount),
            _ => amount.checked_neg().and_then(|neg| shift(instant, unit, neg)),
        };

        instant =
            next.ok_or_else(|| DatasourceError::invalid_time(text, "date out of range"))?;
    }

    Ok(instant)
}

fn shift(instant: DateTime<Utc>, unit: Unit, amount: i64) -> Option<DateTime<Utc>> {
    let months = match unit {
        Unit::Year => Some(amount.checked_mul(12)?),
        Unit::Month => Some(amount),
        _ => None,
    };

    match months {
        Some(months) => {
            let magnitude = Months::new(u32::try_from(months.unsigned_abs()).ok()?);
            if months >= 0 {
                instant.checked_add_months(magnitude)
            } else {
                instant.checked_sub_months(magnitude)
            }
        }
        None => {
            let secs = amount.checked_mul(unit.seconds()?)?;
            instant.checked_add_signed(TimeDelta::try_seconds(secs)?)
        }
    }
}

fn start_of(instant: DateTime<Utc>, unit: Unit) -> Option<DateTime<Utc>> {
    let date = instant.date_naive();
    let midnight = |d: NaiveDate| d.and_hms_opt(0, 0, 0).map(|n| n.and_utc());

    match unit {
        Unit::Second => instant.with_nanosecond(0),
        Unit::Minute => instant.with_nanosecond(0)?.with_second(0),
        Unit::Hour => instant.with_nanosecond(0)?.with_second(0)?.with_minute(0),
        Unit::Day => midnight(date),
        Unit::Week => {
            let offset = i64::from(date.weekday().num_days_from_sunday());
            midnight(date.checked_sub_signed(TimeDelta::days(offset))?)
        }
        Unit::Month => midnight(date.with_day(1)?),
        Unit::Year => midnight(NaiveDate::from_ymd_opt(date.year(), 1, 1)?),
    }
}

fn end_of(instant: DateTime<Utc>, unit: Unit) -> Option<DateTime<Utc>> {
    let start = start_of(instant, unit)?;
    let next = shift(start, unit, 1)?;
    next.checked_sub_signed(TimeDelta::milliseconds(1))
}

const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Parse an absolute anchor: RFC 3339, a naive ISO-like date/time, or an
/// all-digit epoch-milliseconds string.
fn parse_absolute(input: &str) -> Result<DateTime<Utc>> {
    let s = input.trim();

    if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
        return s
            .parse::<i64>()
            .ok()
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(|| DatasourceError::invalid_time(input, "epoch out of range"));
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(naive.and_utc());
        }
    }

    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|n| n.and_utc())
        .ok_or_else(|| DatasourceError::invalid_time(input, "not a recognised date"))
}
