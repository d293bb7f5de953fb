//! Cron expression parsing and next-fire-time search
//!
//! Supports the vixie-cron dialect used by agent schedules:
//!
//! - 5 fields (`minute hour day-of-month month day-of-week`) or 6 fields with a
//!   leading `second` field
//! - `*`, single values, ranges `a-b`, steps `*/n` / `a-b/n` / `a/n`, and
//!   comma-separated lists of any of these
//! - three-letter month (`jan`..`dec`) and weekday (`sun`..`sat`) names,
//!   weekday `7` as an alias for Sunday
//! - `@yearly`, `@annually`, `@monthly`, `@weekly`, `@daily`, `@midnight`,
//!   `@hourly`
//!
//! All times are UTC with one-second resolution. When both day-of-month and
//! day-of-week are restricted a day matches if EITHER matches, otherwise the
//! restricted one must match.

use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use std::fmt;
use std::str::FromStr;

/// Upper bound on months scanned before an expression is declared unsatisfiable.
/// Eight years covers leap days across a skipped century leap year.
const MAX_MONTHS_SCANNED: i64 = 12 * 8;

const MONTH_NAMES: &[&str] = &[
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const WEEKDAY_NAMES: &[&str] = &["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CronError {
    #[error("Cron expression must have 5 or 6 fields, got {0}")]
    FieldCount(usize),

    #[error("Invalid cron {field} field '{value}': {reason}")]
    InvalidField {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("Cron expression '{0}' never fires")]
    NoMatch(String),
}

#[derive(Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: Option<&'static [&'static str]>,
    /// Offset added to a name's index (months are 1-based)
    name_base: u32,
}

const SECOND: FieldSpec = FieldSpec {
    name: "second",
    min: 0,
    max: 59,
    names: None,
    name_base: 0,
};
const MINUTE: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
    names: None,
    name_base: 0,
};
const HOUR: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
    names: None,
    name_base: 0,
};
const DAY_OF_MONTH: FieldSpec = FieldSpec {
    name: "day-of-month",
    min: 1,
    max: 31,
    names: None,
    name_base: 0,
};
const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: Some(MONTH_NAMES),
    name_base: 1,
};
// 7 is accepted and folded onto Sunday after parsing
const DAY_OF_WEEK: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 0,
    max: 7,
    names: Some(WEEKDAY_NAMES),
    name_base: 0,
};

/// A parsed cron expression. Each field is a bitmask of allowed values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    source: String,
    seconds: u64,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let trimmed = expr.trim();
        let expanded = match trimmed.to_ascii_lowercase().as_str() {
            "@yearly" | "@annually" => "0 0 1 1 *".to_string(),
            "@monthly" => "0 0 1 * *".to_string(),
            "@weekly" => "0 0 * * 0".to_string(),
            "@daily" | "@midnight" => "0 0 * * *".to_string(),
            "@hourly" => "0 * * * *".to_string(),
            _ => trimmed.to_string(),
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        let (second, rest) = match fields.len() {
            5 => ("0", &fields[..]),
            6 => (fields[0], &fields[1..]),
            n => return Err(CronError::FieldCount(n)),
        };

        let mut days_of_week = parse_field(rest[4], DAY_OF_WEEK)?;
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(Self {
            source: trimmed.to_string(),
            seconds: parse_field(second, SECOND)?,
            minutes: parse_field(rest[0], MINUTE)?,
            hours: parse_field(rest[1], HOUR)?,
            days_of_month: parse_field(rest[2], DAY_OF_MONTH)?,
            months: parse_field(rest[3], MONTH)?,
            days_of_week,
            dom_restricted: !rest[2].starts_with('*'),
            dow_restricted: !rest[4].starts_with('*'),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// First fire time strictly after `from` (unix seconds).
    pub fn next_after(&self, from: i64) -> Result<i64, CronError> {
        let start = DateTime::<Utc>::from_timestamp(from.saturating_add(1), 0)
            .ok_or_else(|| CronError::NoMatch(self.source.clone()))?;

        let mut year = start.year();
        let mut month = start.month();
        let mut day = start.day();
        let mut hour = start.hour();
        let mut minute = start.minute();
        let mut second = start.second();
        let limit = month_index(year, month) + MAX_MONTHS_SCANNED;

        loop {
            if month_index(year, month) > limit {
                return Err(CronError::NoMatch(self.source.clone()));
            }

            if !has_bit(self.months, month) || day > days_in_month(year, month) {
                month += 1;
                if month > 12 {
                    month = 1;
                    year += 1;
                }
                day = 1;
                hour = 0;
                minute = 0;
                second = 0;
                continue;
            }

            if !self.day_matches(year, month, day) {
                day += 1;
                hour = 0;
                minute = 0;
                second = 0;
                continue;
            }

            match next_bit(self.hours, hour, 23) {
                None => {
                    day += 1;
                    hour = 0;
                    minute = 0;
                    second = 0;
                    continue;
                }
                Some(h) if h != hour => {
                    hour = h;
                    minute = 0;
                    second = 0;
                }
                Some(_) => {}
            }

            match next_bit(self.minutes, minute, 59) {
                None => {
                    hour += 1;
                    minute = 0;
                    second = 0;
                    if hour > 23 {
                        hour = 0;
                        day += 1;
                    }
                    continue;
                }
                Some(m) if m != minute => {
                    minute = m;
                    second = 0;
                }
                Some(_) => {}
            }

            match next_bit(self.seconds, second, 59) {
                None => {
                    minute += 1;
                    second = 0;
                    if minute > 59 {
                        minute = 0;
                        hour += 1;
                        if hour > 23 {
                            hour = 0;
                            day += 1;
                        }
                    }
                    continue;
                }
                Some(s) => second = s,
            }

            return NaiveDate::from_ymd_opt(year, month, day)
                .and_then(|d| d.and_hms_opt(hour, minute, second))
                .map(|dt| dt.and_utc().timestamp())
                .ok_or_else(|| CronError::NoMatch(self.source.clone()));
        }
    }

    fn day_matches(&self, year: i32, month: u32, day: u32) -> bool {
        let dom = has_bit(self.days_of_month, day);
        let dow = NaiveDate::from_ymd_opt(year, month, day)
            .map(|d| has_bit(self.days_of_week, d.weekday().num_days_from_sunday()))
            .unwrap_or(false);

        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }
}

impl FromStr for CronSchedule {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Parse `expr` and return its first fire time strictly after `from`.
pub fn next_fire_time(expr: &str, from: i64) -> Result<i64, CronError> {
    CronSchedule::parse(expr)?.next_after(from)
}

// ============================================================================
// Field parsing
// ============================================================================

fn parse_field(text: &str, spec: FieldSpec) -> Result<u64, CronError> {
    let invalid = |reason: &str| CronError::InvalidField {
        field: spec.name,
        value: text.to_string(),
        reason: reason.to_string(),
    };

    if text.is_empty() {
        return Err(invalid("empty field"));
    }

    let mut mask = 0u64;
    for item in text.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| invalid("step is not a number"))?;
                if step == 0 {
                    return Err(invalid("step must be positive"));
                }
                (range, Some(step))
            }
            None => (item, None),
        };

        let (lo, hi) = if range == "*" {
            (spec.min, spec.max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, spec, &invalid)?, parse_value(b, spec, &invalid)?)
        } else {
            let v = parse_value(range, spec, &invalid)?;
            // `a/n` means every n starting at a
            if step.is_some() {
                (v, spec.max)
            } else {
                (v, v)
            }
        };

        if lo > hi {
            return Err(invalid("range start is after range end"));
        }

        let step = step.unwrap_or(1);
        let mut v = lo;
        while v <= hi {
            mask |= 1 << v;
            v += step;
        }
    }

    Ok(mask)
}

fn parse_value(
    text: &str,
    spec: FieldSpec,
    invalid: &dyn Fn(&str) -> CronError,
) -> Result<u32, CronError> {
    let value = match text.parse::<u32>() {
        Ok(v) => v,
        Err(_) => {
            let lower = text.to_ascii_lowercase();
            let idx = spec
                .names
                .and_then(|names| names.iter().position(|n| *n == lower))
                .ok_or_else(|| invalid("not a number or known name"))?;
            idx as u32 + spec.name_base
        }
    };

    if value < spec.min || value > spec.max {
        return Err(invalid("value out of range"));
    }
    Ok(value)
}

// ============================================================================
// Calendar helpers
// ============================================================================

fn has_bit(mask: u64, bit: u32) -> bool {
    mask & (1 << bit) != 0
}

/// Smallest set bit in `mask` that is `>= from` and `<= max`.
fn next_bit(mask: u64, from: u32, max: u32) -> Option<u32> {
    (from..=max).find(|b| has_bit(mask, *b))
}

fn month_index(year: i32, month: u32) -> i64 {
    year as i64 * 12 + month as i64
}

fn days_in_month(year: i32, month: u32) -> u32 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        _ => {
            let leap = (year % 4 == 0 && year % 100 != 0) || year % 400 == 0;
            if leap {
                29
            } else {
                28
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> i64 {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap().timestamp()
    }

    #[test]
    fn test_every_five_minutes() {
        let t0 = ts(2025, 1, 1, 0, 0, 0);
        let first = next_fire_time("*/5 * * * *", t0).unwrap();
        assert_eq!(first, ts(2025, 1, 1, 0, 5, 0));
        let second = next_fire_time("*/5 * * * *", first).unwrap();
        assert_eq!(second, ts(2025, 1, 1, 0, 10, 0));
    }

    #[test]
    fn test_six_field_seconds() {
        let t0 = ts(2025, 3, 10, 12, 0, 7);
        assert_eq!(
            next_fire_time("*/10 * * * * *", t0).unwrap(),
            ts(2025, 3, 10, 12, 0, 10)
        );
        assert_eq!(
            next_fire_time("30 15 * * * *", t0).unwrap(),
            ts(2025, 3, 10, 12, 15, 30)
        );
    }

    #[test]
    fn test_rolls_over_year() {
        let t0 = ts(2025, 12, 31, 23, 59, 59);
        assert_eq!(
            next_fire_time("0 0 1 1 *", t0).unwrap(),
            ts(2026, 1, 1, 0, 0, 0)
        );
        assert_eq!(
            next_fire_time("@yearly", t0).unwrap(),
            ts(2026, 1, 1, 0, 0, 0)
        );
    }

    #[test]
    fn test_day_of_month_or_day_of_week() {
        // 2025-06-01 is a Sunday; next Friday is the 6th, the 13th is later
        let t0 = ts(2025, 6, 1, 0, 0, 0);
        assert_eq!(
            next_fire_time("0 0 13 * 5", t0).unwrap(),
            ts(2025, 6, 6, 0, 0, 0)
        );
        // Only day-of-month restricted: weekday is ignored
        assert_eq!(
            next_fire_time("0 0 13 * *", t0).unwrap(),
            ts(2025, 6, 13, 0, 0, 0)
        );
        // Only day-of-week restricted
        assert_eq!(
            next_fire_time("0 0 * * fri", t0).unwrap(),
            ts(2025, 6, 6, 0, 0, 0)
        );
    }

    #[test]
    fn test_names_ranges_and_lists() {
        let t0 = ts(2025, 4, 5, 10, 0, 0); // Saturday in April
        assert_eq!(
            next_fire_time("0 9 * jan-mar mon-fri", t0).unwrap(),
            ts(2026, 1, 1, 9, 0, 0)
        );
        assert_eq!(
            next_fire_time("15,45 8-18/2 * * *", t0).unwrap(),
            ts(2025, 4, 5, 10, 15, 0)
        );
    }

    #[test]
    fn test_weekday_seven_is_sunday() {
        let t0 = ts(2025, 6, 2, 0, 0, 0); // Monday
        let a = next_fire_time("0 0 * * 7", t0).unwrap();
        let b = next_fire_time("0 0 * * 0", t0).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, ts(2025, 6, 8, 0, 0, 0));
    }

    #[test]
    fn test_leap_day() {
        let t0 = ts(2025, 1, 1, 0, 0, 0);
        assert_eq!(
            next_fire_time("0 0 29 2 *", t0).unwrap(),
            ts(2028, 2, 29, 0, 0, 0)
        );
    }

    #[test]
    fn test_unsatisfiable_expression_fails() {
        let t0 = ts(2025, 1, 1, 0, 0, 0);
        assert!(matches!(
            next_fire_time("0 0 30 2 *", t0),
            Err(CronError::NoMatch(_))
        ));
    }

    #[test]
    fn test_invalid_expressions() {
        assert!(matches!(
            CronSchedule::parse("* * *"),
            Err(CronError::FieldCount(3))
        ));
        assert!(CronSchedule::parse("61 * * * *").is_err());
        assert!(CronSchedule::parse("*/0 * * * *").is_err());
        assert!(CronSchedule::parse("5-1 * * * *").is_err());
        assert!(CronSchedule::parse("* * * foo *").is_err());
        assert!(CronSchedule::parse("* * 0 * *").is_err());
    }

    #[test]
    fn test_sequence_is_strictly_increasing() {
        let exprs = [
            "*/7 * * * *",
            "0 */3 * * *",
            "*/13 * * * * *",
            "0 0 1,15 * mon",
            "@hourly",
        ];
        for expr in exprs {
            let schedule = CronSchedule::parse(expr).unwrap();
            let mut t = ts(2025, 2, 27, 22, 58, 3);
            for _ in 0..50 {
                let next = schedule.next_after(t).unwrap();
                assert!(next > t, "{expr}: {next} <= {t}");
                t = next;
            }
        }
    }
}
