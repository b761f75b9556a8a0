//! Five-field cron grammar: lenient parsing, strict validation, matching.

use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, TimeZone, Timelike};
use thiserror::Error;

/// Inclusive value bounds for the five fields, in field order.
const FIELD_BOUNDS: [(u32, u32); 5] = [(0, 59), (0, 23), (1, 31), (1, 12), (0, 6)];

/// Field names used in validation errors, in field order.
const FIELD_NAMES: [&str; 5] = ["minute", "hour", "day-of-month", "month", "day-of-week"];

/// Why a cron expression failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronError {
    #[error("expected 5 fields (minute hour day-of-month month day-of-week), got {0}")]
    FieldCount(usize),
    #[error("invalid number `{token}` in {field} field")]
    NotANumber { field: &'static str, token: String },
    #[error("value out of range ({min}-{max}) in {field} field")]
    OutOfRange { field: &'static str, min: u32, max: u32 },
    #[error("range start exceeds end in {field} field")]
    InvertedRange { field: &'static str },
    #[error("step must be positive in {field} field")]
    BadStep { field: &'static str },
}

/// A parsed cron expression: one allowed-value set per field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    pub minutes: BTreeSet<u32>,
    pub hours: BTreeSet<u32>,
    pub days_of_month: BTreeSet<u32>,
    pub months: BTreeSet<u32>,
    pub days_of_week: BTreeSet<u32>,
}

impl CronExpression {
    /// Parse an expression into per-field value sets.
    ///
    /// Returns None only when the expression does not split into five
    /// fields. Malformed tokens inside a field collapse to an empty
    /// contribution rather than an error; run [`validate`] first to
    /// reject them.
    pub fn parse(expression: &str) -> Option<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return None;
        }
        Some(Self {
            minutes: parse_field(fields[0], 0, 59),
            hours: parse_field(fields[1], 0, 23),
            days_of_month: parse_field(fields[2], 1, 31),
            months: parse_field(fields[3], 1, 12),
            days_of_week: parse_field(fields[4], 0, 6),
        })
    }

    /// Whether an instant satisfies every field of this expression.
    pub fn matches<Tz: TimeZone>(&self, at: &DateTime<Tz>) -> bool {
        self.minutes.contains(&at.minute())
            && self.hours.contains(&at.hour())
            && self.days_of_month.contains(&at.day())
            && self.months.contains(&at.month())
            && self.days_of_week.contains(&at.weekday().num_days_from_sunday())
    }
}

/// Whether an instant satisfies a cron expression string.
///
/// Anything that does not parse (including a wrong field count) matches
/// nothing and yields false.
pub fn matches<Tz: TimeZone>(expression: &str, at: &DateTime<Tz>) -> bool {
    CronExpression::parse(expression).is_some_and(|expr| expr.matches(at))
}

/// Expand one field into its allowed values within `min..=max`.
///
/// Accepts comma-separated parts, each `*`, `a-b`, or a single value,
/// optionally with a `/step` suffix. Ranges are clamped to the bounds; a
/// part that is malformed, out of range, or has a non-positive step
/// contributes nothing.
pub fn parse_field(field: &str, min: u32, max: u32) -> BTreeSet<u32> {
    let mut values = BTreeSet::new();
    for part in field.split(',') {
        let (range, step) = split_step(part);
        let step = match step {
            Some(raw) => match raw.parse::<i64>() {
                Ok(step) if step > 0 => step as u64,
                _ => continue,
            },
            None => 1,
        };
        let Some((start, end)) = resolve_range(range, min, max) else {
            continue;
        };
        let mut value = start as u64;
        while value <= end as u64 {
            values.insert(value as u32);
            value += step;
        }
    }
    values
}

/// Strictly check an expression against the grammar.
///
/// The companion to the lenient parser: everything [`parse_field`]
/// silently drops is reported here with the offending field's name.
pub fn validate(expression: &str) -> Result<(), CronError> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(CronError::FieldCount(fields.len()));
    }
    for (i, field) in fields.iter().enumerate() {
        let (min, max) = FIELD_BOUNDS[i];
        for part in field.split(',') {
            validate_part(part, FIELD_NAMES[i], min, max)?;
        }
    }
    Ok(())
}

fn validate_part(part: &str, field: &'static str, min: u32, max: u32) -> Result<(), CronError> {
    let (range, step) = split_step(part);
    if let Some(raw) = step {
        let step = raw.parse::<i64>().map_err(|_| CronError::NotANumber {
            field,
            token: raw.to_string(),
        })?;
        if step <= 0 {
            return Err(CronError::BadStep { field });
        }
    }
    if range == "*" {
        return Ok(());
    }
    if let Some((a, b)) = range.split_once('-') {
        let start = parse_endpoint(a, field)?;
        let end = parse_endpoint(b, field)?;
        check_bounds(start, field, min, max)?;
        check_bounds(end, field, min, max)?;
        if start > end {
            return Err(CronError::InvertedRange { field });
        }
        return Ok(());
    }
    let value = parse_endpoint(range, field)?;
    check_bounds(value, field, min, max)
}

fn parse_endpoint(token: &str, field: &'static str) -> Result<i64, CronError> {
    token.parse::<i64>().map_err(|_| CronError::NotANumber {
        field,
        token: token.to_string(),
    })
}

fn check_bounds(value: i64, field: &'static str, min: u32, max: u32) -> Result<(), CronError> {
    if value < min as i64 || value > max as i64 {
        return Err(CronError::OutOfRange { field, min, max });
    }
    Ok(())
}

/// Split a part into its range portion and optional step suffix.
fn split_step(part: &str) -> (&str, Option<&str>) {
    match part.split_once('/') {
        Some((range, step)) => (range, Some(step)),
        None => (part, None),
    }
}

/// Resolve a range token to inclusive clamped endpoints, or None when
/// it contributes nothing.
fn resolve_range(range: &str, min: u32, max: u32) -> Option<(u32, u32)> {
    if range == "*" {
        return Some((min, max));
    }
    if let Some((a, b)) = range.split_once('-') {
        let start = a.parse::<i64>().ok()?.max(min as i64);
        let end = b.parse::<i64>().ok()?.min(max as i64);
        if start > end {
            return None;
        }
        return Some((start as u32, end as u32));
    }
    let value = range.parse::<i64>().ok()?;
    if value < min as i64 || value > max as i64 {
        return None;
    }
    Some((value as u32, value as u32))
}
