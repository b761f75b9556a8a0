//! otto-cron: cron expression parsing and schedule matching.
//!
//! Implements the five-field cron grammar used by automation schedules:
//! minute, hour, day-of-month, month, day-of-week (0 = Sunday). Parsing
//! is deliberately lenient and never fails outright; malformed tokens
//! simply contribute no values. [`validate`] is the strict gate that
//! callers run before an expression is accepted for scheduling.

pub mod catchup;
pub mod expression;

pub use catchup::{CATCHUP_SCAN_LIMIT, count_missed_fires};
pub use expression::{CronError, CronExpression, matches, parse_field, validate};
