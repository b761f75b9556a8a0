//! Missed-fire counting over a bounded minute walk.

use chrono::{DateTime, Duration, TimeZone, Timelike};

use crate::expression::CronExpression;

/// Upper bound on minutes examined per catch-up evaluation (14 days).
///
/// `from` is an automation's last run time and can be arbitrarily old;
/// the walk must stay bounded regardless.
pub const CATCHUP_SCAN_LIMIT: u32 = 20_160;

/// Count scheduled fire instants inside `(from, to]`.
///
/// Walks minute by minute starting at the first whole minute strictly
/// after `from`, stopping at `to` or after [`CATCHUP_SCAN_LIMIT`]
/// steps, whichever comes first. Returns 0 when `to <= from` or the
/// expression does not parse.
pub fn count_missed_fires<Tz: TimeZone>(
    expression: &str,
    from: &DateTime<Tz>,
    to: &DateTime<Tz>,
) -> u32 {
    if to <= from {
        return 0;
    }
    let Some(expr) = CronExpression::parse(expression) else {
        return 0;
    };
    let mut candidate = floor_to_minute(from) + Duration::minutes(1);
    let mut missed = 0;
    let mut steps = 0;
    while candidate <= *to && steps < CATCHUP_SCAN_LIMIT {
        if expr.matches(&candidate) {
            missed += 1;
        }
        candidate += Duration::minutes(1);
        steps += 1;
    }
    missed
}

fn floor_to_minute<Tz: TimeZone>(at: &DateTime<Tz>) -> DateTime<Tz> {
    at.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or_else(|| at.clone())
}
