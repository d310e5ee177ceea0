//! Cron trigger instant generation for schedules.
//!
//! Converts a cron expression and an IANA timezone into the ordered stream
//! of instants a schedule should fire at. Standard 5-field Unix cron
//! expressions are accepted and normalized to the 6-field form the `cron`
//! crate expects by prepending a seconds column of `0`.

use std::str::FromStr;

use chrono::{DateTime, Duration, SubsecRound, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use crate::error::{CoreError, CoreResult};

/// Convert a 5-field Unix cron expression to 6-field format.
fn normalize_cron_expr(cron_expr: &str) -> String {
    let fields: Vec<&str> = cron_expr.split_whitespace().collect();
    if fields.len() == 5 {
        format!("0 {}", cron_expr)
    } else {
        cron_expr.to_string()
    }
}

fn parse_cron(cron_expr: &str) -> CoreResult<Schedule> {
    let normalized = normalize_cron_expr(cron_expr);
    Schedule::from_str(&normalized).map_err(|err| CoreError::InvalidCron {
        expression: cron_expr.to_string(),
        reason: err.to_string(),
    })
}

fn parse_timezone(timezone: &str) -> CoreResult<Tz> {
    timezone.parse::<Tz>().map_err(|_| CoreError::InvalidTimezone {
        timezone: timezone.to_string(),
    })
}

/// Validate a cron expression without generating instants.
pub fn validate_cron(cron_expr: &str) -> CoreResult<()> {
    parse_cron(cron_expr).map(|_| ())
}

/// Ordered stream of trigger instants in the schedule's timezone.
///
/// Each produced instant is re-checked against the cron expression before
/// it is yielded; instants that fail the check (arithmetic artifacts around
/// DST transitions) are silently discarded and iteration continues.
#[derive(Debug, Clone)]
pub struct TriggerTimes {
    schedule: Schedule,
    cursor: DateTime<Tz>,
}

impl Iterator for TriggerTimes {
    type Item = DateTime<Tz>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let instant = self.schedule.after(&self.cursor).next()?;
            self.cursor = instant;
            if self.schedule.includes(instant) {
                return Some(instant);
            }
        }
    }
}

/// Trigger instants matching `cron_expr` in `timezone`, each >= `start`.
///
/// The cursor is seeded one tick back, so a start landing exactly on a
/// matching instant reproduces that instant first.
pub fn trigger_times(
    cron_expr: &str,
    timezone: &str,
    start: DateTime<Utc>,
) -> CoreResult<TriggerTimes> {
    let schedule = parse_cron(cron_expr)?;
    let tz = parse_timezone(timezone)?;
    let start_tz = start.with_timezone(&tz).trunc_subsecs(0);
    // Instants have whole-second resolution. A start inside a second must
    // resume at the next whole second to keep every instant >= start.
    let cursor = if start.timestamp_subsec_nanos() == 0 {
        start_tz - Duration::seconds(1)
    } else {
        start_tz
    };
    Ok(TriggerTimes { schedule, cursor })
}

/// Trigger instants strictly after `last`.
///
/// This is the restart form: resuming with the timestamp of the last
/// produced instant continues the original sequence with no duplicate.
pub fn trigger_times_after(
    cron_expr: &str,
    timezone: &str,
    last: DateTime<Utc>,
) -> CoreResult<TriggerTimes> {
    let schedule = parse_cron(cron_expr)?;
    let tz = parse_timezone(timezone)?;
    Ok(TriggerTimes {
        schedule,
        cursor: last.with_timezone(&tz),
    })
}
