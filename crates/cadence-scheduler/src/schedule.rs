use chrono::{DateTime, Datelike, Duration, Utc};
use tracing::warn;

use crate::{
    cron::CronSchedule,
    types::{RuntimePolicy, TriggerSpec},
};

/// Last year a timer instant may fall in; later ones cannot be stored.
pub const MAX_YEAR: i32 = 9999;

/// First timer firing for a freshly activated trigger.
///
/// `None` for reactive triggers, which only the dependency evaluator fires,
/// and for schedules with no firing up to [`MAX_YEAR`]. A one-shot instant in
/// the past is returned as is; the engine's misfire policy decides what
/// happens to it.
pub fn first_fire(trigger: &TriggerSpec, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let next = match trigger {
        TriggerSpec::OneShotAt { at } => Some(*at),
        TriggerSpec::Periodic { every_secs } => now.checked_add_signed(period(*every_secs)?),
        TriggerSpec::Cron(spec) => cron_next(spec, now),
        TriggerSpec::Reactive { .. } => None,
    };
    next.filter(storable)
}

/// Firing that follows the one scheduled at `scheduled`, processed at `now`.
///
/// With `coalesce` the result is always after `now`, so any backlog of
/// missed firings collapses into the one just processed. Without it the
/// schedule advances by exactly one step and the engine sees the remaining
/// backlog on later ticks.
pub fn following_fire(
    trigger: &TriggerSpec,
    scheduled: DateTime<Utc>,
    now: DateTime<Utc>,
    coalesce: bool,
) -> Option<DateTime<Utc>> {
    let next = match trigger {
        TriggerSpec::OneShotAt { .. } | TriggerSpec::Reactive { .. } => None,

        TriggerSpec::Periodic { every_secs } => {
            let step = period(*every_secs)?;
            if !coalesce || now < scheduled {
                scheduled.checked_add_signed(step)
            } else {
                let behind = (now - scheduled).num_seconds();
                let steps = behind / step.num_seconds() + 1;
                scheduled.checked_add_signed(step.checked_mul(i32::try_from(steps).ok()?)?)
            }
        }

        TriggerSpec::Cron(spec) => {
            let after = if coalesce { now.max(scheduled) } else { scheduled };
            cron_next(spec, after)
        }
    };
    next.filter(storable)
}

fn storable(ts: &DateTime<Utc>) -> bool {
    ts.year() <= MAX_YEAR
}

/// How a due firing is treated once its lateness is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Firing {
    /// Within the grace period.
    OnTime,
    /// Late, but runs once in place of everything that was missed.
    CatchUp,
    /// Late and not coalesced: skipped.
    Missed,
}

impl Firing {
    pub fn should_run(self) -> bool {
        !matches!(self, Firing::Missed)
    }
}

pub fn classify(scheduled: DateTime<Utc>, now: DateTime<Utc>, policy: &RuntimePolicy) -> Firing {
    let late = (now - scheduled).num_seconds();
    let grace = i64::try_from(policy.misfire_grace_secs).unwrap_or(i64::MAX);
    if late <= grace {
        Firing::OnTime
    } else if policy.coalesce {
        Firing::CatchUp
    } else {
        Firing::Missed
    }
}

fn period(every_secs: u64) -> Option<Duration> {
    Duration::try_seconds(i64::try_from(every_secs).ok()?).filter(|d| d.num_seconds() > 0)
}

fn cron_next(spec: &crate::types::CronSpec, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match CronSchedule::from_spec(spec) {
        Ok(schedule) => schedule.next_after(after),
        Err(e) => {
            warn!("stored cron spec no longer parses: {e}");
            None
        }
    }
}
