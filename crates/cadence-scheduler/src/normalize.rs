//! Schedule normalization: user-facing schedule descriptions to
//! [`TriggerSpec`] plus the [`ScheduleKind`] needed to describe them again.
//!
//! | schedule_type | date_type      | Trigger                               |
//! |---------------|----------------|---------------------------------------|
//! | `date`        | `once`         | `OneShotAt(run_date)`                 |
//! | `date`        | `daily`        | `Cron(0 M H * * *)`                   |
//! | `date`        | `weekly`       | `Cron(0 M H * * <weekday>)`           |
//! | `date`        | `monthly`      | `Cron(0 M H <day> * *)`               |
//! | `date`        | `every_x_days` | `Periodic(days * 86400)`              |
//! | `interval`    |                | `Periodic(interval)`                  |
//! | `cron`        |                | `Cron(cron_expression)`               |
//! | `trigger`     |                | `Reactive(conditions, operator)`      |

use std::collections::HashSet;

use chrono::{
    DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, Offset, TimeZone, Timelike, Utc,
};

use crate::{
    cron::{spec_from_expression, WEEKDAY_NAMES},
    error::{Result, SchedulerError},
    types::{
        CronSpec, DateType, LogicalOperator, ScheduleDescription, ScheduleKind, ScheduleType,
        TriggerSpec,
    },
};

const SECS_PER_DAY: u64 = 86_400;

/// What the normalizer needs to know about the registry.
pub struct NormalizeContext<'a> {
    /// Id of the job being defined; a reactive job may not depend on itself.
    pub job_id: &'a str,
    /// Ids of every currently registered job.
    pub known_ids: &'a HashSet<String>,
}

/// Translate a schedule description into its normalized trigger.
pub fn normalize(
    desc: &ScheduleDescription,
    ctx: &NormalizeContext<'_>,
) -> Result<(TriggerSpec, ScheduleKind)> {
    let schedule_type = desc
        .schedule_type
        .ok_or_else(|| SchedulerError::validation("schedule_type is required"))?;

    match schedule_type {
        ScheduleType::Date => normalize_date(desc),

        ScheduleType::Interval => {
            let seconds = positive(desc.interval, "interval")?;
            Ok((
                TriggerSpec::Periodic { every_secs: seconds },
                ScheduleKind::Interval { seconds },
            ))
        }

        ScheduleType::Cron => {
            let expression = desc
                .cron_expression
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| SchedulerError::validation("cron_expression is required"))?;
            let spec = spec_from_expression(expression)?;
            Ok((
                TriggerSpec::Cron(spec),
                ScheduleKind::Cron {
                    expression: expression.to_string(),
                },
            ))
        }

        ScheduleType::Trigger => normalize_trigger(desc, ctx),
    }
}

fn normalize_date(desc: &ScheduleDescription) -> Result<(TriggerSpec, ScheduleKind)> {
    let date_type = desc
        .date_type
        .ok_or_else(|| SchedulerError::validation("date_type is required for date schedules"))?;

    let run_date = || {
        desc.run_date
            .as_deref()
            .ok_or_else(|| SchedulerError::validation("run_date is required for date schedules"))
            .and_then(parse_instant)
    };

    Ok(match date_type {
        DateType::EveryXDays => {
            let days = positive(desc.days, "days")?;
            let days =
                u32::try_from(days).map_err(|_| SchedulerError::validation("days is too large"))?;
            (
                TriggerSpec::Periodic {
                    every_secs: u64::from(days) * SECS_PER_DAY,
                },
                ScheduleKind::EveryXDays { days },
            )
        }
        DateType::Once => {
            let (run_date, instant) = run_date()?;
            (
                TriggerSpec::OneShotAt {
                    at: instant.with_timezone(&Utc),
                },
                ScheduleKind::Once { run_date },
            )
        }
        DateType::Daily => {
            let (run_date, instant) = run_date()?;
            (
                TriggerSpec::Cron(at_time(&instant, "*", "*")),
                ScheduleKind::Daily { run_date },
            )
        }
        DateType::Weekly => {
            let (run_date, instant) = run_date()?;
            let weekday = WEEKDAY_NAMES[instant.weekday().num_days_from_sunday() as usize];
            (
                TriggerSpec::Cron(at_time(&instant, "*", weekday)),
                ScheduleKind::Weekly { run_date },
            )
        }
        DateType::Monthly => {
            let (run_date, instant) = run_date()?;
            let day = instant.day().to_string();
            (
                TriggerSpec::Cron(at_time(&instant, &day, "*")),
                ScheduleKind::Monthly { run_date },
            )
        }
    })
}

/// Cron fields firing at the instant's literal hour and minute.
fn at_time(instant: &DateTime<FixedOffset>, day_of_month: &str, day_of_week: &str) -> CronSpec {
    CronSpec {
        second: "0".to_string(),
        minute: instant.minute().to_string(),
        hour: instant.hour().to_string(),
        day_of_month: day_of_month.to_string(),
        month: "*".to_string(),
        day_of_week: day_of_week.to_string(),
    }
}

fn normalize_trigger(
    desc: &ScheduleDescription,
    ctx: &NormalizeContext<'_>,
) -> Result<(TriggerSpec, ScheduleKind)> {
    let conditions = desc
        .conditions
        .as_ref()
        .filter(|c| !c.is_empty())
        .ok_or_else(|| SchedulerError::validation("trigger schedules need at least one condition"))?;

    for condition in conditions {
        if condition.job_id == ctx.job_id {
            return Err(SchedulerError::validation(format!(
                "job {} cannot be triggered by itself",
                ctx.job_id
            )));
        }
        if !ctx.known_ids.contains(&condition.job_id) {
            return Err(SchedulerError::validation(format!(
                "condition references unknown job {}",
                condition.job_id
            )));
        }
    }

    let operator = match desc.logical_operator.as_deref() {
        None => LogicalOperator::And,
        Some(s) => s.parse().map_err(SchedulerError::Validation)?,
    };

    Ok((
        TriggerSpec::Reactive {
            conditions: conditions.clone(),
            operator,
        },
        ScheduleKind::Trigger,
    ))
}

/// Rebuild the user-facing description of a normalized schedule.
pub fn describe(kind: &ScheduleKind, trigger: &TriggerSpec) -> ScheduleDescription {
    let date = |date_type: DateType, run_date: &str| ScheduleDescription {
        schedule_type: Some(ScheduleType::Date),
        date_type: Some(date_type),
        run_date: Some(run_date.to_string()),
        ..Default::default()
    };

    match kind {
        ScheduleKind::Once { run_date } => date(DateType::Once, run_date),
        ScheduleKind::Daily { run_date } => date(DateType::Daily, run_date),
        ScheduleKind::Weekly { run_date } => date(DateType::Weekly, run_date),
        ScheduleKind::Monthly { run_date } => date(DateType::Monthly, run_date),
        ScheduleKind::EveryXDays { days } => ScheduleDescription {
            schedule_type: Some(ScheduleType::Date),
            date_type: Some(DateType::EveryXDays),
            days: Some(i64::from(*days)),
            ..Default::default()
        },
        ScheduleKind::Interval { seconds } => ScheduleDescription {
            schedule_type: Some(ScheduleType::Interval),
            interval: i64::try_from(*seconds).ok(),
            ..Default::default()
        },
        ScheduleKind::Cron { expression } => ScheduleDescription {
            schedule_type: Some(ScheduleType::Cron),
            cron_expression: Some(expression.clone()),
            ..Default::default()
        },
        ScheduleKind::Trigger => {
            let (conditions, operator) = match trigger {
                TriggerSpec::Reactive {
                    conditions,
                    operator,
                } => (conditions.clone(), *operator),
                _ => (Vec::new(), LogicalOperator::And),
            };
            ScheduleDescription {
                schedule_type: Some(ScheduleType::Trigger),
                conditions: Some(conditions),
                logical_operator: Some(operator.to_string()),
                ..Default::default()
            }
        }
    }
}

fn positive(value: Option<i64>, field: &str) -> Result<u64> {
    match value {
        Some(v) if v > 0 => Ok(v as u64),
        Some(v) => Err(SchedulerError::validation(format!(
            "{field} must be a positive integer, got {v}"
        ))),
        None => Err(SchedulerError::validation(format!("{field} is required"))),
    }
}

/// Parse an ISO-8601 instant.
///
/// A trailing `Z` is rewritten to `+00:00` and the rewritten text is what
/// gets stored for display. Values without an offset are taken as UTC. The
/// returned instant keeps its literal offset so hour/minute/weekday come
/// from the text as written.
pub fn parse_instant(raw: &str) -> Result<(String, DateTime<FixedOffset>)> {
    let trimmed = raw.trim();
    let text = match trimmed.strip_suffix('Z').or_else(|| trimmed.strip_suffix('z')) {
        Some(head) => format!("{head}+00:00"),
        None => trimmed.to_string(),
    };

    if let Ok(dt) = DateTime::parse_from_rfc3339(&text) {
        return Ok((text, dt));
    }
    for fmt in ["%Y-%m-%dT%H:%M%:z", "%Y-%m-%d %H:%M%:z"] {
        if let Ok(dt) = DateTime::parse_from_str(&text, fmt) {
            return Ok((text, dt));
        }
    }

    let utc = Utc.fix();
    for fmt in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&text, fmt) {
            return Ok((text, utc.from_utc_datetime(&naive)));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(&text, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Ok((text, utc.from_utc_datetime(&naive)));
        }
    }

    Err(SchedulerError::validation(format!(
        "run_date is not an ISO-8601 instant: {raw}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Condition, Outcome};

    fn ctx<'a>(job_id: &'a str, known: &'a HashSet<String>) -> NormalizeContext<'a> {
        NormalizeContext {
            job_id,
            known_ids: known,
        }
    }

    fn date_desc(date_type: DateType, run_date: &str) -> ScheduleDescription {
        ScheduleDescription {
            schedule_type: Some(ScheduleType::Date),
            date_type: Some(date_type),
            run_date: Some(run_date.to_string()),
            ..Default::default()
        }
    }

    fn trigger_desc(conditions: Vec<Condition>, op: Option<&str>) -> ScheduleDescription {
        ScheduleDescription {
            schedule_type: Some(ScheduleType::Trigger),
            conditions: Some(conditions),
            logical_operator: op.map(str::to_string),
            ..Default::default()
        }
    }

    fn cond(job_id: &str, on: Outcome) -> Condition {
        Condition {
            job_id: job_id.to_string(),
            on,
        }
    }

    #[test]
    fn once_substitutes_z_and_round_trips() {
        let known = HashSet::new();
        let desc = date_desc(DateType::Once, "2024-03-04T09:30:00Z");
        let (trigger, kind) = normalize(&desc, &ctx("j", &known)).unwrap();

        let expected = DateTime::parse_from_rfc3339("2024-03-04T09:30:00+00:00")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(trigger, TriggerSpec::OneShotAt { at: expected });
        assert_eq!(
            kind,
            ScheduleKind::Once {
                run_date: "2024-03-04T09:30:00+00:00".to_string()
            }
        );

        let back = describe(&kind, &trigger);
        assert_eq!(back, date_desc(DateType::Once, "2024-03-04T09:30:00+00:00"));
    }

    #[test]
    fn once_with_offset_normalizes_to_utc() {
        let known = HashSet::new();
        let desc = date_desc(DateType::Once, "2024-03-04T09:30:00+02:00");
        let (trigger, _) = normalize(&desc, &ctx("j", &known)).unwrap();
        let TriggerSpec::OneShotAt { at } = trigger else {
            panic!("expected one-shot");
        };
        assert_eq!(at.hour(), 7);
    }

    #[test]
    fn weekly_extracts_literal_weekday_and_time() {
        let known = HashSet::new();
        // 2024-03-04 is a Monday.
        let desc = date_desc(DateType::Weekly, "2024-03-04T09:30:00Z");
        let (trigger, kind) = normalize(&desc, &ctx("j", &known)).unwrap();

        let TriggerSpec::Cron(spec) = &trigger else {
            panic!("weekly lowers to cron");
        };
        assert_eq!(spec.day_of_week, "mon");
        assert_eq!(spec.hour, "9");
        assert_eq!(spec.minute, "30");
        assert_eq!(spec.day_of_month, "*");

        let back = describe(&kind, &trigger);
        assert_eq!(back.schedule_type, Some(ScheduleType::Date));
        assert_eq!(back.date_type, Some(DateType::Weekly));
        assert_eq!(back.run_date.as_deref(), Some("2024-03-04T09:30:00+00:00"));
    }

    #[test]
    fn wall_clock_uses_literal_components_not_utc() {
        let known = HashSet::new();
        let desc = date_desc(DateType::Daily, "2024-03-04T23:15:00-05:00");
        let (trigger, _) = normalize(&desc, &ctx("j", &known)).unwrap();
        let TriggerSpec::Cron(spec) = trigger else {
            panic!("daily lowers to cron");
        };
        assert_eq!(spec.hour, "23");
        assert_eq!(spec.minute, "15");
    }

    #[test]
    fn monthly_keeps_day_of_month() {
        let known = HashSet::new();
        let desc = date_desc(DateType::Monthly, "2024-01-31T06:00:00");
        let (trigger, _) = normalize(&desc, &ctx("j", &known)).unwrap();
        let TriggerSpec::Cron(spec) = trigger else {
            panic!("monthly lowers to cron");
        };
        assert_eq!(spec.day_of_month, "31");
        assert_eq!(spec.day_of_week, "*");
        assert_eq!(spec.hour, "6");
    }

    #[test]
    fn every_x_days_is_whole_day_periodic() {
        let known = HashSet::new();
        let desc = ScheduleDescription {
            schedule_type: Some(ScheduleType::Date),
            date_type: Some(DateType::EveryXDays),
            days: Some(3),
            ..Default::default()
        };
        let (trigger, kind) = normalize(&desc, &ctx("j", &known)).unwrap();
        assert_eq!(trigger, TriggerSpec::Periodic { every_secs: 3 * 86_400 });
        assert_eq!(describe(&kind, &trigger), desc);
    }

    #[test]
    fn interval_must_be_positive() {
        let known = HashSet::new();
        for bad in [Some(0), Some(-5), None] {
            let desc = ScheduleDescription {
                schedule_type: Some(ScheduleType::Interval),
                interval: bad,
                ..Default::default()
            };
            assert!(matches!(
                normalize(&desc, &ctx("j", &known)),
                Err(SchedulerError::Validation(_))
            ));
        }
    }

    #[test]
    fn cron_field_count_is_checked() {
        let known = HashSet::new();
        let mk = |expr: &str| ScheduleDescription {
            schedule_type: Some(ScheduleType::Cron),
            cron_expression: Some(expr.to_string()),
            ..Default::default()
        };
        assert!(normalize(&mk("0 9 * * 1"), &ctx("j", &known)).is_ok());
        assert!(normalize(&mk("0 0 9 * * 1"), &ctx("j", &known)).is_ok());
        assert!(matches!(
            normalize(&mk("0 9 * *"), &ctx("j", &known)),
            Err(SchedulerError::Validation(msg)) if msg.contains("wrong field count")
        ));
        assert!(matches!(
            normalize(&mk("0 0 9 * * 1 2024"), &ctx("j", &known)),
            Err(SchedulerError::Validation(msg)) if msg.contains("wrong field count")
        ));
    }

    #[test]
    fn trigger_rejects_self_reference() {
        let known: HashSet<String> = ["a".to_string(), "me".to_string()].into();
        let desc = trigger_desc(vec![cond("a", Outcome::Success), cond("me", Outcome::Success)], None);
        assert!(matches!(
            normalize(&desc, &ctx("me", &known)),
            Err(SchedulerError::Validation(_))
        ));
    }

    #[test]
    fn trigger_rejects_unknown_job() {
        let known: HashSet<String> = ["a".to_string()].into();
        let desc = trigger_desc(vec![cond("ghost", Outcome::Failure)], None);
        assert!(matches!(
            normalize(&desc, &ctx("me", &known)),
            Err(SchedulerError::Validation(_))
        ));
    }

    #[test]
    fn trigger_rejects_empty_conditions() {
        let known = HashSet::new();
        let desc = trigger_desc(vec![], None);
        assert!(normalize(&desc, &ctx("me", &known)).is_err());
    }

    #[test]
    fn trigger_operator_defaults_to_and_and_is_case_insensitive() {
        let known: HashSet<String> = ["a".to_string()].into();
        let (trigger, kind) =
            normalize(&trigger_desc(vec![cond("a", Outcome::Success)], None), &ctx("me", &known))
                .unwrap();
        assert!(matches!(
            trigger,
            TriggerSpec::Reactive { operator: LogicalOperator::And, .. }
        ));

        let (trigger, _) =
            normalize(&trigger_desc(vec![cond("a", Outcome::Success)], Some("or")), &ctx("me", &known))
                .unwrap();
        assert!(matches!(
            trigger,
            TriggerSpec::Reactive { operator: LogicalOperator::Or, .. }
        ));

        let back = describe(&kind, &trigger);
        assert_eq!(back.logical_operator.as_deref(), Some("OR"));
        assert_eq!(back.conditions, Some(vec![cond("a", Outcome::Success)]));

        assert!(normalize(
            &trigger_desc(vec![cond("a", Outcome::Success)], Some("nand")),
            &ctx("me", &known)
        )
        .is_err());
    }

    #[test]
    fn missing_schedule_type_is_rejected() {
        let known = HashSet::new();
        assert!(matches!(
            normalize(&ScheduleDescription::default(), &ctx("j", &known)),
            Err(SchedulerError::Validation(_))
        ));
    }

    #[test]
    fn malformed_run_date_is_rejected() {
        assert!(parse_instant("next tuesday").is_err());
        assert!(parse_instant("2024-03-04").is_ok());
        assert!(parse_instant("2024-03-04T09:30").is_ok());
    }
}
