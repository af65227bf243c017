//! Crontab parsing and next-fire computation.
//!
//! Supports the classic field syntax: `*`, `?`, single values, `a-b` ranges,
//! `/n` steps, comma lists, and three-letter month / weekday names. Weekdays
//! count from Sunday = 0; `7` is accepted as Sunday too. When both
//! day-of-month and day-of-week are restricted a day matches if either does.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Timelike, Utc};

use crate::{
    error::{Result, SchedulerError},
    types::CronSpec,
};

const MONTH_NAMES: &[&str] = &[
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
pub(crate) const WEEKDAY_NAMES: &[&str] = &["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// Give up searching after this many years without a match (e.g. February 30th).
const SEARCH_HORIZON_YEARS: i32 = 8;

/// Split a 5- or 6-field crontab line into a validated [`CronSpec`].
///
/// Five fields are `minute hour dom month dow` with the second fixed at 0;
/// six fields put the second first.
pub fn spec_from_expression(expression: &str) -> Result<CronSpec> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    let spec = match fields.as_slice() {
        [minute, hour, dom, month, dow] => CronSpec {
            second: "0".to_string(),
            minute: minute.to_string(),
            hour: hour.to_string(),
            day_of_month: dom.to_string(),
            month: month.to_string(),
            day_of_week: dow.to_string(),
        },
        [second, minute, hour, dom, month, dow] => CronSpec {
            second: second.to_string(),
            minute: minute.to_string(),
            hour: hour.to_string(),
            day_of_month: dom.to_string(),
            month: month.to_string(),
            day_of_week: dow.to_string(),
        },
        _ => {
            return Err(SchedulerError::validation(format!(
                "wrong field count: expected 5 or 6 fields, got {}",
                fields.len()
            )))
        }
    };
    CronSchedule::from_spec(&spec)?;
    Ok(spec)
}

/// A parsed cron schedule: one bitmask per field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    seconds: u64,
    minutes: u64,
    hours: u64,
    days: u64,
    months: u64,
    weekdays: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    pub fn from_spec(spec: &CronSpec) -> Result<Self> {
        let field = |name: &str, text: &str, min: u32, max: u32, names: &[&str], base: u32| {
            parse_field(text, min, max, names, base)
                .map_err(|e| SchedulerError::validation(format!("cron {name} field `{text}`: {e}")))
        };

        let mut weekdays = field("day_of_week", &spec.day_of_week, 0, 7, WEEKDAY_NAMES, 0)?;
        if weekdays & (1 << 7) != 0 {
            weekdays = (weekdays & !(1 << 7)) | 1;
        }

        Ok(Self {
            seconds: field("second", &spec.second, 0, 59, &[], 0)?,
            minutes: field("minute", &spec.minute, 0, 59, &[], 0)?,
            hours: field("hour", &spec.hour, 0, 23, &[], 0)?,
            days: field("day_of_month", &spec.day_of_month, 1, 31, &[], 0)?,
            months: field("month", &spec.month, 1, 12, MONTH_NAMES, 1)?,
            weekdays,
            dom_restricted: !is_wildcard(&spec.day_of_month),
            dow_restricted: !is_wildcard(&spec.day_of_week),
        })
    }

    /// First matching instant strictly after `after`, at whole-second precision.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after.naive_utc().with_nanosecond(0)? + Duration::seconds(1);
        let horizon = start.year() + SEARCH_HORIZON_YEARS;
        let mut t = start;

        while t.year() <= horizon {
            if !bit(self.months, t.month()) {
                t = first_of_next_month(t.date())?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.day_matches(t.date()) {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !bit(self.hours, t.hour()) {
                t = next_hour(t)?;
                continue;
            }
            if !bit(self.minutes, t.minute()) {
                t = next_minute(t)?;
                continue;
            }
            match (t.second()..60).find(|s| bit(self.seconds, *s)) {
                Some(s) => return Some(t.with_second(s)?.and_utc()),
                None => t = next_minute(t)?,
            }
        }
        None
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = bit(self.days, date.day());
        let dow = bit(self.weekdays, date.weekday().num_days_from_sunday());
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }
}

fn is_wildcard(text: &str) -> bool {
    matches!(text.trim(), "*" | "?")
}

fn bit(mask: u64, n: u32) -> bool {
    mask & (1u64 << n) != 0
}

fn next_hour(t: NaiveDateTime) -> Option<NaiveDateTime> {
    Some(t.with_minute(0)?.with_second(0)? + Duration::hours(1))
}

fn next_minute(t: NaiveDateTime) -> Option<NaiveDateTime> {
    Some(t.with_second(0)? + Duration::minutes(1))
}

fn first_of_next_month(d: NaiveDate) -> Option<NaiveDate> {
    if d.month() == 12 {
        NaiveDate::from_ymd_opt(d.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(d.year(), d.month() + 1, 1)
    }
}

/// Parse one field into a bitmask. `names[i]` stands for value `base + i`.
fn parse_field(
    text: &str,
    min: u32,
    max: u32,
    names: &[&str],
    base: u32,
) -> std::result::Result<u64, String> {
    let text = text.trim();
    if text.is_empty() {
        return Err("empty field".to_string());
    }

    let mut mask = 0u64;
    for part in text.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((r, s)) => {
                let step: u32 = s.parse().map_err(|_| format!("bad step `{s}`"))?;
                if step == 0 {
                    return Err("step must be positive".to_string());
                }
                (r, Some(step))
            }
            None => (part, None),
        };

        let (lo, hi) = if is_wildcard(range) {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (value(a, names, base)?, value(b, names, base)?)
        } else {
            let v = value(range, names, base)?;
            // `5/15` means "from 5 to the end in steps of 15".
            (v, if step.is_some() { max } else { v })
        };

        if lo < min || hi > max || lo > hi {
            return Err(format!("range {lo}-{hi} outside {min}-{max}"));
        }

        let step = usize::try_from(step.unwrap_or(1)).unwrap_or(usize::MAX);
        for v in (lo..=hi).step_by(step) {
            mask |= 1u64 << v;
        }
    }
    Ok(mask)
}

fn value(text: &str, names: &[&str], base: u32) -> std::result::Result<u32, String> {
    let lower = text.trim().to_ascii_lowercase();
    if let Some(i) = names.iter().position(|n| *n == lower) {
        return Ok(base + i as u32);
    }
    lower.parse().map_err(|_| format!("bad value `{text}`"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn schedule(expr: &str) -> CronSchedule {
        CronSchedule::from_spec(&spec_from_expression(expr).unwrap()).unwrap()
    }

    #[test]
    fn five_and_six_fields_are_accepted() {
        let five = spec_from_expression("*/5 * * * *").unwrap();
        assert_eq!(five.second, "0");
        assert_eq!(five.minute, "*/5");

        let six = spec_from_expression("30 0 12 * * mon-fri").unwrap();
        assert_eq!(six.second, "30");
        assert_eq!(six.hour, "12");
        assert_eq!(six.day_of_week, "mon-fri");
    }

    #[test]
    fn other_field_counts_are_rejected() {
        for expr in ["", "* * * *", "0 0 0 * * * *", "* * * * * * * *"] {
            match spec_from_expression(expr) {
                Err(SchedulerError::Validation(msg)) => assert!(msg.contains("wrong field count")),
                other => panic!("expected validation error for `{expr}`, got {other:?}"),
            }
        }
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        assert!(spec_from_expression("61 * * * *").is_err());
        assert!(spec_from_expression("* 24 * * *").is_err());
        assert!(spec_from_expression("* * 0 * *").is_err());
        assert!(spec_from_expression("* * * foo *").is_err());
        assert!(spec_from_expression("*/0 * * * *").is_err());
    }

    #[test]
    fn step_wider_than_field_keeps_only_start() {
        let s = schedule("7/4294967295 * * * *");
        assert_eq!(s.next_after(at(2024, 3, 4, 10, 0, 0)), Some(at(2024, 3, 4, 10, 7, 0)));
        assert_eq!(s.next_after(at(2024, 3, 4, 10, 7, 0)), Some(at(2024, 3, 4, 11, 7, 0)));
        assert!(spec_from_expression("*/4294967295 * * * *").is_ok());
    }

    #[test]
    fn step_fires_on_next_boundary() {
        let s = schedule("*/15 * * * *");
        assert_eq!(s.next_after(at(2024, 3, 4, 10, 7, 30)), Some(at(2024, 3, 4, 10, 15, 0)));
        assert_eq!(s.next_after(at(2024, 3, 4, 10, 45, 0)), Some(at(2024, 3, 4, 11, 0, 0)));
    }

    #[test]
    fn weekly_named_weekday() {
        let s = schedule("30 9 * * mon");
        // 2024-03-04 is a Monday.
        assert_eq!(s.next_after(at(2024, 3, 4, 8, 0, 0)), Some(at(2024, 3, 4, 9, 30, 0)));
        assert_eq!(s.next_after(at(2024, 3, 4, 9, 30, 0)), Some(at(2024, 3, 11, 9, 30, 0)));
    }

    #[test]
    fn sunday_as_seven() {
        let s = schedule("0 0 * * 7");
        // 2024-03-10 is a Sunday.
        assert_eq!(s.next_after(at(2024, 3, 4, 0, 0, 0)), Some(at(2024, 3, 10, 0, 0, 0)));
    }

    #[test]
    fn day_31_skips_short_months() {
        let s = schedule("0 12 31 * *");
        assert_eq!(s.next_after(at(2024, 3, 31, 13, 0, 0)), Some(at(2024, 5, 31, 12, 0, 0)));
    }

    #[test]
    fn restricted_dom_and_dow_match_either() {
        // 1st of the month or any Friday.
        let s = schedule("0 0 1 * fri");
        // 2024-03-04 Monday -> Friday 2024-03-08 comes before 2024-04-01.
        assert_eq!(s.next_after(at(2024, 3, 4, 0, 0, 0)), Some(at(2024, 3, 8, 0, 0, 0)));
    }

    #[test]
    fn six_field_seconds() {
        let s = schedule("15,45 * * * * *");
        assert_eq!(s.next_after(at(2024, 1, 1, 0, 0, 20)), Some(at(2024, 1, 1, 0, 0, 45)));
        assert_eq!(s.next_after(at(2024, 1, 1, 0, 0, 45)), Some(at(2024, 1, 1, 0, 1, 15)));
    }

    #[test]
    fn impossible_date_gives_none() {
        let s = schedule("0 0 30 2 *");
        assert_eq!(s.next_after(at(2024, 1, 1, 0, 0, 0)), None);
    }

    #[test]
    fn year_rollover() {
        let s = schedule("0 0 1 jan *");
        assert_eq!(s.next_after(at(2024, 6, 1, 0, 0, 0)), Some(at(2025, 1, 1, 0, 0, 0)));
    }
}
