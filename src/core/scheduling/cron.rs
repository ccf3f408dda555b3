//! Cron expressions for scheduled tasks.
//! Supports: "MIN HOUR DOM MON DOW" (5 fields) or "SEC MIN HOUR DOM MON DOW" (6 fields)
//! Fields: *, */N, N, A-B, A-B/N and comma lists of those
//! DOW takes 0-7 (0 and 7 are Sunday). When both DOM and DOW are restricted a
//! day matches if either does, as in classic cron.
//! Example: "0 9 * * 1,3,5" = Mon/Wed/Fri at 09:00

use super::schedule_models::ScheduleConfigError;
use chrono::{Datelike, NaiveDate, NaiveTime};
use std::collections::BTreeSet;

/// Longest day-of-month per month, February counted as a leap month.
const MONTH_LENGTHS: [u32; 12] = [31, 29, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    seconds: BTreeSet<u32>,
    minutes: BTreeSet<u32>,
    hours: BTreeSet<u32>,
    days_of_month: BTreeSet<u32>,
    months: BTreeSet<u32>,
    /// 0 = Sunday.
    weekdays: BTreeSet<u32>,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    /// Whether the expression fires at some time on `date`.
    pub fn matches_date(&self, date: NaiveDate) -> bool {
        if !self.months.contains(&date.month()) {
            return false;
        }
        let dom = self.days_of_month.contains(&date.day());
        let dow = self
            .weekdays
            .contains(&date.weekday().num_days_from_sunday());

        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    /// Times of day the expression fires on a matching date, ascending.
    pub fn times(&self) -> Vec<NaiveTime> {
        let mut times =
            Vec::with_capacity(self.hours.len() * self.minutes.len() * self.seconds.len());
        for h in &self.hours {
            for m in &self.minutes {
                for s in &self.seconds {
                    if let Some(t) = NaiveTime::from_hms_opt(*h, *m, *s) {
                        times.push(t);
                    }
                }
            }
        }
        times
    }

    /// Some listed day-of-month exists in some listed month.
    fn day_of_month_reachable(&self) -> bool {
        self.months.iter().any(|month| {
            let longest = MONTH_LENGTHS[(*month - 1) as usize];
            self.days_of_month.iter().any(|day| *day <= longest)
        })
    }
}

pub fn parse(expression: &str) -> Result<CronSchedule, ScheduleConfigError> {
    let invalid = |reason: String| ScheduleConfigError::InvalidCron {
        expression: expression.to_string(),
        reason,
    };

    let parts: Vec<&str> = expression.split_whitespace().collect();
    let (seconds, rest) = match parts.len() {
        5 => (BTreeSet::from([0]), &parts[..]),
        6 => (
            parse_field(parts[0], 0, 59).map_err(|e| invalid(format!("second: {e}")))?,
            &parts[1..],
        ),
        n => {
            return Err(invalid(format!(
                "need 5 fields (MIN HOUR DOM MON DOW) or 6 with leading seconds, got {n}"
            )))
        }
    };

    let minutes = parse_field(rest[0], 0, 59).map_err(|e| invalid(format!("minute: {e}")))?;
    let hours = parse_field(rest[1], 0, 23).map_err(|e| invalid(format!("hour: {e}")))?;
    let days_of_month =
        parse_field(rest[2], 1, 31).map_err(|e| invalid(format!("day-of-month: {e}")))?;
    let months = parse_field(rest[3], 1, 12).map_err(|e| invalid(format!("month: {e}")))?;
    let weekdays = parse_field(rest[4], 0, 7)
        .map_err(|e| invalid(format!("day-of-week: {e}")))?
        .into_iter()
        .map(|d| d % 7)
        .collect();

    let schedule = CronSchedule {
        seconds,
        minutes,
        hours,
        days_of_month,
        months,
        weekdays,
        dom_restricted: !rest[2].starts_with('*'),
        dow_restricted: !rest[4].starts_with('*'),
    };

    if schedule.dom_restricted && !schedule.dow_restricted && !schedule.day_of_month_reachable() {
        return Err(invalid(
            "day-of-month never occurs in the selected months".to_string(),
        ));
    }

    Ok(schedule)
}

/// Parse one field into its set of values.
fn parse_field(field: &str, min: u32, max: u32) -> Result<BTreeSet<u32>, String> {
    let mut values = BTreeSet::new();

    for part in field.split(',') {
        let part = part.trim();

        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let n: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step '{step}'"))?;
                if n == 0 {
                    return Err("step must be at least 1".to_string());
                }
                (range, n as usize)
            }
            None => (part, 1),
        };

        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((start, end)) = range.split_once('-') {
            let start = parse_value(start, min, max)?;
            let end = parse_value(end, min, max)?;
            if start > end {
                return Err(format!("range '{range}' is inverted"));
            }
            (start, end)
        } else {
            let value = parse_value(range, min, max)?;
            // N/S runs from N to the end of the field.
            (value, if step > 1 { max } else { value })
        };

        values.extend((start..=end).step_by(step));
    }

    Ok(values)
}

fn parse_value(raw: &str, min: u32, max: u32) -> Result<u32, String> {
    let n: u32 = raw
        .trim()
        .parse()
        .map_err(|_| format!("'{raw}' is not a number"))?;
    if n < min || n > max {
        return Err(format!("{n} is outside {min}-{max}"));
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn weekday_list_at_fixed_time() {
        let schedule = parse("0 9 * * 1,3,5").unwrap();
        assert_eq!(schedule.times(), vec![t(9, 0)]);
        // 2026-05-04 is a Monday.
        assert!(schedule.matches_date(date(2026, 5, 4)));
        assert!(!schedule.matches_date(date(2026, 5, 5)));
        assert!(schedule.matches_date(date(2026, 5, 6)));
    }

    #[test]
    fn every_day_matches_all_dates() {
        let schedule = parse("30 8,20 * * *").unwrap();
        assert_eq!(schedule.times(), vec![t(8, 30), t(20, 30)]);
        assert!((1..=7).all(|d| schedule.matches_date(date(2026, 5, d))));
    }

    #[test]
    fn sunday_can_be_zero_or_seven() {
        let zero = parse("0 12 * * 0").unwrap();
        let seven = parse("0 12 * * 7").unwrap();
        // 2026-05-10 is a Sunday.
        assert!(zero.matches_date(date(2026, 5, 10)));
        assert!(seven.matches_date(date(2026, 5, 10)));
        assert_eq!(zero, seven);
    }

    #[test]
    fn steps_and_ranges() {
        let schedule = parse("*/20 9-10 * * 1-5").unwrap();
        assert_eq!(
            schedule.times(),
            vec![t(9, 0), t(9, 20), t(9, 40), t(10, 0), t(10, 20), t(10, 40)]
        );
        assert!(!schedule.matches_date(date(2026, 5, 9)));

        let schedule = parse("0 8-18/5 * * *").unwrap();
        assert_eq!(schedule.times(), vec![t(8, 0), t(13, 0), t(18, 0)]);
    }

    #[test]
    fn day_of_month_and_month_are_honoured() {
        let schedule = parse("0 9 1,15 * *").unwrap();
        assert!(schedule.matches_date(date(2026, 5, 1)));
        assert!(schedule.matches_date(date(2026, 5, 15)));
        assert!(!schedule.matches_date(date(2026, 5, 2)));

        let june = parse("0 9 * 6 *").unwrap();
        assert!(june.matches_date(date(2026, 6, 20)));
        assert!(!june.matches_date(date(2026, 7, 20)));
    }

    #[test]
    fn restricted_day_of_month_or_weekday_either_matches() {
        // The 13th, or any Friday.
        let schedule = parse("0 9 13 * 5").unwrap();
        assert!(schedule.matches_date(date(2026, 5, 13)));
        assert!(schedule.matches_date(date(2026, 5, 8)));
        assert!(!schedule.matches_date(date(2026, 5, 12)));
    }

    #[test]
    fn six_fields_lead_with_seconds() {
        let schedule = parse("30 0 9 * * *").unwrap();
        assert_eq!(schedule.times(), vec![NaiveTime::from_hms_opt(9, 0, 30).unwrap()]);
    }

    #[test]
    fn leap_day_is_allowed_but_impossible_dates_are_not() {
        assert!(parse("0 9 29 2 *").is_ok());
        match parse("0 9 31 2,4 *") {
            Err(ScheduleConfigError::InvalidCron { reason, .. }) => {
                assert!(reason.contains("day-of-month"))
            }
            other => panic!("unexpected {other:?}"),
        }
        // A weekday list keeps it reachable.
        assert!(parse("0 9 31 2 1").is_ok());
    }

    #[test]
    fn rejects_bad_expressions() {
        for expr in [
            "bad",
            "0 9 * *",
            "0 0 0 9 * * *",
            "60 9 * * *",
            "0 24 * * *",
            "0 9 0 * *",
            "0 9 * 13 *",
            "*/0 9 * * *",
            "0 9 * * 8",
            "0 10-9 * * *",
            "60 0 9 * * *",
        ] {
            assert!(
                matches!(parse(expr), Err(ScheduleConfigError::InvalidCron { .. })),
                "{expr} should be rejected"
            );
        }
    }
}
