//! Expansion of relative date options into day-aligned bounds.

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, TimeZone};
use quarry_core::{RelationFormat, Result, SubError, Value};

use crate::request::{Condition, FilterRequest, QuickOption};

fn day_start(date: NaiveDate, tz: &FixedOffset) -> i64 {
    date.and_hms_opt(0, 0, 0)
        .and_then(|n| tz.from_local_datetime(&n).single())
        .map(|d| d.timestamp())
        .unwrap_or_default()
}

/// `None` when the shifted date falls outside the calendar.
fn shift(date: NaiveDate, days: i64) -> Option<NaiveDate> { date.checked_add_signed(Duration::try_days(days)?) }

fn days_range(from: NaiveDate, days: i64, tz: &FixedOffset) -> Option<(i64, i64)> {
    let start = day_start(from, tz);
    let end = day_start(shift(from, days)?, tz) - 1;
    Some((start, end))
}

fn month_start(year: i32, month: i32) -> NaiveDate {
    let (y, m) = if month < 1 { (year - 1, month + 12) } else if month > 12 { (year + 1, month - 12) } else { (year, month) };
    NaiveDate::from_ymd_opt(y, m as u32, 1).unwrap_or(NaiveDate::MIN)
}

fn month_range(today: NaiveDate, shift: i32, tz: &FixedOffset) -> (i64, i64) {
    let m = today.month() as i32 + shift;
    let start = month_start(today.year(), m);
    let next = month_start(today.year(), m + 1);
    (day_start(start, tz), day_start(next, tz) - 1)
}

/// `[start, end]` in unix seconds for an option, or `None` if the option does
/// not apply to `value`.
pub fn option_range(option: QuickOption, value: &Value, now: DateTime<FixedOffset>) -> Option<(i64, i64)> {
    let tz = now.offset();
    let today = now.date_naive();
    let monday = shift(today, -(today.weekday().num_days_from_monday() as i64))?;
    match option {
        QuickOption::ExactDate => {
            let ts = value.as_i64()?;
            let day = tz.timestamp_opt(ts, 0).single()?.date_naive();
            days_range(day, 1, tz)
        }
        QuickOption::Today => days_range(today, 1, tz),
        QuickOption::Yesterday => days_range(shift(today, -1)?, 1, tz),
        QuickOption::Tomorrow => days_range(shift(today, 1)?, 1, tz),
        QuickOption::CurrentWeek => days_range(monday, 7, tz),
        QuickOption::LastWeek => days_range(shift(monday, -7)?, 7, tz),
        QuickOption::NextWeek => days_range(shift(monday, 7)?, 7, tz),
        QuickOption::CurrentMonth => Some(month_range(today, 0, tz)),
        QuickOption::LastMonth => Some(month_range(today, -1, tz)),
        QuickOption::NextMonth => Some(month_range(today, 1, tz)),
        QuickOption::NumberOfDaysAgo => days_range(shift(today, value.as_i64()?.checked_neg()?)?, 1, tz),
        QuickOption::NumberOfDaysNow => days_range(shift(today, value.as_i64()?)?, 1, tz),
    }
}

/// Rewrites a date filter carrying a quick option into plain comparisons.
/// Requests without a quick option pass through unchanged; a day offset that
/// leaves the calendar is an invalid filter.
pub fn transform_quick_option(req: &FilterRequest, now: DateTime<FixedOffset>) -> Result<Vec<FilterRequest>> {
    let applies = req.quick_option != QuickOption::ExactDate || req.format == Some(RelationFormat::Date);
    if !applies {
        return Ok(vec![req.clone()]);
    }
    let Some((start, end)) = option_range(req.quick_option, &req.value, now) else {
        let relative = matches!(req.quick_option, QuickOption::NumberOfDaysAgo | QuickOption::NumberOfDaysNow);
        if relative && req.value.as_i64().is_some() {
            return Err(SubError::InvalidFilter(format!("{}: day offset {} out of range", req.relation_key, req.value.to_display())));
        }
        return Ok(vec![req.clone()]);
    };
    let bound = |condition, v: i64| FilterRequest {
        relation_key: req.relation_key.clone(),
        condition,
        value: Value::Int(v),
        format: req.format,
        ..Default::default()
    };
    Ok(match req.condition {
        Condition::Equal | Condition::In => vec![bound(Condition::LessOrEqual, end), bound(Condition::GreaterOrEqual, start)],
        Condition::Less => vec![bound(Condition::Less, start)],
        Condition::LessOrEqual => vec![bound(Condition::LessOrEqual, end)],
        Condition::Greater => vec![bound(Condition::Greater, end)],
        Condition::GreaterOrEqual => vec![bound(Condition::GreaterOrEqual, start)],
        _ => vec![req.clone()],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: i64 = 24 * 60 * 60;

    // Wednesday 2024-05-15 13:30 at UTC+2.
    fn now() -> DateTime<FixedOffset> {
        let tz = FixedOffset::east_opt(2 * 3600).expect("offset");
        tz.with_ymd_and_hms(2024, 5, 15, 13, 30, 0).single().expect("time")
    }

    fn today_start() -> i64 {
        let tz = FixedOffset::east_opt(2 * 3600).expect("offset");
        tz.with_ymd_and_hms(2024, 5, 15, 0, 0, 0).single().expect("time").timestamp()
    }

    fn quick(option: QuickOption, condition: Condition, value: i64) -> Vec<(Condition, i64)> {
        let req = FilterRequest { relation_key: "createdDate".into(), condition, value: Value::Int(value), quick_option: option, ..Default::default() };
        transform_quick_option(&req, now()).expect("in range").into_iter().map(|f| (f.condition, f.value.as_i64().unwrap_or(-1))).collect()
    }

    #[test]
    fn today_bounds_follow_condition() {
        let (s, e) = (today_start(), today_start() + DAY - 1);
        assert_eq!(quick(QuickOption::Today, Condition::Equal, 0), vec![(Condition::LessOrEqual, e), (Condition::GreaterOrEqual, s)]);
        assert_eq!(quick(QuickOption::Today, Condition::Less, 0), vec![(Condition::Less, s)]);
        assert_eq!(quick(QuickOption::Today, Condition::LessOrEqual, 0), vec![(Condition::LessOrEqual, e)]);
        assert_eq!(quick(QuickOption::Today, Condition::Greater, 0), vec![(Condition::Greater, e)]);
        assert_eq!(quick(QuickOption::Today, Condition::GreaterOrEqual, 0), vec![(Condition::GreaterOrEqual, s)]);
    }

    #[test]
    fn weeks_start_on_monday() {
        let monday = today_start() - 2 * DAY;
        assert_eq!(quick(QuickOption::CurrentWeek, Condition::In, 0), vec![(Condition::LessOrEqual, monday + 7 * DAY - 1), (Condition::GreaterOrEqual, monday)]);
        assert_eq!(quick(QuickOption::LastWeek, Condition::GreaterOrEqual, 0), vec![(Condition::GreaterOrEqual, monday - 7 * DAY)]);
        assert_eq!(quick(QuickOption::NextWeek, Condition::Greater, 0), vec![(Condition::Greater, monday + 14 * DAY - 1)]);
    }

    #[test]
    fn months_span_calendar_month() {
        let tz = FixedOffset::east_opt(2 * 3600).expect("offset");
        let may = tz.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).single().expect("time").timestamp();
        let june = tz.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).single().expect("time").timestamp();
        let april = tz.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).single().expect("time").timestamp();
        assert_eq!(quick(QuickOption::CurrentMonth, Condition::Equal, 0), vec![(Condition::LessOrEqual, june - 1), (Condition::GreaterOrEqual, may)]);
        assert_eq!(quick(QuickOption::LastMonth, Condition::Less, 0), vec![(Condition::Less, april)]);
    }

    #[test]
    fn relative_days() {
        let s = today_start();
        assert_eq!(quick(QuickOption::NumberOfDaysAgo, Condition::Equal, 6), vec![(Condition::LessOrEqual, s + DAY - 1 - 6 * DAY), (Condition::GreaterOrEqual, s - 6 * DAY)]);
        assert_eq!(quick(QuickOption::NumberOfDaysNow, Condition::Greater, 100), vec![(Condition::Greater, s + DAY - 1 + 100 * DAY)]);
    }

    #[test]
    fn exact_date_only_for_date_relations() {
        let req = FilterRequest { relation_key: "count".into(), condition: Condition::Equal, value: Value::Int(5), ..Default::default() };
        assert_eq!(transform_quick_option(&req, now()), Ok(vec![req.clone()]));
        let dated = FilterRequest { format: Some(RelationFormat::Date), value: Value::Int(today_start() + 100), ..req };
        let out = transform_quick_option(&dated, now()).expect("in range");
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].value, Value::Int(today_start()));
    }

    #[test]
    fn day_offsets_outside_the_calendar_are_rejected() {
        for option in [QuickOption::NumberOfDaysAgo, QuickOption::NumberOfDaysNow] {
            for value in [1_000_000_000, i64::MAX, i64::MIN] {
                let req = FilterRequest { relation_key: "due".into(), condition: Condition::Equal, value: Value::Int(value), quick_option: option, ..Default::default() };
                assert!(matches!(transform_quick_option(&req, now()), Err(SubError::InvalidFilter(_))), "{:?} {}", option, value);
            }
        }
        let far = FilterRequest { relation_key: "due".into(), condition: Condition::Less, value: Value::Int(200_000), quick_option: QuickOption::NumberOfDaysAgo, ..Default::default() };
        assert_eq!(transform_quick_option(&far, now()).expect("still a date").len(), 1);
    }
}
