//! Business-day arithmetic for the payday reminder.
//!
//! A business day is Monday through Friday. There is no holiday calendar:
//! a payday that falls on a public holiday is still reported on that date.

use chrono::{Datelike, Duration, NaiveDate, Weekday};

pub fn is_business_day(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// The `n`th (1-based) business day of `year`/`month`, or `None` when the
/// month has fewer than `n` business days or `n == 0`.
pub fn nth_business_day(year: i32, month: u32, n: u32) -> Option<NaiveDate> {
    if n == 0 {
        return None;
    }
    let mut date = NaiveDate::from_ymd_opt(year, month, 1)?;
    let mut seen = 0;
    while date.month() == month {
        if is_business_day(date) {
            seen += 1;
            if seen == n {
                return Some(date);
            }
        }
        date = date.succ_opt()?;
    }
    None
}

/// The business day `k` business days before `date` (`k == 0` returns `date`).
///
/// May land in the previous month.
pub fn business_days_before(date: NaiveDate, k: u32) -> NaiveDate {
    let mut d = date;
    let mut remaining = k;
    while remaining > 0 {
        d -= Duration::days(1);
        if is_business_day(d) {
            remaining -= 1;
        }
    }
    d
}

/// Payday and its reminder date for one month.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaydaySchedule {
    pub target: NaiveDate,
    pub reminder: NaiveDate,
}

impl PaydaySchedule {
    pub fn for_month(year: i32, month: u32, nth: u32, lead: u32) -> Option<Self> {
        let target = nth_business_day(year, month, nth)?;
        Some(Self {
            target,
            reminder: business_days_before(target, lead),
        })
    }
}

/// Schedules for the month containing `today` and the following month.
///
/// The next month is included because its reminder can fall late in the
/// current month.
pub fn schedules_around(today: NaiveDate, nth: u32, lead: u32) -> Vec<PaydaySchedule> {
    let (next_year, next_month) = if today.month() == 12 {
        (today.year() + 1, 1)
    } else {
        (today.year(), today.month() + 1)
    };
    [
        PaydaySchedule::for_month(today.year(), today.month(), nth, lead),
        PaydaySchedule::for_month(next_year, next_month, nth, lead),
    ]
    .into_iter()
    .flatten()
    .collect()
}
