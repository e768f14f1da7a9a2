//! Local wall-clock occurrence generation
//!
//! Expansion happens entirely in naive local time: the caller converts
//! the series start into its timezone's wall clock first and maps each
//! generated occurrence back to an absolute instant afterwards. Keeping
//! timezone conversion at the boundary is what preserves "2 PM local"
//! across daylight-saving transitions.

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Weekday};

use super::rule::{Frequency, RecurrenceRule};

/// Generate the rule's occurrences `t` with `dtstart <= t <= horizon`,
/// honoring the rule's own COUNT/UNTIL bounds
///
/// A horizon before the series start yields no occurrences; that is a
/// valid, empty expansion rather than an error. Every occurrence carries
/// the start's time-of-day.
pub fn occurrences_between(
    rule: &RecurrenceRule,
    dtstart: NaiveDateTime,
    horizon: NaiveDateTime,
) -> Vec<NaiveDateTime> {
    let time_of_day = dtstart.time();
    let limit = match rule.until {
        Some(until) if until < horizon => until,
        _ => horizon,
    };
    if limit < dtstart {
        return Vec::new();
    }

    let mut occurrences = Vec::new();
    let mut period = 0u32;

    loop {
        let Some(candidates) = period_candidates(rule, dtstart.date(), period) else {
            break;
        };
        let Some(first_day) = period_start(rule, dtstart.date(), period) else {
            break;
        };
        if first_day.and_time(time_of_day) > limit {
            break;
        }

        for date in candidates {
            let occurrence = date.and_time(time_of_day);
            if occurrence < dtstart {
                continue;
            }
            if occurrence > limit {
                // Candidates are sorted within the period, and later
                // periods only move forward
                return occurrences;
            }
            occurrences.push(occurrence);
            if let Some(count) = rule.count {
                if occurrences.len() as u32 >= count {
                    return occurrences;
                }
            }
        }

        period += 1;
    }

    occurrences
}

/// First calendar day of the given period, used to bound iteration
fn period_start(rule: &RecurrenceRule, start: NaiveDate, period: u32) -> Option<NaiveDate> {
    let step = (period * rule.interval) as i64;
    match rule.freq {
        Frequency::Daily => start.checked_add_signed(Duration::days(step)),
        Frequency::Weekly => week_start(start).checked_add_signed(Duration::weeks(step)),
        Frequency::Monthly => {
            let (year, month) = shift_month(start.year(), start.month(), step)?;
            NaiveDate::from_ymd_opt(year, month, 1)
        }
        Frequency::Yearly => NaiveDate::from_ymd_opt(start.year() + step as i32, 1, 1),
    }
}

/// Candidate occurrence dates within one period, sorted ascending
fn period_candidates(
    rule: &RecurrenceRule,
    start: NaiveDate,
    period: u32,
) -> Option<Vec<NaiveDate>> {
    let step = (period * rule.interval) as i64;
    let mut candidates = match rule.freq {
        Frequency::Daily => {
            let date = start.checked_add_signed(Duration::days(step))?;
            let mut days = vec![date];
            if !rule.by_day.is_empty() {
                days.retain(|d| rule.by_day.contains(&d.weekday()));
            }
            if !rule.by_month_day.is_empty() {
                days.retain(|d| month_day_matches(*d, &rule.by_month_day));
            }
            days
        }
        Frequency::Weekly => {
            let week = week_start(start).checked_add_signed(Duration::weeks(step))?;
            let weekdays: Vec<Weekday> = if rule.by_day.is_empty() {
                vec![start.weekday()]
            } else {
                rule.by_day.clone()
            };
            let mut days: Vec<NaiveDate> = weekdays
                .iter()
                .filter_map(|wd| {
                    week.checked_add_signed(Duration::days(
                        wd.num_days_from_monday() as i64
                    ))
                })
                .collect();
            days.sort_unstable();
            days
        }
        Frequency::Monthly => {
            let (year, month) = shift_month(start.year(), start.month(), step)?;
            month_candidates(rule, year, month, start.day())
        }
        Frequency::Yearly => {
            let year = start.year() + step as i32;
            month_candidates(rule, year, start.month(), start.day())
        }
    };

    if !rule.by_set_pos.is_empty() {
        candidates = apply_set_pos(candidates, &rule.by_set_pos);
    }
    Some(candidates)
}

/// Candidate dates within one month, before BYSETPOS selection
fn month_candidates(
    rule: &RecurrenceRule,
    year: i32,
    month: u32,
    default_day: u32,
) -> Vec<NaiveDate> {
    let len = days_in_month(year, month);

    if !rule.by_day.is_empty() {
        let mut days: Vec<NaiveDate> = (1..=len)
            .filter_map(|day| NaiveDate::from_ymd_opt(year, month, day))
            .filter(|d| rule.by_day.contains(&d.weekday()))
            .collect();
        days.sort_unstable();
        return days;
    }

    if !rule.by_month_day.is_empty() {
        let mut days: Vec<NaiveDate> = rule
            .by_month_day
            .iter()
            .filter_map(|&day| resolve_month_day(year, month, day))
            .collect();
        days.sort_unstable();
        days.dedup();
        return days;
    }

    // Anniversary date; months without it (e.g. the 31st) yield nothing
    NaiveDate::from_ymd_opt(year, month, default_day)
        .into_iter()
        .collect()
}

/// Select ordinal positions from a period's candidate set
fn apply_set_pos(candidates: Vec<NaiveDate>, set_pos: &[i32]) -> Vec<NaiveDate> {
    let len = candidates.len() as i32;
    let mut selected: Vec<NaiveDate> = set_pos
        .iter()
        .filter_map(|&pos| {
            let index = if pos > 0 { pos - 1 } else { len + pos };
            if (0..len).contains(&index) {
                Some(candidates[index as usize])
            } else {
                None
            }
        })
        .collect();
    selected.sort_unstable();
    selected.dedup();
    selected
}

fn month_day_matches(date: NaiveDate, by_month_day: &[i32]) -> bool {
    by_month_day
        .iter()
        .any(|&day| resolve_month_day(date.year(), date.month(), day) == Some(date))
}

/// Resolve a possibly-negative day-of-month to a concrete date
fn resolve_month_day(year: i32, month: u32, day: i32) -> Option<NaiveDate> {
    let len = days_in_month(year, month) as i32;
    let resolved = if day > 0 { day } else { len + 1 + day };
    if resolved < 1 || resolved > len {
        return None;
    }
    NaiveDate::from_ymd_opt(year, month, resolved as u32)
}

fn week_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.weekday().num_days_from_monday() as i64)
}

fn shift_month(year: i32, month: u32, months: i64) -> Option<(i32, u32)> {
    let total = year as i64 * 12 + (month as i64 - 1) + months;
    let shifted_year = total.div_euclid(12);
    let shifted_month = total.rem_euclid(12) + 1;
    Some((i32::try_from(shifted_year).ok()?, shifted_month as u32))
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(30)
}
