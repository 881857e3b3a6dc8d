//! Expansion of a recurring rule into occurrence instants.
//!
//! The walk happens on the local wall clock of the event's timezone: every
//! candidate keeps the local time-of-day of `start` and is only then mapped
//! back to UTC, so a daylight-saving transition never shifts the local time of
//! an occurrence.
//!
//! Rules:
//! - `start` is always the first occurrence, whether or not it matches `byday`.
//! - WEEKLY with `byday` yields every listed weekday of each stepped week
//!   (weeks start on Monday), skipping days not after `start`.
//! - DAILY with `byday` skips the days that are not listed.
//! - MONTHLY keeps the day of month and skips months without it. With `byday`
//!   plain tokens select every such weekday of the month, ordinal tokens
//!   (`2MO`, `-1FR`) the nth one.
//! - YEARLY keeps month and day; Feb 29 only occurs in leap years.
//!
//! `count` includes `start`; `until` is inclusive and ignores `count`;
//! `unlimited` is produced lazily. `ex_date` removes occurrences by local date
//! after the bound has been applied.

use std::collections::VecDeque;

use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, Offset,
    TimeZone, Utc, Weekday,
};
use chrono_tz::Tz;

use crate::db::models::{EndRepeatMode, RecurringRule};
use crate::error::{AppError, AppResult};

/// Consecutive steps without a candidate after which a walk is considered exhausted.
pub const MAX_EMPTY_STEPS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl Frequency {
    pub fn parse(token: &str) -> AppResult<Self> {
        match token.trim().to_uppercase().as_str() {
            "DAILY" => Ok(Frequency::Daily),
            "WEEKLY" => Ok(Frequency::Weekly),
            "MONTHLY" => Ok(Frequency::Monthly),
            "YEARLY" => Ok(Frequency::Yearly),
            other => Err(AppError::Configuration(format!(
                "Unknown recurrence frequency: {}",
                other
            ))),
        }
    }
}

/// A weekday token, optionally with a signed ordinal (`2MO`, `-1FR`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayToken {
    pub ordinal: Option<i32>,
    pub weekday: Weekday,
}

impl DayToken {
    pub fn parse(token: &str) -> AppResult<Self> {
        let token = token.trim().to_uppercase();
        let malformed = || AppError::Configuration(format!("Malformed byday token: {}", token));

        if token.len() < 2 || !token.is_ascii() {
            return Err(malformed());
        }
        let (prefix, day) = token.split_at(token.len() - 2);
        let weekday = match day {
            "MO" => Weekday::Mon,
            "TU" => Weekday::Tue,
            "WE" => Weekday::Wed,
            "TH" => Weekday::Thu,
            "FR" => Weekday::Fri,
            "SA" => Weekday::Sat,
            "SU" => Weekday::Sun,
            _ => return Err(malformed()),
        };
        let ordinal = if prefix.is_empty() {
            None
        } else {
            let n: i32 = prefix.parse().map_err(|_| malformed())?;
            if n == 0 || n.abs() > 5 {
                return Err(malformed());
            }
            Some(n)
        };

        Ok(DayToken { ordinal, weekday })
    }

    /// Parse a list of tokens; each entry may itself hold several
    /// whitespace separated tokens.
    pub fn parse_all(tokens: &[String]) -> AppResult<Vec<Self>> {
        tokens
            .iter()
            .flat_map(|entry| entry.split_whitespace())
            .map(DayToken::parse)
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
enum Bound {
    Count(usize),
    Until(DateTime<Utc>),
    Unlimited,
}

/// Lazy, ascending sequence of occurrence instants.
#[derive(Debug, Clone)]
pub struct Occurrences {
    tz: Tz,
    start: DateTime<Utc>,
    start_local: NaiveDateTime,
    frequency: Frequency,
    interval: i64,
    byday: Vec<DayToken>,
    bound: Bound,
    ex_date: Vec<NaiveDate>,
    step: i64,
    emitted: usize,
    empty_steps: usize,
    pending: VecDeque<DateTime<Utc>>,
    started: bool,
    done: bool,
}

/// Build the occurrence sequence of `rule` starting at `start` in `tz`.
pub fn expand(start: DateTime<Utc>, rule: &RecurringRule, tz: Tz) -> AppResult<Occurrences> {
    if rule.interval < 1 {
        return Err(AppError::Validation(format!(
            "Recurrence interval must be at least 1, got {}",
            rule.interval
        )));
    }

    let frequency = Frequency::parse(&rule.frequency)?;
    let byday = DayToken::parse_all(&rule.byday)?;

    if frequency == Frequency::Yearly && !byday.is_empty() {
        return Err(AppError::Configuration(
            "byday is not supported for YEARLY rules".to_string(),
        ));
    }
    if frequency != Frequency::Monthly && byday.iter().any(|d| d.ordinal.is_some()) {
        return Err(AppError::Configuration(
            "Ordinal byday tokens are only valid for MONTHLY rules".to_string(),
        ));
    }

    let bound = match rule.end_repeat_mode {
        EndRepeatMode::Count => match rule.count {
            Some(count) if count < 0 => {
                return Err(AppError::Validation(format!(
                    "Recurrence count must not be negative, got {}",
                    count
                )))
            }
            Some(count) => Bound::Count(count as usize),
            None => {
                return Err(AppError::Validation(
                    "Recurrence count is required when endRepeatMode is count".to_string(),
                ))
            }
        },
        EndRepeatMode::Until => match rule.until {
            Some(until) if until < start => {
                return Err(AppError::Validation(format!(
                    "Recurrence until ({}) is before the start ({})",
                    until, start
                )))
            }
            Some(until) => Bound::Until(until),
            None => {
                return Err(AppError::Validation(
                    "Recurrence until is required when endRepeatMode is until".to_string(),
                ))
            }
        },
        EndRepeatMode::Unlimited => Bound::Unlimited,
    };

    Ok(Occurrences {
        tz,
        start,
        start_local: start.with_timezone(&tz).naive_local(),
        frequency,
        interval: rule.interval,
        byday,
        bound,
        ex_date: rule.ex_date.clone(),
        step: 0,
        emitted: 0,
        empty_steps: 0,
        pending: VecDeque::new(),
        started: false,
        done: false,
    })
}

impl Occurrences {
    /// Next instant with the bound applied but before `ex_date` filtering.
    fn next_bounded(&mut self) -> Option<DateTime<Utc>> {
        if self.done {
            return None;
        }
        if !self.started {
            self.started = true;
            return self.admit(self.start);
        }

        loop {
            if let Some(instant) = self.pending.pop_front() {
                return self.admit(instant);
            }
            if self.empty_steps >= MAX_EMPTY_STEPS {
                self.done = true;
                return None;
            }

            let Some(candidates) = self.period(self.step) else {
                self.done = true;
                return None;
            };
            self.step += 1;

            let mut instants: Vec<DateTime<Utc>> = candidates
                .into_iter()
                .filter(|local| *local > self.start_local)
                .filter_map(|local| local_to_utc(&self.tz, local))
                .collect();
            instants.sort();
            instants.dedup();

            if instants.is_empty() {
                self.empty_steps += 1;
            } else {
                self.empty_steps = 0;
                self.pending.extend(instants);
            }
        }
    }

    fn admit(&mut self, instant: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let within = match self.bound {
            Bound::Count(count) => self.emitted < count,
            Bound::Until(until) => instant <= until,
            Bound::Unlimited => true,
        };
        if !within {
            self.done = true;
            return None;
        }
        self.emitted += 1;
        Some(instant)
    }

    /// Local candidates of the `k`th period. `None` once the calendar runs out.
    fn period(&self, k: i64) -> Option<Vec<NaiveDateTime>> {
        let time = self.start_local.time();
        let start_date = self.start_local.date();
        let steps = k.checked_mul(self.interval)?;

        let dates = match self.frequency {
            Frequency::Daily => {
                let date = start_date.checked_add_signed(Duration::try_days(steps)?)?;
                if self.byday.is_empty() || self.byday.iter().any(|d| d.weekday == date.weekday())
                {
                    vec![date]
                } else {
                    Vec::new()
                }
            }
            Frequency::Weekly => {
                let week = Duration::try_weeks(steps)?;
                if self.byday.is_empty() {
                    vec![start_date.checked_add_signed(week)?]
                } else {
                    let monday = start_date
                        .checked_sub_signed(Duration::days(
                            start_date.weekday().num_days_from_monday() as i64,
                        ))?
                        .checked_add_signed(week)?;
                    self.byday
                        .iter()
                        .filter_map(|d| {
                            monday.checked_add_signed(Duration::days(
                                d.weekday.num_days_from_monday() as i64,
                            ))
                        })
                        .collect()
                }
            }
            Frequency::Monthly => {
                let total = (start_date.year() as i64)
                    .checked_mul(12)?
                    .checked_add(start_date.month0() as i64)?
                    .checked_add(steps)?;
                let year = i32::try_from(total.div_euclid(12)).ok()?;
                let month = total.rem_euclid(12) as u32 + 1;
                // check the calendar range once
                NaiveDate::from_ymd_opt(year, month, 1)?;
                self.monthly_dates(year, month, start_date.day())
            }
            Frequency::Yearly => {
                let year = i32::try_from((start_date.year() as i64).checked_add(steps)?).ok()?;
                NaiveDate::from_ymd_opt(year, 1, 1)?;
                NaiveDate::from_ymd_opt(year, start_date.month(), start_date.day())
                    .into_iter()
                    .collect()
            }
        };

        Some(dates.into_iter().map(|date| date.and_time(time)).collect())
    }

    fn monthly_dates(&self, year: i32, month: u32, day: u32) -> Vec<NaiveDate> {
        if self.byday.is_empty() {
            return NaiveDate::from_ymd_opt(year, month, day).into_iter().collect();
        }

        let mut dates = Vec::new();
        for token in &self.byday {
            let matching = weekdays_in_month(year, month, token.weekday);
            match token.ordinal {
                None => dates.extend(matching),
                Some(n) if n > 0 => dates.extend(matching.get(n as usize - 1).copied()),
                Some(n) => {
                    let from_end = n.unsigned_abs() as usize;
                    if from_end <= matching.len() {
                        dates.push(matching[matching.len() - from_end]);
                    }
                }
            }
        }
        dates.sort();
        dates.dedup();
        dates
    }
}

impl Iterator for Occurrences {
    type Item = DateTime<Utc>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let instant = self.next_bounded()?;
            let local_date = instant.with_timezone(&self.tz).date_naive();
            if !self.ex_date.contains(&local_date) {
                return Some(instant);
            }
        }
    }
}

fn weekdays_in_month(year: i32, month: u32, weekday: Weekday) -> Vec<NaiveDate> {
    let Some(first) = NaiveDate::from_ymd_opt(year, month, 1) else {
        return Vec::new();
    };
    let offset = (7 + weekday.num_days_from_monday() - first.weekday().num_days_from_monday()) % 7;

    let mut dates = Vec::new();
    let mut day = first + Duration::days(offset as i64);
    while day.month() == month {
        dates.push(day);
        day += Duration::days(7);
    }
    dates
}

/// Map a local wall-clock time to UTC.
///
/// Ambiguous times take the earlier instant; times inside a gap keep the
/// offset in force before the gap, which moves them forward by its length.
pub fn local_to_utc(tz: &Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
        LocalResult::None => {
            let before = tz
                .offset_from_local_datetime(&(local - Duration::hours(6)))
                .earliest()?;
            let shift = Duration::seconds(i64::from(before.fix().local_minus_utc()));
            Some(Utc.from_utc_datetime(&(local - shift)))
        }
    }
}

/// UTC instant of `date` at `time` in `tz`.
pub fn at_local(tz: &Tz, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
    local_to_utc(tz, date.and_time(time))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn rule(frequency: &str, mode: EndRepeatMode) -> RecurringRule {
        RecurringRule {
            frequency: frequency.to_string(),
            interval: 1,
            byday: Vec::new(),
            until: None,
            count: None,
            end_repeat_mode: mode,
            ex_date: Vec::new(),
        }
    }

    fn counted(frequency: &str, count: i64) -> RecurringRule {
        RecurringRule {
            count: Some(count),
            ..rule(frequency, EndRepeatMode::Count)
        }
    }

    #[test]
    fn weekly_without_byday_starts_with_start() {
        let start = utc("2024-01-03T10:00:00Z");
        let got: Vec<_> = expand(start, &counted("WEEKLY", 3), Tz::UTC).unwrap().collect();

        assert_eq!(
            got,
            vec![
                start,
                utc("2024-01-10T10:00:00Z"),
                utc("2024-01-17T10:00:00Z")
            ]
        );
    }

    #[test]
    fn count_yields_exactly_that_many() {
        let start = utc("2024-05-01T08:30:00Z");
        for k in [0, 1, 7, 40] {
            let got = expand(start, &counted("DAILY", k), Tz::UTC).unwrap().count();
            assert_eq!(got, k as usize);
        }
    }

    #[test]
    fn until_mode_never_passes_until_even_with_count() {
        let start = utc("2024-01-01T09:00:00Z");
        let until = utc("2024-01-05T09:00:00Z");
        let rule = RecurringRule {
            until: Some(until),
            count: Some(100),
            ..rule("DAILY", EndRepeatMode::Until)
        };

        let got: Vec<_> = expand(start, &rule, Tz::UTC).unwrap().collect();
        assert_eq!(got.len(), 5);
        assert!(got.iter().all(|dt| *dt <= until));
        assert_eq!(got.last(), Some(&until));
    }

    #[test]
    fn weekly_byday_passes_start_through_and_sorts_days() {
        // Wednesday start, Monday/Friday rule
        let start = utc("2024-01-03T10:00:00Z");
        let rule = RecurringRule {
            byday: vec!["FR MO".to_string()],
            ..counted("WEEKLY", 5)
        };

        let got: Vec<_> = expand(start, &rule, Tz::UTC).unwrap().collect();
        assert_eq!(
            got,
            vec![
                start,
                utc("2024-01-05T10:00:00Z"),
                utc("2024-01-08T10:00:00Z"),
                utc("2024-01-12T10:00:00Z"),
                utc("2024-01-15T10:00:00Z"),
            ]
        );
    }

    #[test]
    fn daily_byday_skips_unlisted_days() {
        // Friday start
        let start = utc("2024-03-01T07:00:00Z");
        let rule = RecurringRule {
            byday: vec!["MO".into(), "TU".into(), "WE".into(), "TH".into(), "FR".into()],
            ..counted("DAILY", 3)
        };

        let got: Vec<_> = expand(start, &rule, Tz::UTC).unwrap().collect();
        assert_eq!(
            got,
            vec![
                start,
                utc("2024-03-04T07:00:00Z"),
                utc("2024-03-05T07:00:00Z")
            ]
        );
    }

    #[test]
    fn monthly_skips_months_without_the_day() {
        let start = utc("2024-01-31T12:00:00Z");
        let got: Vec<_> = expand(start, &counted("MONTHLY", 4), Tz::UTC)
            .unwrap()
            .collect();

        assert_eq!(
            got,
            vec![
                start,
                utc("2024-03-31T12:00:00Z"),
                utc("2024-05-31T12:00:00Z"),
                utc("2024-07-31T12:00:00Z"),
            ]
        );
    }

    #[test]
    fn monthly_ordinal_weekdays() {
        let start = utc("2024-01-08T09:00:00Z");
        let rule = RecurringRule {
            byday: vec!["2MO".into(), "-1FR".into()],
            ..counted("MONTHLY", 5)
        };

        let got: Vec<_> = expand(start, &rule, Tz::UTC).unwrap().collect();
        assert_eq!(
            got,
            vec![
                start,
                utc("2024-01-26T09:00:00Z"),
                utc("2024-02-12T09:00:00Z"),
                utc("2024-02-23T09:00:00Z"),
                utc("2024-03-11T09:00:00Z"),
            ]
        );
    }

    #[test]
    fn yearly_leap_day_only_in_leap_years() {
        let start = utc("2024-02-29T00:00:00Z");
        let got: Vec<_> = expand(start, &counted("YEARLY", 3), Tz::UTC)
            .unwrap()
            .collect();

        assert_eq!(
            got,
            vec![
                start,
                utc("2028-02-29T00:00:00Z"),
                utc("2032-02-29T00:00:00Z")
            ]
        );
    }

    #[test]
    fn local_time_survives_dst_transition() {
        let tz: Tz = "Europe/London".parse().unwrap();
        // 09:00 GMT on the 30th, clocks go forward on the 31st
        let start = utc("2024-03-30T09:00:00Z");
        let got: Vec<_> = expand(start, &counted("DAILY", 3), tz).unwrap().collect();

        assert_eq!(
            got,
            vec![
                start,
                utc("2024-03-31T08:00:00Z"),
                utc("2024-04-01T08:00:00Z")
            ]
        );
    }

    #[test]
    fn gap_time_moves_forward() {
        let tz: Tz = "Europe/Berlin".parse().unwrap();
        let local = NaiveDate::from_ymd_opt(2024, 3, 31)
            .unwrap()
            .and_hms_opt(2, 30, 0)
            .unwrap();

        // 02:30 does not exist; 03:30 CEST is 01:30 UTC
        assert_eq!(local_to_utc(&tz, local), Some(utc("2024-03-31T01:30:00Z")));
    }

    #[test]
    fn unlimited_is_lazy() {
        let start = utc("2024-01-01T00:00:00Z");
        let mut occurrences = expand(start, &rule("DAILY", EndRepeatMode::Unlimited), Tz::UTC)
            .unwrap()
            .skip(9_999);

        assert_eq!(occurrences.next(), Some(start + Duration::days(9_999)));
    }

    #[test]
    fn ex_date_removes_by_local_date_after_count() {
        let start = utc("2024-06-01T10:00:00Z");
        let rule = RecurringRule {
            ex_date: vec![NaiveDate::from_ymd_opt(2024, 6, 2).unwrap()],
            ..counted("DAILY", 3)
        };

        let got: Vec<_> = expand(start, &rule, Tz::UTC).unwrap().collect();
        assert_eq!(got, vec![start, utc("2024-06-03T10:00:00Z")]);
    }

    #[test]
    fn walk_without_matches_terminates() {
        // Monday start, every 7th day is always a Monday
        let start = utc("2024-01-01T10:00:00Z");
        let rule = RecurringRule {
            interval: 7,
            byday: vec!["TU".into()],
            ..rule("DAILY", EndRepeatMode::Unlimited)
        };

        let got: Vec<_> = expand(start, &rule, Tz::UTC).unwrap().collect();
        assert_eq!(got, vec![start]);
    }

    #[test]
    fn invalid_rules_are_rejected() {
        let start = utc("2024-01-01T10:00:00Z");

        let bad_frequency = counted("HOURLY", 2);
        assert!(matches!(
            expand(start, &bad_frequency, Tz::UTC),
            Err(AppError::Configuration(_))
        ));

        let bad_token = RecurringRule {
            byday: vec!["XX".into()],
            ..counted("WEEKLY", 2)
        };
        assert!(matches!(
            expand(start, &bad_token, Tz::UTC),
            Err(AppError::Configuration(_))
        ));

        let yearly_byday = RecurringRule {
            byday: vec!["MO".into()],
            ..counted("YEARLY", 2)
        };
        assert!(matches!(
            expand(start, &yearly_byday, Tz::UTC),
            Err(AppError::Configuration(_))
        ));

        let zero_interval = RecurringRule {
            interval: 0,
            ..counted("DAILY", 2)
        };
        assert!(matches!(
            expand(start, &zero_interval, Tz::UTC),
            Err(AppError::Validation(_))
        ));

        assert!(matches!(
            expand(start, &counted("DAILY", -1), Tz::UTC),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            expand(start, &rule("DAILY", EndRepeatMode::Count), Tz::UTC),
            Err(AppError::Validation(_))
        ));

        let until_before_start = RecurringRule {
            until: Some(start - Duration::days(1)),
            ..rule("DAILY", EndRepeatMode::Until)
        };
        assert!(matches!(
            expand(start, &until_before_start, Tz::UTC),
            Err(AppError::Validation(_))
        ));
    }
}
