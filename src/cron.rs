//! Cron-like trigger fields of scheduled tasks.
//!
//! Each field is `*`, `N`, `a-b`, `*/n`, `a-b/n`, `a/n` or a comma list of
//! those. A missing field is a wildcard, except that fields finer than the
//! finest specified one pin to their minimum value so that `minute = 5`
//! fires once, at second 0 of minute 5. `week` and `day_of_week` never pin.

use std::fmt;

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use thiserror::Error;

use crate::scheduled_tasks::ScheduledTask;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Year,
    Month,
    Day,
    /// ISO week of the year
    Week,
    /// 0 = Monday .. 6 = Sunday
    DayOfWeek,
    Hour,
    Minute,
    Second,
}

impl Field {
    pub const ALL: [Field; 8] = [
        Field::Year,
        Field::Month,
        Field::Day,
        Field::Week,
        Field::DayOfWeek,
        Field::Hour,
        Field::Minute,
        Field::Second,
    ];

    pub fn range(self) -> (u32, u32) {
        match self {
            Field::Year => (1970, 9999),
            Field::Month => (1, 12),
            Field::Day => (1, 31),
            Field::Week => (1, 53),
            Field::DayOfWeek => (0, 6),
            Field::Hour => (0, 23),
            Field::Minute => (0, 59),
            Field::Second => (0, 59),
        }
    }

    /// Coarse to fine. Day, week and weekday share a rank.
    fn rank(self) -> u8 {
        match self {
            Field::Year => 0,
            Field::Month => 1,
            Field::Day | Field::Week | Field::DayOfWeek => 2,
            Field::Hour => 3,
            Field::Minute => 4,
            Field::Second => 5,
        }
    }

    fn pins_to_minimum(self) -> bool {
        !matches!(self, Field::Week | Field::DayOfWeek)
    }

    fn value_of(self, t: &NaiveDateTime) -> u32 {
        match self {
            Field::Year => t.year().max(0) as u32,
            Field::Month => t.month(),
            Field::Day => t.day(),
            Field::Week => t.iso_week().week(),
            Field::DayOfWeek => t.weekday().num_days_from_monday(),
            Field::Hour => t.hour(),
            Field::Minute => t.minute(),
            Field::Second => t.second(),
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Field::Year => "year",
            Field::Month => "month",
            Field::Day => "day",
            Field::Week => "week",
            Field::DayOfWeek => "day_of_week",
            Field::Hour => "hour",
            Field::Minute => "minute",
            Field::Second => "second",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid {field} expression '{text}': {reason}")]
pub struct CronError {
    pub field: Field,
    pub text: String,
    pub reason: String,
}

/// One `start-end/step` term
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Term {
    start: u32,
    end: u32,
    step: u32,
}

impl Term {
    fn matches(&self, value: u32) -> bool {
        value >= self.start && value <= self.end && (value - self.start) % self.step == 0
    }
}

/// A parsed, non-wildcard field expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    terms: Vec<Term>,
}

impl FieldSpec {
    /// Parses `text` for `field`. Returns `None` for a wildcard.
    pub fn parse(field: Field, text: &str) -> Result<Option<FieldSpec>, CronError> {
        let text = text.trim();
        if text.is_empty() || text == "*" {
            return Ok(None);
        }
        let err = |reason: String| CronError {
            field,
            text: text.to_owned(),
            reason,
        };
        let (min, max) = field.range();

        let mut terms = Vec::new();
        for part in text.split(',') {
            let part = part.trim();
            let (base, step) = match part.split_once('/') {
                Some((base, step)) => {
                    let step: u32 = step
                        .trim()
                        .parse()
                        .map_err(|_| err(format!("bad step in '{}'", part)))?;
                    if step == 0 {
                        return Err(err("step must be at least 1".into()));
                    }
                    (base.trim(), Some(step))
                }
                None => (part, None),
            };

            let number = |s: &str| -> Result<u32, CronError> {
                let n: u32 = s
                    .trim()
                    .parse()
                    .map_err(|_| err(format!("'{}' is not a number", s.trim())))?;
                if n < min || n > max {
                    return Err(err(format!("{} is outside {}-{}", n, min, max)));
                }
                Ok(n)
            };

            let (start, end) = if base == "*" {
                (min, max)
            } else if let Some((a, b)) = base.split_once('-') {
                let (a, b) = (number(a)?, number(b)?);
                if a > b {
                    return Err(err(format!("range {}-{} is reversed", a, b)));
                }
                (a, b)
            } else {
                let a = number(base)?;
                // `a/n` runs from a to the end of the range
                if step.is_some() {
                    (a, max)
                } else {
                    (a, a)
                }
            };
            terms.push(Term {
                start,
                end,
                step: step.unwrap_or(1),
            });
        }
        Ok(Some(FieldSpec { terms }))
    }

    pub fn matches(&self, value: u32) -> bool {
        self.terms.iter().any(|t| t.matches(value))
    }

    fn minimum(field: Field) -> FieldSpec {
        let (min, _) = field.range();
        FieldSpec {
            terms: vec![Term {
                start: min,
                end: min,
                step: 1,
            }],
        }
    }
}

/// The trigger of one scheduled task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    /// Indexed like `Field::ALL`; `None` matches anything
    fields: [Option<FieldSpec>; 8],
    /// Rank of the finest specified field, which sizes the firing window
    window_rank: u8,
}

impl CronSchedule {
    pub fn parse(exprs: [Option<&str>; 8]) -> Result<Self, CronError> {
        let mut fields: [Option<FieldSpec>; 8] = Default::default();
        for (i, field) in Field::ALL.iter().enumerate() {
            if let Some(text) = exprs[i] {
                fields[i] = FieldSpec::parse(*field, text)?;
            }
        }

        let finest = Field::ALL
            .iter()
            .zip(fields.iter())
            .filter(|(_, spec)| spec.is_some())
            .map(|(field, _)| field.rank())
            .max();
        let window_rank = match finest {
            Some(rank) => {
                for (i, field) in Field::ALL.iter().enumerate() {
                    if fields[i].is_none() && field.pins_to_minimum() && field.rank() > rank {
                        fields[i] = Some(FieldSpec::minimum(*field));
                    }
                }
                rank
            }
            // all wildcards: every second is its own window
            None => Field::Second.rank(),
        };

        Ok(CronSchedule {
            fields,
            window_rank,
        })
    }

    pub fn for_task(task: &ScheduledTask) -> Result<Self, CronError> {
        Self::parse([
            task.year.as_deref(),
            task.month.as_deref(),
            task.day.as_deref(),
            task.week.as_deref(),
            task.day_of_week.as_deref(),
            task.hour.as_deref(),
            task.minute.as_deref(),
            task.second.as_deref(),
        ])
    }

    pub fn matches(&self, t: &NaiveDateTime) -> bool {
        Field::ALL
            .iter()
            .zip(self.fields.iter())
            .all(|(field, spec)| match spec {
                Some(spec) => spec.matches(field.value_of(t)),
                None => true,
            })
    }

    /// Start of the firing window containing `t`. A task fires at most once
    /// per window.
    pub fn window_key(&self, t: &NaiveDateTime) -> NaiveDateTime {
        let date = match self.window_rank {
            0 => NaiveDate::from_ymd_opt(t.year(), 1, 1),
            1 => NaiveDate::from_ymd_opt(t.year(), t.month(), 1),
            _ => Some(t.date()),
        }
        .unwrap_or_else(|| t.date());
        let time = match self.window_rank {
            0..=2 => NaiveTime::MIN,
            3 => NaiveTime::from_hms_opt(t.hour(), 0, 0).unwrap_or(NaiveTime::MIN),
            4 => NaiveTime::from_hms_opt(t.hour(), t.minute(), 0).unwrap_or(NaiveTime::MIN),
            _ => NaiveTime::from_hms_opt(t.hour(), t.minute(), t.second())
                .unwrap_or(NaiveTime::MIN),
        };
        date.and_time(time)
    }
}
