// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Five field cron expressions.
//!
//! Only validation is needed, the OS scheduler does the actual scheduling.
//! The point is to refuse an expression that would install a job that never
//! fires the way the operator intended, e.g., `61 * * * *`.

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    str::FromStr,
};

static MONTHS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

static WEEKDAYS: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// Field of a cron expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronField {
    Minute,
    Hour,
    DayOfMonth,
    Month,
    DayOfWeek,
}

impl CronField {
    const ALL: [CronField; 5] = [
        CronField::Minute,
        CronField::Hour,
        CronField::DayOfMonth,
        CronField::Month,
        CronField::DayOfWeek,
    ];

    /// Inclusive range of valid values.
    pub fn range(&self) -> (u32, u32) {
        match self {
            Self::Minute => (0, 59),
            Self::Hour => (0, 23),
            Self::DayOfMonth => (1, 31),
            Self::Month => (1, 12),
            Self::DayOfWeek => (0, 7),
        }
    }

    fn names(&self) -> Option<(&'static [&'static str], u32)> {
        match self {
            Self::Month => Some((MONTHS.as_slice(), 1)),
            Self::DayOfWeek => Some((WEEKDAYS.as_slice(), 0)),
            _ => None,
        }
    }

    fn value(&self, data: &str) -> Result<u32, String> {
        if let Some((names, base)) = self.names() {
            let lowered = data.to_ascii_lowercase();
            if let Some(index) = names.iter().position(|name| *name == lowered) {
                return Ok(index as u32 + base);
            }
        }

        let value = data
            .parse::<u32>()
            .map_err(|_| format!("{data:?} is not a number"))?;
        let (low, high) = self.range();
        if value < low || value > high {
            return Err(format!("{value} is outside {low}-{high}"));
        }

        Ok(value)
    }

    fn validate(&self, data: &str) -> Result<(), String> {
        for item in data.split(',') {
            let (span, step) = match item.split_once('/') {
                Some((span, step)) => (span, Some(step)),
                None => (item, None),
            };

            if let Some(step) = step {
                match step.parse::<u32>() {
                    Ok(step) if step > 0 => {}
                    _ => return Err(format!("invalid step {step:?}")),
                }
            }

            if span == "*" {
                continue;
            }

            match span.split_once('-') {
                Some((low, high)) => {
                    let low = self.value(low)?;
                    let high = self.value(high)?;
                    if low > high {
                        return Err(format!("range {span:?} runs backwards"));
                    }
                }
                None => {
                    if step.is_some() {
                        return Err(format!("step on single value {span:?}"));
                    }
                    self.value(span)?;
                }
            }
        }

        Ok(())
    }
}

impl Display for CronField {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let name = match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::DayOfMonth => "day of month",
            Self::Month => "month",
            Self::DayOfWeek => "day of week",
        };
        fmt.write_str(name)
    }
}

/// Validated five field cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    fields: [String; 5],
}

impl CronSchedule {
    /// Raw expression, fields separated by single spaces.
    pub fn as_str(&self) -> String {
        self.fields.join(" ")
    }
}

impl FromStr for CronSchedule {
    type Err = CronError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let parts = data.split_whitespace().collect::<Vec<_>>();
        let fields: [&str; 5] = parts
            .as_slice()
            .try_into()
            .map_err(|_| CronError::FieldCount(parts.len()))?;

        for (field, value) in CronField::ALL.into_iter().zip(fields) {
            field
                .validate(value)
                .map_err(|reason| CronError::InvalidField {
                    field,
                    value: value.into(),
                    reason,
                })?;
        }

        Ok(Self {
            fields: fields.map(String::from),
        })
    }
}

impl Display for CronSchedule {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(&self.as_str())
    }
}

/// Cron expression error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CronError {
    /// Expression does not have five fields.
    #[error("cron expression needs 5 fields, got {0}")]
    FieldCount(usize),

    /// Field has an invalid value.
    #[error("invalid {field} field {value:?}: {reason}")]
    InvalidField {
        field: CronField,
        value: String,
        reason: String,
    },
}
