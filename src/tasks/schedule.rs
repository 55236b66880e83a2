use std::{fmt, str::FromStr, time::Duration};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("expected 5 cron fields, got {0}")]
    FieldCount(usize),
    #[error("unsupported minute field {0:?}; use * or */N")]
    Minute(String),
    #[error("only * is supported for hour, day, month and weekday, got {0:?}")]
    Coarse(String),
}

/// Recurring schedule written as a cron expression.
///
/// Only minute-granularity repetition is supported: `* * * * *` (every
/// minute) and `*/N * * * *` (every N minutes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    every_minutes: u32,
}

impl Schedule {
    pub fn every_minute() -> Self {
        Schedule { every_minutes: 1 }
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs(60 * u64::from(self.every_minutes))
    }
}

impl FromStr for Schedule {
    type Err = ScheduleError;

    fn from_str(expr: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(ScheduleError::FieldCount(fields.len()));
        }
        if let Some(f) = fields[1..].iter().find(|f| **f != "*") {
            return Err(ScheduleError::Coarse(f.to_string()));
        }
        let every_minutes = match fields[0] {
            "*" => 1,
            m => m
                .strip_prefix("*/")
                .and_then(|n| n.parse::<u32>().ok())
                .filter(|n| (1..=59).contains(n))
                .ok_or_else(|| ScheduleError::Minute(m.to_string()))?,
        };
        Ok(Schedule { every_minutes })
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.every_minutes {
            1 => f.write_str("* * * * *"),
            n => write!(f, "*/{n} * * * *"),
        }
    }
}
