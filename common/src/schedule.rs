use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Validated schedule of a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SchedulePolicy {
    Manual,
    Interval { minutes: u32 },
    Daily,
}

impl std::fmt::Display for SchedulePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulePolicy::Manual => write!(f, "manual"),
            SchedulePolicy::Interval { minutes } => write!(f, "every {}m", minutes),
            SchedulePolicy::Daily => write!(f, "daily"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("interval schedule requires a positive interval, got {0:?}")]
    InvalidInterval(Option<i64>),
    #[error("unknown schedule type: {0}")]
    UnknownType(String),
}

/// Turns a stored `(schedule_type, interval_minutes)` pair into a policy.
///
/// The type is matched case-insensitively and an empty type means `manual`.
/// The interval is only consulted for `interval` schedules.
pub fn parse_schedule(schedule_type: &str, interval_minutes: Option<i64>) -> Result<SchedulePolicy, ScheduleError> {
    let kind = schedule_type.trim().to_lowercase();
    match kind.as_str() {
        "" | "manual" => Ok(SchedulePolicy::Manual),
        "daily" => Ok(SchedulePolicy::Daily),
        "interval" => match interval_minutes {
            Some(m) if m > 0 && m <= u32::MAX as i64 => Ok(SchedulePolicy::Interval { minutes: m as u32 }),
            other => Err(ScheduleError::InvalidInterval(other)),
        },
        _ => Err(ScheduleError::UnknownType(schedule_type.to_string())),
    }
}
