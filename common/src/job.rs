use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::schedule::{parse_schedule, ScheduleError, SchedulePolicy};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub i64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A configured backup task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub source_path: PathBuf,
    pub destination_path: PathBuf,
    /// Raw schedule type as stored: `manual`, `interval` or `daily`.
    pub schedule_type: String,
    pub interval_minutes: Option<i64>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn schedule(&self) -> Result<SchedulePolicy, ScheduleError> {
        parse_schedule(&self.schedule_type, self.interval_minutes)
    }
}

/// Job fields supplied by the user before storage assigns an id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewJob {
    pub name: String,
    pub source_path: PathBuf,
    pub destination_path: PathBuf,
    pub schedule_type: String,
    pub interval_minutes: Option<i64>,
    pub active: bool,
}

impl NewJob {
    pub fn schedule(&self) -> Result<SchedulePolicy, ScheduleError> {
        parse_schedule(&self.schedule_type, self.interval_minutes)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunId(pub String);

impl RunId {
    pub fn generate() -> Self {
        RunId(Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "error" => Ok(RunStatus::Error),
            other => Err(format!("unknown run status: {}", other)),
        }
    }
}

/// One execution attempt of a job.
///
/// A run starts as `Running` and receives exactly one terminal update through
/// [`Run::succeed`] or [`Run::fail`]. `output_file` is only ever set together
/// with `Success`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Run {
    pub id: RunId,
    pub job_id: JobId,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
    pub output_file: Option<PathBuf>,
}

impl Run {
    pub fn start(job_id: JobId, now: DateTime<Utc>) -> Self {
        Self {
            id: RunId::generate(),
            job_id,
            status: RunStatus::Running,
            started_at: now,
            finished_at: None,
            message: None,
            output_file: None,
        }
    }

    pub fn succeed(&mut self, output_file: PathBuf, message: impl Into<String>, now: DateTime<Utc>) {
        self.status = RunStatus::Success;
        self.output_file = Some(output_file);
        self.message = Some(message.into());
        self.finished_at = Some(now);
    }

    pub fn fail(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        self.status = RunStatus::Error;
        self.output_file = None;
        self.message = Some(message.into());
        self.finished_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_transitions_keep_output_file_consistent() {
        let now = Utc::now();
        let mut run = Run::start(JobId(3), now);
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.output_file.is_none());

        run.succeed(PathBuf::from("/tmp/a.zip"), "ok", now);
        assert_eq!(run.status, RunStatus::Success);
        assert!(run.output_file.is_some());

        let mut failed = Run::start(JobId(3), now);
        failed.output_file = Some(PathBuf::from("/tmp/stale.zip"));
        failed.fail("boom", now);
        assert_eq!(failed.status, RunStatus::Error);
        assert!(failed.output_file.is_none());
        assert_eq!(failed.message.as_deref(), Some("boom"));
        assert!(failed.finished_at.is_some());
    }

    #[test]
    fn test_run_status_round_trips_through_text() {
        for status in [RunStatus::Running, RunStatus::Success, RunStatus::Error] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("pending".parse::<RunStatus>().is_err());
    }
}
