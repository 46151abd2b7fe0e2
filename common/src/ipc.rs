use serde::{Deserialize, Serialize};
use crate::job::{Job, JobId, NewJob, Run};
use crate::schedule::SchedulePolicy;

/// Requests are sent as one JSON document per line.
#[derive(Debug, Serialize, Deserialize)]
pub enum Request {
    AddJob(NewJob),
    UpdateJob(Job),
    SetJobActive(JobId, bool),
    RemoveJob(JobId),
    ListJobs,
    GetJob(JobId),
    RunJob(JobId),
    GetRuns(JobId, usize),
    ListScheduled,
    Reload,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum Response {
    Ok,
    Error(String),
    JobCreated(JobId),
    JobList(Vec<Job>),
    JobDetail(Option<Job>),
    RunResult(Run),
    RunList(Vec<Run>),
    Scheduled(Vec<ScheduledEntry>),
}

/// A live trigger as reported by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduledEntry {
    pub job_id: JobId,
    pub policy: SchedulePolicy,
}
