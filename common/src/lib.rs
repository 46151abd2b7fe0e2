pub mod ipc;
pub mod job;
pub mod schedule;

pub use ipc::{Request, Response, ScheduledEntry};
pub use job::{Job, JobId, NewJob, Run, RunId, RunStatus};
pub use schedule::{parse_schedule, ScheduleError, SchedulePolicy};

// Production paths (follow FHS - Filesystem Hierarchy Standard)
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/snapkeep/snapkeep.sock";
pub const DEFAULT_DB_PATH: &str = "/var/lib/snapkeep/snapkeep.db";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/snapkeep/config.yaml";

/// File extension of produced archives.
pub const ARCHIVE_EXTENSION: &str = "zip";
