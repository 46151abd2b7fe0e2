use anyhow::{anyhow, Context};
use chrono::{DateTime, TimeZone, Utc};
use common::{Job, JobId, NewJob, Run, RunId, RunStatus};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::migrations::Migrator;

/// Data access needed by the backup core.
///
/// Implementations are used from one thread at a time; concurrent executions
/// each obtain their own instance.
pub trait Storage {
    fn get_job(&self, id: JobId) -> anyhow::Result<Option<Job>>;
    fn active_jobs(&self) -> anyhow::Result<Vec<Job>>;
    fn insert_run(&self, run: &Run) -> anyhow::Result<()>;
    fn update_run(&self, run: &Run) -> anyhow::Result<()>;
    /// Runs of a job, newest first.
    fn runs_for_job(&self, job_id: JobId, limit: usize) -> anyhow::Result<Vec<Run>>;
    /// Successful runs of a job, newest first, ties broken by run id.
    fn successful_runs(&self, job_id: JobId) -> anyhow::Result<Vec<Run>>;
    fn delete_run(&self, id: &RunId) -> anyhow::Result<()>;
}

/// Cloneable handle to the SQLite database file. Every `connect` opens a
/// fresh connection.
#[derive(Debug, Clone)]
pub struct Database {
    path: PathBuf,
}

impl Database {
    /// Creates the parent directory and brings the schema up to date.
    pub fn init(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory {:?}", parent))?;
        }
        let db = Self { path };
        db.connect()?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn connect(&self) -> anyhow::Result<Db> {
        Db::open(&self.path).with_context(|| format!("Failed to open database at {:?}", self.path))
    }
}

pub struct Db {
    conn: Connection,
}

const JOB_COLUMNS: &str =
    "id, name, source_path, destination_path, schedule_type, interval_minutes, active, created_at";
const RUN_COLUMNS: &str = "id, job_id, status, started_at, finished_at, message, output_file";

impl Db {
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        Self::prepare(Connection::open(path)?)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> rusqlite::Result<Self> {
        Self::prepare(Connection::open_in_memory()?)
    }

    fn prepare(conn: Connection) -> rusqlite::Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let mut migrator = Migrator::new(conn);
        migrator.run_migrations()?;
        Ok(Self { conn: migrator.into_connection() })
    }

    pub fn create_job(&self, job: &NewJob) -> rusqlite::Result<JobId> {
        self.conn.execute(
            "INSERT INTO jobs (name, source_path, destination_path, schedule_type, interval_minutes, active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                job.name,
                job.source_path.to_string_lossy(),
                job.destination_path.to_string_lossy(),
                job.schedule_type,
                job.interval_minutes,
                job.active,
                Utc::now().timestamp_micros(),
            ],
        )?;
        Ok(JobId(self.conn.last_insert_rowid()))
    }

    /// Returns false when no job with that id exists.
    pub fn update_job(&self, job: &Job) -> rusqlite::Result<bool> {
        let changed = self.conn.execute(
            "UPDATE jobs SET name = ?2, source_path = ?3, destination_path = ?4,
                schedule_type = ?5, interval_minutes = ?6, active = ?7
             WHERE id = ?1",
            params![
                job.id.0,
                job.name,
                job.source_path.to_string_lossy(),
                job.destination_path.to_string_lossy(),
                job.schedule_type,
                job.interval_minutes,
                job.active,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn set_job_active(&self, id: JobId, active: bool) -> rusqlite::Result<bool> {
        let changed = self.conn.execute(
            "UPDATE jobs SET active = ?2 WHERE id = ?1",
            params![id.0, active],
        )?;
        Ok(changed > 0)
    }

    /// Deletes the job together with its runs.
    pub fn remove_job(&self, id: JobId) -> rusqlite::Result<bool> {
        let changed = self.conn.execute("DELETE FROM jobs WHERE id = ?1", params![id.0])?;
        Ok(changed > 0)
    }

    pub fn list_jobs(&self) -> rusqlite::Result<Vec<Job>> {
        let mut stmt = self.conn.prepare(&format!("SELECT {} FROM jobs ORDER BY id", JOB_COLUMNS))?;
        let jobs = stmt.query_map([], job_from_row)?.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    fn query_runs(&self, sql: &str, job_id: JobId, limit: i64) -> anyhow::Result<Vec<Run>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params![job_id.0, limit], raw_run_from_row)?;

        let mut runs = Vec::new();
        for row in rows {
            runs.push(row?.into_run()?);
        }
        Ok(runs)
    }
}

impl Storage for Db {
    fn get_job(&self, id: JobId) -> anyhow::Result<Option<Job>> {
        let job = self
            .conn
            .query_row(
                &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
                params![id.0],
                job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    fn active_jobs(&self) -> anyhow::Result<Vec<Job>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {} FROM jobs WHERE active = 1 ORDER BY id", JOB_COLUMNS))?;
        let jobs = stmt.query_map([], job_from_row)?.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    fn insert_run(&self, run: &Run) -> anyhow::Result<()> {
        self.conn.execute(
            &format!("INSERT INTO runs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)", RUN_COLUMNS),
            params![
                run.id.0,
                run.job_id.0,
                run.status.as_str(),
                run.started_at.timestamp_micros(),
                run.finished_at.map(|t| t.timestamp_micros()),
                run.message,
                run.output_file.as_ref().map(|p| p.to_string_lossy().into_owned()),
            ],
        )?;
        Ok(())
    }

    fn update_run(&self, run: &Run) -> anyhow::Result<()> {
        let changed = self.conn.execute(
            "UPDATE runs SET status = ?2, finished_at = ?3, message = ?4, output_file = ?5 WHERE id = ?1",
            params![
                run.id.0,
                run.status.as_str(),
                run.finished_at.map(|t| t.timestamp_micros()),
                run.message,
                run.output_file.as_ref().map(|p| p.to_string_lossy().into_owned()),
            ],
        )?;
        if changed == 0 {
            return Err(anyhow!("Run {} not found", run.id));
        }
        Ok(())
    }

    fn runs_for_job(&self, job_id: JobId, limit: usize) -> anyhow::Result<Vec<Run>> {
        self.query_runs(
            &format!(
                "SELECT {} FROM runs WHERE job_id = ?1 ORDER BY started_at DESC, id DESC LIMIT ?2",
                RUN_COLUMNS
            ),
            job_id,
            i64::try_from(limit).unwrap_or(i64::MAX),
        )
    }

    fn successful_runs(&self, job_id: JobId) -> anyhow::Result<Vec<Run>> {
        // A negative LIMIT means no limit in SQLite.
        self.query_runs(
            &format!(
                "SELECT {} FROM runs WHERE job_id = ?1 AND status = 'success'
                 ORDER BY started_at DESC, id DESC LIMIT ?2",
                RUN_COLUMNS
            ),
            job_id,
            -1,
        )
    }

    fn delete_run(&self, id: &RunId) -> anyhow::Result<()> {
        self.conn.execute("DELETE FROM runs WHERE id = ?1", params![id.0])?;
        Ok(())
    }
}

fn timestamp(micros: i64) -> anyhow::Result<DateTime<Utc>> {
    Utc.timestamp_micros(micros)
        .single()
        .ok_or_else(|| anyhow!("Invalid stored timestamp: {}", micros))
}

fn job_from_row(row: &Row) -> rusqlite::Result<Job> {
    let created_at: i64 = row.get(7)?;
    Ok(Job {
        id: JobId(row.get(0)?),
        name: row.get(1)?,
        source_path: PathBuf::from(row.get::<_, String>(2)?),
        destination_path: PathBuf::from(row.get::<_, String>(3)?),
        schedule_type: row.get(4)?,
        interval_minutes: row.get(5)?,
        active: row.get(6)?,
        created_at: Utc.timestamp_micros(created_at).single().unwrap_or_default(),
    })
}

struct RawRun {
    id: String,
    job_id: i64,
    status: String,
    started_at: i64,
    finished_at: Option<i64>,
    message: Option<String>,
    output_file: Option<String>,
}

fn raw_run_from_row(row: &Row) -> rusqlite::Result<RawRun> {
    Ok(RawRun {
        id: row.get(0)?,
        job_id: row.get(1)?,
        status: row.get(2)?,
        started_at: row.get(3)?,
        finished_at: row.get(4)?,
        message: row.get(5)?,
        output_file: row.get(6)?,
    })
}

impl RawRun {
    fn into_run(self) -> anyhow::Result<Run> {
        let status: RunStatus = self.status.parse().map_err(|e: String| anyhow!(e))?;
        Ok(Run {
            id: RunId(self.id),
            job_id: JobId(self.job_id),
            status,
            started_at: timestamp(self.started_at)?,
            finished_at: self.finished_at.map(timestamp).transpose()?,
            message: self.message,
            output_file: self.output_file.map(PathBuf::from),
        })
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    pub fn new_job(name: &str, schedule_type: &str, interval: Option<i64>) -> NewJob {
        NewJob {
            name: name.to_string(),
            source_path: PathBuf::from("/srv/data"),
            destination_path: PathBuf::from("/srv/backups"),
            schedule_type: schedule_type.to_string(),
            interval_minutes: interval,
            active: true,
        }
    }

    #[test]
    fn test_job_crud() {
        let db = Db::open_in_memory().unwrap();
        let id = db.create_job(&new_job("docs", "interval", Some(5))).unwrap();

        let mut job = db.get_job(id).unwrap().unwrap();
        assert_eq!(job.name, "docs");
        assert_eq!(job.interval_minutes, Some(5));
        assert!(job.active);

        job.name = "documents".to_string();
        job.schedule_type = "daily".to_string();
        job.interval_minutes = None;
        assert!(db.update_job(&job).unwrap());
        let reloaded = db.get_job(id).unwrap().unwrap();
        assert_eq!(reloaded.name, "documents");
        assert_eq!(reloaded.schedule_type, "daily");

        assert!(db.set_job_active(id, false).unwrap());
        assert!(db.active_jobs().unwrap().is_empty());
        assert_eq!(db.list_jobs().unwrap().len(), 1);

        assert!(db.remove_job(id).unwrap());
        assert!(db.get_job(id).unwrap().is_none());
        assert!(!db.remove_job(id).unwrap());
    }

    #[test]
    fn test_removing_job_cascades_to_runs() {
        let db = Db::open_in_memory().unwrap();
        let id = db.create_job(&new_job("docs", "manual", None)).unwrap();
        let run = Run::start(id, Utc::now());
        db.insert_run(&run).unwrap();
        assert_eq!(db.runs_for_job(id, 10).unwrap().len(), 1);

        db.remove_job(id).unwrap();
        assert!(db.runs_for_job(id, 10).unwrap().is_empty());
    }

    #[test]
    fn test_run_round_trip_and_ordering() {
        let db = Db::open_in_memory().unwrap();
        let id = db.create_job(&new_job("docs", "manual", None)).unwrap();
        let base = Utc::now();

        let mut older = Run::start(id, base - ChronoDuration::minutes(10));
        db.insert_run(&older).unwrap();
        older.succeed(PathBuf::from("/srv/backups/a.zip"), "Backup created", base);
        db.update_run(&older).unwrap();

        let mut newer = Run::start(id, base);
        db.insert_run(&newer).unwrap();
        newer.fail("Source path does not exist", base);
        db.update_run(&newer).unwrap();

        let runs = db.runs_for_job(id, 10).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].id, newer.id);
        assert_eq!(runs[0].status, RunStatus::Error);
        assert_eq!(runs[1].output_file, Some(PathBuf::from("/srv/backups/a.zip")));
        assert_eq!(runs[1].started_at.timestamp_micros(), older.started_at.timestamp_micros());

        let successes = db.successful_runs(id).unwrap();
        assert_eq!(successes.len(), 1);
        assert_eq!(successes[0].id, older.id);

        assert_eq!(db.runs_for_job(id, 1).unwrap().len(), 1);
    }

    #[test]
    fn test_successful_runs_tie_break_is_stable() {
        let db = Db::open_in_memory().unwrap();
        let id = db.create_job(&new_job("docs", "manual", None)).unwrap();
        let now = Utc::now();

        for name in ["a", "b", "c"] {
            let mut run = Run::start(id, now);
            run.id = RunId(name.to_string());
            run.succeed(PathBuf::from(format!("/tmp/{}.zip", name)), "ok", now);
            db.insert_run(&run).unwrap();
        }

        let ids: Vec<String> = db.successful_runs(id).unwrap().into_iter().map(|r| r.id.0).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
    }

    #[test]
    fn test_update_missing_run_fails() {
        let db = Db::open_in_memory().unwrap();
        let run = Run::start(JobId(1), Utc::now());
        assert!(db.update_run(&run).is_err());
    }
}
