use common::{JobId, RunId};
use std::io;
use std::path::PathBuf;

use crate::db::Storage;

/// What a retention pass did.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RetentionReport {
    pub kept: usize,
    pub removed: Vec<RunId>,
    /// Artifacts that could not be deleted. Their run records are removed anyway.
    pub failed_files: Vec<PathBuf>,
}

/// Keeps the newest `keep` successful runs of a job and deletes the rest,
/// archive file first, then the run record.
///
/// `keep == 0` disables retention. Failures are per item and logged; a
/// storage error while listing runs aborts the pass.
pub fn enforce<S: Storage + ?Sized>(store: &S, job_id: JobId, keep: usize) -> anyhow::Result<RetentionReport> {
    if keep == 0 {
        return Ok(RetentionReport::default());
    }

    let runs = store.successful_runs(job_id)?;
    if runs.len() <= keep {
        return Ok(RetentionReport { kept: runs.len(), ..Default::default() });
    }

    let mut report = RetentionReport { kept: keep, ..Default::default() };
    for run in runs.into_iter().skip(keep) {
        if let Some(ref file) = run.output_file {
            match std::fs::remove_file(file) {
                Ok(()) => log::info!("Deleted old backup file for job {}: {:?}", job_id, file),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    log::debug!("Old backup file for job {} already gone: {:?}", job_id, file)
                }
                Err(e) => {
                    log::warn!("Could not delete old backup file {:?}: {}", file, e);
                    report.failed_files.push(file.clone());
                }
            }
        }

        match store.delete_run(&run.id) {
            Ok(()) => report.removed.push(run.id),
            Err(e) => log::warn!("Could not delete run {} of job {}: {}", run.id, job_id, e),
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::new_job;
    use crate::db::Db;
    use chrono::{Duration, Utc};
    use common::Run;
    use std::path::Path;

    fn seed_successes(db: &Db, job_id: JobId, dir: &Path, count: usize) -> Vec<Run> {
        let base = Utc::now() - Duration::hours(1);
        (0..count)
            .map(|i| {
                let started = base + Duration::minutes(i as i64);
                let file = dir.join(format!("job_{}_{}.zip", job_id, i));
                std::fs::write(&file, b"archive").unwrap();
                let mut run = Run::start(job_id, started);
                run.succeed(file, "Backup created", started);
                db.insert_run(&run).unwrap();
                run
            })
            .collect()
    }

    #[test]
    fn test_keeps_newest_runs_and_their_files() {
        let db = Db::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let job_id = db.create_job(&new_job("docs", "manual", None)).unwrap();
        let runs = seed_successes(&db, job_id, dir.path(), 5);

        let report = enforce(&db, job_id, 2).unwrap();
        assert_eq!(report.kept, 2);
        assert_eq!(report.removed.len(), 3);
        assert!(report.failed_files.is_empty());

        let remaining = db.successful_runs(job_id).unwrap();
        let remaining_ids: Vec<_> = remaining.iter().map(|r| r.id.clone()).collect();
        assert_eq!(remaining_ids, vec![runs[4].id.clone(), runs[3].id.clone()]);

        for run in &runs[3..] {
            assert!(run.output_file.as_ref().unwrap().exists());
        }
        for run in &runs[..3] {
            assert!(!run.output_file.as_ref().unwrap().exists());
        }
    }

    #[test]
    fn test_zero_keep_never_deletes() {
        let db = Db::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let job_id = db.create_job(&new_job("docs", "manual", None)).unwrap();
        let runs = seed_successes(&db, job_id, dir.path(), 4);

        let report = enforce(&db, job_id, 0).unwrap();
        assert_eq!(report, RetentionReport::default());
        assert_eq!(db.successful_runs(job_id).unwrap().len(), 4);
        assert!(runs.iter().all(|r| r.output_file.as_ref().unwrap().exists()));
    }

    #[test]
    fn test_under_limit_is_a_no_op() {
        let db = Db::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let job_id = db.create_job(&new_job("docs", "manual", None)).unwrap();
        seed_successes(&db, job_id, dir.path(), 3);

        let report = enforce(&db, job_id, 3).unwrap();
        assert_eq!(report.kept, 3);
        assert!(report.removed.is_empty());
        assert_eq!(db.successful_runs(job_id).unwrap().len(), 3);
    }

    #[test]
    fn test_missing_artifact_still_removes_record() {
        let db = Db::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let job_id = db.create_job(&new_job("docs", "manual", None)).unwrap();
        let runs = seed_successes(&db, job_id, dir.path(), 3);
        std::fs::remove_file(runs[0].output_file.as_ref().unwrap()).unwrap();

        let report = enforce(&db, job_id, 1).unwrap();
        assert_eq!(report.removed.len(), 2);
        assert!(report.failed_files.is_empty());
        assert_eq!(db.successful_runs(job_id).unwrap().len(), 1);
    }

    #[test]
    fn test_undeletable_artifact_is_reported_and_record_removed() {
        let db = Db::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let job_id = db.create_job(&new_job("docs", "manual", None)).unwrap();
        let runs = seed_successes(&db, job_id, dir.path(), 3);

        // A directory in place of the artifact makes remove_file fail.
        let oldest = runs[0].output_file.clone().unwrap();
        std::fs::remove_file(&oldest).unwrap();
        std::fs::create_dir(&oldest).unwrap();

        let report = enforce(&db, job_id, 1).unwrap();
        assert_eq!(report.failed_files, vec![oldest]);
        assert_eq!(report.removed.len(), 2);
        assert!(!runs[1].output_file.as_ref().unwrap().exists());
        assert_eq!(db.successful_runs(job_id).unwrap().len(), 1);
    }

    #[test]
    fn test_failed_runs_are_not_counted() {
        let db = Db::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let job_id = db.create_job(&new_job("docs", "manual", None)).unwrap();
        seed_successes(&db, job_id, dir.path(), 2);

        let mut failed = Run::start(job_id, Utc::now());
        failed.fail("Source path does not exist", Utc::now());
        db.insert_run(&failed).unwrap();

        let report = enforce(&db, job_id, 2).unwrap();
        assert!(report.removed.is_empty());
        assert_eq!(db.runs_for_job(job_id, 10).unwrap().len(), 3);
    }
}
