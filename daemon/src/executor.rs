use chrono::{DateTime, Utc};
use common::{Job, Run, RunStatus};
use std::fs;
use std::path::Path;

use crate::archive::{backup_filename, build_archive};
use crate::db::Storage;
use crate::retention;

/// Runs one backup attempt for `job` and returns the final run.
///
/// The run is recorded as `running` before any archiving starts, so an
/// interrupted attempt stays visible. Nothing is returned as an error: every
/// failure ends up in the run's `error` status and message. Retention runs
/// only after a successful, persisted run.
///
/// A success that cannot be saved is turned into an error and its archive is
/// removed, so no file on disk is left without a run pointing at it.
pub fn execute<S: Storage + ?Sized>(store: &S, job: &Job, keep: usize) -> Run {
    execute_with_clock(store, job, keep, Utc::now)
}

fn execute_with_clock<S, C>(store: &S, job: &Job, keep: usize, now: C) -> Run
where
    S: Storage + ?Sized,
    C: Fn() -> DateTime<Utc>,
{
    let mut run = Run::start(job.id, now());

    if let Err(e) = store.insert_run(&run) {
        log::error!("Failed to record run for job {}: {:#}", job.id, e);
        run.fail(format!("Failed to record run: {:#}", e), now());
        log_outcome(job, &run);
        return run;
    }

    let output_file = backup_filename(job.id, &job.destination_path, run.started_at);
    log::info!("Backing up {:?} to {:?} for job {} ({})", job.source_path, output_file, job.id, job.name);

    match build_archive(&job.source_path, &output_file) {
        Ok(message) => run.succeed(output_file, message, now()),
        Err(e) => run.fail(e.to_string(), now()),
    }

    let persisted = match store.update_run(&run) {
        Ok(()) => true,
        Err(e) => {
            log::error!("Failed to save result of run {} for job {}: {:#}", run.id, job.id, e);
            if let Some(ref file) = run.output_file {
                discard_archive(file);
            }
            if run.status == RunStatus::Success {
                run.fail(format!("Failed to save run result: {:#}", e), now());
                // Best effort: the row may still say `running`.
                if let Err(e) = store.update_run(&run) {
                    log::warn!("Run {} for job {} stays unrecorded: {:#}", run.id, job.id, e);
                }
            }
            false
        }
    };

    if persisted && run.status == RunStatus::Success {
        match retention::enforce(store, job.id, keep) {
            Ok(report) if !report.removed.is_empty() => log::info!(
                "Retention removed {} old backups of job {} (kept {})",
                report.removed.len(),
                job.id,
                report.kept
            ),
            Ok(_) => {}
            Err(e) => log::warn!("Retention failed for job {}: {:#}", job.id, e),
        }
    }

    log_outcome(job, &run);
    run
}

fn discard_archive(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => log::debug!("Removed unrecorded archive {:?}", path),
        Err(e) => log::warn!("Could not remove unrecorded archive {:?}: {}", path, e),
    }
}

fn log_outcome(job: &Job, run: &Run) {
    let message = run.message.as_deref().unwrap_or("");
    match run.status {
        RunStatus::Success => log::info!("Job {} ({}) finished: {}", job.id, job.name, message),
        _ => log::warn!("Job {} ({}) failed: {}", job.id, job.name, message),
    }
    log::info!(
        target: "run_history",
        "job={} run={} status={} started={} message={}",
        job.id,
        run.id,
        run.status,
        run.started_at.to_rfc3339(),
        message
    );
}
