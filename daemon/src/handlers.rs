use common::{Job, NewJob, Request, Response};
use std::path::Path;

use crate::db::{Database, Storage};
use crate::scheduler::Scheduler;

/// Applies one client request. Job mutations are followed by a scheduler reload.
pub async fn handle_request(req: Request, scheduler: &Scheduler, db: &Database) -> Response {
    let store = match db.connect() {
        Ok(store) => store,
        Err(e) => return Response::Error(format!("DB Error: {:#}", e)),
    };

    match req {
        Request::AddJob(job) => {
            if let Err(e) = validate_new(&job) {
                return Response::Error(e);
            }
            match store.create_job(&job) {
                Ok(id) => {
                    log::info!("Created job {} ({})", id, job.name);
                    reload(scheduler);
                    Response::JobCreated(id)
                }
                Err(e) => Response::Error(format!("DB Error: {}", e)),
            }
        }
        Request::UpdateJob(job) => {
            if let Err(e) = validate_existing(&job) {
                return Response::Error(e);
            }
            mutation(scheduler, store.update_job(&job), "Updated", &job.id)
        }
        Request::SetJobActive(id, active) => {
            let verb = if active { "Enabled" } else { "Disabled" };
            mutation(scheduler, store.set_job_active(id, active), verb, &id)
        }
        Request::RemoveJob(id) => mutation(scheduler, store.remove_job(id), "Removed", &id),
        Request::ListJobs => match store.list_jobs() {
            Ok(jobs) => Response::JobList(jobs),
            Err(e) => Response::Error(format!("DB Error: {}", e)),
        },
        Request::GetJob(id) => match store.get_job(id) {
            Ok(job) => Response::JobDetail(job),
            Err(e) => Response::Error(format!("DB Error: {:#}", e)),
        },
        Request::RunJob(id) => {
            drop(store);
            match scheduler.run_now(id).await {
                Ok(run) => Response::RunResult(run),
                Err(e) => Response::Error(e.to_string()),
            }
        }
        Request::GetRuns(id, limit) => match store.runs_for_job(id, limit) {
            Ok(runs) => Response::RunList(runs),
            Err(e) => Response::Error(format!("DB Error: {:#}", e)),
        },
        Request::ListScheduled => Response::Scheduled(scheduler.scheduled_jobs()),
        Request::Reload => match scheduler.reload() {
            Ok(()) => Response::Ok,
            Err(e) => Response::Error(format!("Reload failed: {:#}", e)),
        },
    }
}

fn mutation(
    scheduler: &Scheduler,
    result: rusqlite::Result<bool>,
    verb: &str,
    id: &dyn std::fmt::Display,
) -> Response {
    match result {
        Ok(true) => {
            log::info!("{} job {}", verb, id);
            reload(scheduler);
            Response::Ok
        }
        Ok(false) => Response::Error("Job not found".to_string()),
        Err(e) => Response::Error(format!("DB Error: {}", e)),
    }
}

fn reload(scheduler: &Scheduler) {
    if let Err(e) = scheduler.reload() {
        log::error!("Scheduler reload failed: {:#}", e);
    }
}

fn validate_new(job: &NewJob) -> Result<(), String> {
    validate_fields(&job.name, &job.source_path, &job.destination_path)?;
    job.schedule().map(|_| ()).map_err(|e| e.to_string())
}

fn validate_existing(job: &Job) -> Result<(), String> {
    validate_fields(&job.name, &job.source_path, &job.destination_path)?;
    job.schedule().map(|_| ()).map_err(|e| e.to_string())
}

fn validate_fields(name: &str, source: &Path, destination: &Path) -> Result<(), String> {
    if name.trim().is_empty() || source.as_os_str().is_empty() || destination.as_os_str().is_empty() {
        return Err("Name, source path and destination path are required".to_string());
    }
    Ok(())
}
