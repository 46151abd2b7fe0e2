use anyhow::{anyhow, Context};
use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use comfy_table::Table;
use common::{Job, JobId, NewJob, Request, Response, Run};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Daemon socket
    #[arg(long, default_value = common::DEFAULT_SOCKET_PATH)]
    socket: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ScheduleKind {
    Manual,
    Interval,
    Daily,
}

impl ScheduleKind {
    fn as_str(&self) -> &'static str {
        match self {
            ScheduleKind::Manual => "manual",
            ScheduleKind::Interval => "interval",
            ScheduleKind::Daily => "daily",
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Add a new backup job
    Add {
        /// Name of the job
        #[arg(short, long)]
        name: String,
        /// Directory to back up
        #[arg(short, long)]
        source: PathBuf,
        /// Directory receiving the archives
        #[arg(short, long)]
        destination: PathBuf,
        #[arg(long, value_enum, default_value = "manual")]
        schedule: ScheduleKind,
        /// Minutes between runs, for interval schedules
        #[arg(long)]
        interval: Option<i64>,
        /// Create the job disabled
        #[arg(long)]
        inactive: bool,
    },
    /// Change an existing job
    Edit {
        id: i64,
        #[arg(short, long)]
        name: Option<String>,
        #[arg(short, long)]
        source: Option<PathBuf>,
        #[arg(short, long)]
        destination: Option<PathBuf>,
        #[arg(long, value_enum)]
        schedule: Option<ScheduleKind>,
        #[arg(long)]
        interval: Option<i64>,
    },
    /// Enable scheduling of a job
    Enable { id: i64 },
    /// Disable scheduling of a job
    Disable { id: i64 },
    /// Remove a job and its run history
    Remove { id: i64 },
    /// List all jobs
    List,
    /// Get job details
    Get { id: i64 },
    /// Run a backup now
    Run { id: i64 },
    /// View run history of a job
    History {
        id: i64,
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
        /// Print CSV instead of a table
        #[arg(long)]
        csv: bool,
    },
    /// Show live triggers
    Scheduled,
    /// Ask the daemon to reload jobs
    Reload,
}

struct Client {
    lines: tokio::io::Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(path: &Path) -> anyhow::Result<Self> {
        let stream = UnixStream::connect(path)
            .await
            .with_context(|| format!("Failed to connect to daemon at {:?}", path))?;
        let (reader, writer) = stream.into_split();
        Ok(Self { lines: BufReader::new(reader).lines(), writer })
    }

    async fn send(&mut self, req: &Request) -> anyhow::Result<Response> {
        let mut req_bytes = serde_json::to_vec(req)?;
        req_bytes.push(b'\n');
        self.writer.write_all(&req_bytes).await?;

        let line = self
            .lines
            .next_line()
            .await?
            .ok_or_else(|| anyhow!("Daemon closed the connection"))?;
        Ok(serde_json::from_str(&line)?)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut client = Client::connect(&cli.socket).await?;

    let req = match cli.command {
        Commands::Add { name, source, destination, schedule, interval, inactive } => {
            let job = NewJob {
                name,
                source_path: source,
                destination_path: destination,
                schedule_type: schedule.as_str().to_string(),
                interval_minutes: interval,
                active: !inactive,
            };
            job.schedule()?;
            Request::AddJob(job)
        }
        Commands::Edit { id, name, source, destination, schedule, interval } => {
            let mut job = match client.send(&Request::GetJob(JobId(id))).await? {
                Response::JobDetail(Some(job)) => job,
                Response::JobDetail(None) => return Err(anyhow!("Job {} not found", id)),
                Response::Error(e) => return Err(anyhow!(e)),
                other => return Err(anyhow!("Unexpected response: {:?}", other)),
            };
            if let Some(name) = name {
                job.name = name;
            }
            if let Some(source) = source {
                job.source_path = source;
            }
            if let Some(destination) = destination {
                job.destination_path = destination;
            }
            if let Some(schedule) = schedule {
                job.schedule_type = schedule.as_str().to_string();
            }
            if interval.is_some() {
                job.interval_minutes = interval;
            }
            job.schedule()?;
            Request::UpdateJob(job)
        }
        Commands::Enable { id } => Request::SetJobActive(JobId(id), true),
        Commands::Disable { id } => Request::SetJobActive(JobId(id), false),
        Commands::Remove { id } => Request::RemoveJob(JobId(id)),
        Commands::List => Request::ListJobs,
        Commands::Get { id } => Request::GetJob(JobId(id)),
        Commands::Run { id } => Request::RunJob(JobId(id)),
        Commands::History { id, limit, csv } => {
            let resp = client.send(&Request::GetRuns(JobId(id), limit)).await?;
            return match resp {
                Response::RunList(runs) if csv => print_runs_csv(&runs),
                Response::RunList(runs) => {
                    print_runs(&runs);
                    Ok(())
                }
                Response::Error(e) => Err(anyhow!(e)),
                other => Err(anyhow!("Unexpected response: {:?}", other)),
            };
        }
        Commands::Scheduled => Request::ListScheduled,
        Commands::Reload => Request::Reload,
    };

    match client.send(&req).await? {
        Response::Ok => println!("Success"),
        Response::Error(e) => return Err(anyhow!(e)),
        Response::JobCreated(id) => println!("Created job {}", id),
        Response::JobList(jobs) => print_jobs(&jobs),
        Response::JobDetail(job_opt) => {
            if let Some(job) = job_opt {
                print_job(&job);
            } else {
                println!("Job not found.");
            }
        }
        Response::RunResult(run) => {
            let message = run.message.as_deref().unwrap_or("");
            match run.output_file {
                Some(ref file) => println!("Backup completed: {}", file.display()),
                None => return Err(anyhow!("Backup failed: {}", message)),
            }
        }
        Response::RunList(runs) => print_runs(&runs),
        Response::Scheduled(entries) => {
            let mut table = Table::new();
            table.set_header(vec!["Job", "Schedule"]);
            for entry in entries {
                table.add_row(vec![entry.job_id.to_string(), entry.policy.to_string()]);
            }
            println!("{table}");
        }
    }

    Ok(())
}

fn local(ts: &DateTime<Utc>) -> String {
    ts.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

fn print_jobs(jobs: &[Job]) {
    let mut table = Table::new();
    table.set_header(vec!["ID", "Name", "Source", "Destination", "Schedule", "Interval (min)", "Active"]);
    for job in jobs {
        table.add_row(vec![
            job.id.to_string(),
            job.name.clone(),
            job.source_path.display().to_string(),
            job.destination_path.display().to_string(),
            job.schedule_type.clone(),
            job.interval_minutes.map(|m| m.to_string()).unwrap_or_default(),
            if job.active { "Yes" } else { "No" }.to_string(),
        ]);
    }
    println!("{table}");
}

fn print_job(job: &Job) {
    println!("Job Details:");
    println!("  ID:          {}", job.id);
    println!("  Name:        {}", job.name);
    println!("  Source:      {}", job.source_path.display());
    println!("  Destination: {}", job.destination_path.display());
    match job.schedule() {
        Ok(policy) => println!("  Schedule:    {}", policy),
        Err(e) => println!("  Schedule:    {} (invalid: {})", job.schedule_type, e),
    }
    println!("  Active:      {}", job.active);
    println!("  Created:     {}", local(&job.created_at));
}

fn print_runs(runs: &[Run]) {
    let mut table = Table::new();
    table.set_header(vec!["Started", "Finished", "Status", "Output", "Message"]);
    for run in runs {
        table.add_row(vec![
            local(&run.started_at),
            run.finished_at.as_ref().map(local).unwrap_or_default(),
            run.status.to_string(),
            run.output_file.as_ref().map(|p| p.display().to_string()).unwrap_or_default(),
            run.message.clone().unwrap_or_default(),
        ]);
    }
    println!("{table}");
}

fn print_runs_csv(runs: &[Run]) -> anyhow::Result<()> {
    let mut writer = csv::Writer::from_writer(std::io::stdout());
    writer.write_record(["run_id", "job_id", "status", "started_at", "finished_at", "output_file", "message"])?;
    for run in runs {
        writer.write_record([
            run.id.to_string(),
            run.job_id.to_string(),
            run.status.to_string(),
            run.started_at.to_rfc3339(),
            run.finished_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
            run.output_file.as_ref().map(|p| p.display().to_string()).unwrap_or_default(),
            run.message.clone().unwrap_or_default(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}
