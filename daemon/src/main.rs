mod archive;
mod config;
mod db;
mod executor;
mod handlers;
mod migrations;
mod retention;
mod scheduler;

use clap::Parser;
use common::{Request, Response};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;

use config::Config;
use db::Database;
use scheduler::{BackupRunner, Scheduler};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (.yaml, .yml or .toml)
    #[arg(short, long, env = "SNAPKEEP_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;
    setup_logging(&config)?;
    log::info!("Starting snapkeep-daemon...");

    let db = Database::init(&config.server.database_path)?;
    let runner = Arc::new(BackupRunner::new(db.clone(), config.retention.max_backups_per_job));
    let scheduler = Arc::new(Scheduler::new(db.clone(), runner, config.schedule.daily_time()?));

    if let Err(e) = scheduler.start() {
        log::error!("Failed to load jobs at startup: {:#}", e);
    }

    let socket_path = &config.server.socket_path;
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }

    let listener = UnixListener::bind(socket_path)?;
    log::info!("Listening on {:?}", socket_path);

    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(socket_path)?.permissions();
    perms.set_mode(0o660);
    std::fs::set_permissions(socket_path, perms)?;

    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, _) = accepted?;
                let scheduler = scheduler.clone();
                let db = db.clone();
                tokio::spawn(async move {
                    serve_client(socket, &scheduler, &db).await;
                });
            }
            _ = tokio::signal::ctrl_c() => break,
            _ = terminate.recv() => break,
        }
    }

    log::info!("Shutting down scheduler...");
    scheduler.stop();
    let _ = std::fs::remove_file(socket_path);
    Ok(())
}

async fn serve_client(socket: tokio::net::UnixStream, scheduler: &Scheduler, db: &Database) {
    let (reader, mut writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                log::error!("failed to read from socket; err = {:?}", e);
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let resp = match serde_json::from_str::<Request>(&line) {
            Ok(req) => {
                log::info!("Received request: {:?}", req);
                handlers::handle_request(req, scheduler, db).await
            }
            Err(e) => {
                log::error!("failed to deserialize request; err = {:?}", e);
                Response::Error(format!("Invalid request: {}", e))
            }
        };

        let mut resp_bytes = match serde_json::to_vec(&resp) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("failed to serialize response; err = {:?}", e);
                return;
            }
        };
        resp_bytes.push(b'\n');

        if let Err(e) = writer.write_all(&resp_bytes).await {
            log::error!("failed to write to socket; err = {:?}", e);
            return;
        }
    }
}

fn setup_logging(config: &Config) -> anyhow::Result<()> {
    let base_config = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}] {}",
                chrono::Local::now().format("%Y-%m-%d][%H:%M:%S"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(config.logging.level_filter()?);

    // Main log: everything except the run history records
    let mut main_log = fern::Dispatch::new()
        .filter(|metadata| metadata.target() != "run_history")
        .chain(std::io::stdout());
    if let Some(ref path) = config.logging.output {
        main_log = main_log.chain(fern::log_file(path)?);
    }

    let mut dispatch = base_config.chain(main_log);

    if let Some(ref path) = config.logging.runs_output {
        let runs_log = fern::Dispatch::new()
            .filter(|metadata| metadata.target() == "run_history")
            .chain(fern::log_file(path)?);
        dispatch = dispatch.chain(runs_log);
    }

    dispatch.apply()?;
    Ok(())
}
