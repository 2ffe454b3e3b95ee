//! Command orchestrator binary
//!
//! One long-running process; all configuration comes from an optional
//! file, `ORCHESTRATOR_`-prefixed environment variables, and the flag
//! overrides below. Exit codes: 0 clean shutdown, 1 fatal init,
//! 2 fatal runtime.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use orchestrator_config::load_settings;
use orchestrator_server::{ServerError, Supervisor};

#[derive(Parser, Debug)]
#[command(
    name = "command-orchestrator",
    about = "Voice-first assistant command orchestrator",
    version
)]
struct Args {
    /// Configuration file (TOML or YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the bind host
    #[arg(long)]
    host: Option<String>,

    /// Override the bind port
    #[arg(long)]
    port: Option<u16>,

    /// Override the persistence root directory
    #[arg(long)]
    data_dir: Option<String>,

    /// Override the pipeline worker count
    #[arg(long)]
    workers: Option<usize>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mut settings = match load_settings(args.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("fatal: configuration error: {e}");
            return ExitCode::from(1);
        }
    };

    if let Some(host) = args.host {
        settings.server.host = host;
    }
    if let Some(port) = args.port {
        settings.server.port = port;
    }
    if let Some(data_dir) = args.data_dir {
        settings.persistence.root = data_dir;
    }
    if let Some(workers) = args.workers {
        settings.pipeline.worker_count = workers;
    }
    if args.log_json {
        settings.server.log_json = true;
    }
    if let Err(e) = settings.validate() {
        eprintln!("fatal: configuration error: {e}");
        return ExitCode::from(1);
    }

    init_tracing(settings.server.log_json);

    match Supervisor::new(settings).run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(ServerError::Init(e)) => {
            tracing::error!(error = %e, "fatal initialization error");
            ExitCode::from(1)
        }
        Err(e) => {
            tracing::error!(error = %e, "fatal runtime error");
            ExitCode::from(2)
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
