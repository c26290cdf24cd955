//! `poolvisor` binary.
//!
//! - `poolvisor supervise [--config FILE]`: run the supervisor and its worker pool
//! - `poolvisor worker`: one HTTP worker (started by the supervisor)
//! - `poolvisor action update`: the built-in update action (started by the supervisor)
//!
//! Logs go to stderr; stdout of `worker` and `action` is the frame pipe to the supervisor.

use std::{path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use poolvisor::{
    Config, LogWriter, Subscribe, Supervisor,
    process::link,
    service::{update, worker},
};

#[derive(Parser)]
#[command(name = "poolvisor", version)]
#[command(about = "Process supervisor with rolling worker restarts")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the supervisor.
    Supervise {
        /// TOML configuration file.
        #[arg(long, short)]
        config: Option<PathBuf>,
        /// Number of workers per generation.
        #[arg(long)]
        pool_size: Option<usize>,
        /// Address the workers serve on.
        #[arg(long)]
        listen: Option<String>,
        /// Shared record file.
        #[arg(long)]
        record: Option<PathBuf>,
        /// TOML action registry, reloaded on every restart.
        #[arg(long)]
        actions: Option<PathBuf>,
    },
    /// Serve requests as a pool worker.
    Worker,
    /// Run a built-in action.
    Action {
        #[command(subcommand)]
        action: Action,
    },
}

#[derive(Subcommand)]
enum Action {
    /// Set a package version in the record and request a restart.
    Update,
}

fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(err) => {
            error!(error = %err, "failed to start runtime");
            return ExitCode::FAILURE;
        }
    };
    let result = runtime.block_on(run(args.command));
    // A pending blocking read on stdin cannot be cancelled.
    runtime.shutdown_background();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %format!("{err:#}"), "poolvisor failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Supervise {
            config,
            pool_size,
            listen,
            record,
            actions,
        } => {
            let mut cfg = match config {
                Some(path) => Config::load(&path)
                    .await
                    .with_context(|| format!("loading {}", path.display()))?,
                None => Config::default(),
            };
            if let Some(n) = pool_size {
                cfg.pool_size = n;
            }
            if let Some(addr) = listen {
                cfg.listen = addr;
            }
            if let Some(path) = record {
                cfg.record = path;
            }
            if actions.is_some() {
                cfg.actions = actions;
            }

            let subs: Vec<Arc<dyn Subscribe>> = vec![Arc::new(LogWriter::new())];
            let sup = Supervisor::builder(cfg).with_subscribers(subs).build();
            sup.run().await?;
        }
        Command::Worker => {
            let opts = worker::WorkerOptions::from_env()?;
            worker::run(opts).await?;
        }
        Command::Action {
            action: Action::Update,
        } => {
            let params = update::UpdateParams::from_env()?;
            let record = update::record_from_env();
            let parent = link::ParentSender::new(tokio::io::stdout());
            update::run(&params, &record, &parent).await?;
        }
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
