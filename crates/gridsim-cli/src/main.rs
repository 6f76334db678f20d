//! gridsim — drive a simulated compute node pool from a command shell.
//!
//! # Usage
//!
//! ```text
//! gridsim shell --config gridsim.toml
//! gridsim run scenario.txt --tick 250ms
//! gridsim config > gridsim.toml
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::BufReader;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gridsim_core::GridConfig;
use gridsim_scheduler::Scheduler;

mod commands;

#[derive(Parser)]
#[command(
    name = "gridsim",
    about = "GridSim — simulated compute node pool with first-fit scheduling",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Path to gridsim.toml (defaults apply when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Override the countdown tick, e.g. "250ms"
    #[arg(long, global = true)]
    tick: Option<String>,
    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive command shell on stdin
    Shell,
    /// Execute a command script, one command per line
    Run {
        /// Script file
        script: PathBuf,
    },
    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let mut config = match &cli.config {
        Some(path) => GridConfig::from_file(path)?,
        None => GridConfig::default(),
    };
    if let Some(tick) = cli.tick {
        config.scheduler.tick = tick;
    }
    config.validate()?;

    match cli.command {
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
        Commands::Shell => {
            println!("gridsim shell — type 'help' for commands");
            let stdin = BufReader::new(tokio::io::stdin());
            session(&config, stdin, true).await
        }
        Commands::Run { script } => {
            let file = tokio::fs::File::open(&script)
                .await
                .with_context(|| format!("opening {}", script.display()))?;
            session(&config, BufReader::new(file), false).await
        }
    }
}

/// Build the scheduler, start the background queue loop and run one session.
async fn session<R>(config: &GridConfig, reader: R, interactive: bool) -> anyhow::Result<()>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let scheduler = Scheduler::from_config(config).await?;
    info!(
        nodes = config.nodes.len(),
        tick_ms = scheduler.tick().as_millis() as u64,
        "scheduler ready"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let queue_loop = match config.scheduler.queue_interval()? {
        Some(interval) => {
            let looping = scheduler.clone();
            Some(tokio::spawn(async move {
                looping.run(interval, shutdown_rx).await;
            }))
        }
        None => None,
    };

    let mut stdout = tokio::io::stdout();
    let failures = commands::run_session(&scheduler, reader, &mut stdout, interactive).await?;

    let _ = shutdown_tx.send(true);
    if let Some(handle) = queue_loop {
        let _ = handle.await;
    }

    info!(failures, "session finished");
    if !interactive && failures > 0 {
        anyhow::bail!("{failures} command(s) failed");
    }
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,gridsim=info"));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}
