//! bql - run BQL scripts, an interactive shell, or an HTTP server
//!
//! Btables persist as JSON files under the configured data directory unless
//! `--ephemeral` is given.

use std::path::PathBuf;

use anyhow::Context;
use bql_engine::{Engine, FileStore};
use clap::{Parser, Subcommand};
use tracing::info;

mod config;
mod http;
mod logging;
mod runner;
mod shell;

use config::Config;

#[derive(Parser, Debug)]
#[command(name = "bql", version, about = "Bayesian query language engine")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(long, global = true, default_value = "config.yaml")]
    config: PathBuf,

    /// Keep btables in memory instead of the data directory
    #[arg(long, global = true)]
    ephemeral: bool,

    /// RNG seed, overriding the configuration
    #[arg(long, global = true)]
    seed: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a script file
    Run {
        script: PathBuf,

        /// Continue with the next statement after an error
        #[arg(long)]
        keep_going: bool,
    },
    /// Read statements interactively
    Shell,
    /// Serve queries over HTTP
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
}

fn build_engine(config: &Config, ephemeral: bool) -> anyhow::Result<Engine> {
    let engine_config = config.engine.engine_config(".");
    if ephemeral {
        return Ok(Engine::in_memory(engine_config));
    }
    let store = FileStore::open(&config.engine.data_dir)
        .with_context(|| format!("opening data directory {}", config.engine.data_dir.display()))?;
    info!(data_dir = %store.dir().display(), "Using file store");
    Ok(Engine::new(Box::new(store), engine_config))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let mut config = Config::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(seed) = cli.seed {
        config.engine.seed = Some(seed);
    }

    config.apply_logging_env();
    logging::init();

    match cli.command {
        Command::Run { script, keep_going } => {
            let summary = tokio::task::spawn_blocking(move || -> anyhow::Result<runner::RunSummary> {
                let mut engine = build_engine(&config, cli.ephemeral)?;
                runner::run_script(&mut engine, &script, keep_going)
            })
            .await??;
            info!(executed = summary.executed, failed = summary.failed, "Script finished");
            if summary.failed > 0 {
                std::process::exit(1);
            }
        }
        Command::Shell => {
            tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
                let mut engine = build_engine(&config, cli.ephemeral)?;
                let stdin = std::io::stdin();
                shell::repl(&mut engine, stdin.lock(), std::io::stdout())?;
                Ok(())
            })
            .await??;
        }
        Command::Serve { host, port } => {
            let host = host.unwrap_or_else(|| config.server.host.clone());
            let port = port.unwrap_or(config.server.port);
            let engine = build_engine(&config, cli.ephemeral)?;
            info!("Starting BQL server on {}:{}", host, port);
            http::serve(&format!("{host}:{port}"), engine)
                .await
                .map_err(|e| anyhow::anyhow!("server error: {e}"))?;
        }
    }

    Ok(())
}
