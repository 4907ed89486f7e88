// SPDX-License-Identifier: Apache-2.0

//! CLI commands
//!
//! - `migrate` - create schema on every configured database and seed the bookmark
//! - `info` - print build information
//! - `status` - print the bookmark held by every configured database

pub mod info;
pub mod migrate;
pub mod status;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use crate::config::{Config, DEFAULT_CONFIG_PATH};
use crate::engine::{open_engine, EnginePool};
use crate::observability;

/// Pactus blockchain indexer
#[derive(Parser, Debug)]
#[command(name = "pactus-indexer")]
#[command(version, about = crate::version::DESCRIPTION, long_about = None)]
pub struct Cli {
    /// Configuration file (YAML)
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Create tables, collections and indexes, then seed the indexer bookmark
    Migrate,
    /// Show application and build information
    Info,
    /// Show the indexer bookmark stored in every database
    Status,
}

/// Executes the parsed command line.
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Info => {
            info::run();
            Ok(())
        }
        Command::Migrate => migrate::run(&cli.config).await,
        Command::Status => status::run(&cli.config).await,
    }
}

/// Reports a failed command exactly once.
///
/// After [`load_config`] has installed a subscriber, the console layer
/// already writes to stderr, so the error goes through tracing only (and
/// reaches the log file too). Failures before that point go to stderr.
pub fn report_error(err: &anyhow::Error) {
    if tracing::dispatcher::has_been_set() {
        error!("{:#}", err);
    } else {
        eprintln!("{}", render_error(err));
    }
}

fn render_error(err: &anyhow::Error) -> String {
    format!("Error: {:#}", err)
}

/// Loads and validates the configuration, then starts logging from it.
pub(crate) fn load_config(path: &Path) -> anyhow::Result<Config> {
    let config = Config::load_validated(path)
        .with_context(|| format!("invalid configuration {}", path.display()))?;

    let logging = config.logging.clone().unwrap_or_default();
    observability::init_tracing(&logging).context("failed to initialize logging")?;

    Ok(config)
}

/// Opens every configured database and registers it into a new pool.
///
/// If any database cannot be opened, the ones already opened are closed
/// before the error is returned.
pub(crate) async fn open_pool(config: &Config) -> anyhow::Result<EnginePool> {
    let mut pool = EnginePool::new();

    for db in &config.dbs {
        info!(name = %db.name, engine = %db.engine, uri = %db.uri.redacted(), "opening database");
        match open_engine(db).await {
            Ok(engine) => pool.register_engine(engine),
            Err(err) => {
                if let Err(close_err) = pool.close().await {
                    warn!(%close_err, "failed to close engines after open failure");
                }
                return Err(err).with_context(|| {
                    format!("failed to open db '{}' ({} / {})", db.name, db.engine, db.db_type)
                });
            }
        }
    }

    Ok(pool)
}
