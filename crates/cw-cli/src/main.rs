use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cw_cli::commands::{
    aggregate, channels, heartbeat, init, listen, ranks, reconcile, retention, status,
};
use cw_cli::{ChannelsAction, Cli, Commands, Config};

/// Load config and open database, ensuring the parent directory exists.
fn open_database(config_path: Option<&Path>) -> Result<(cw_db::Database, Config)> {
    let config = Config::load_from(config_path).context("failed to load configuration")?;
    tracing::debug!(?config, "loaded configuration");

    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create database directory")?;
    }

    let db = cw_db::Database::open(&config.database_path).context("failed to open database")?;
    Ok((db, config))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    // Use try_init to avoid panic if tracing is already initialized (e.g., in tests)
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();

    let mut stdout = std::io::stdout();

    match &cli.command {
        Some(Commands::Init { label }) => {
            init::run(&mut stdout, label.as_deref())?;
        }
        Some(Commands::Channels { action }) => {
            let (db, _config) = open_database(cli.config.as_deref())?;
            match action {
                ChannelsAction::Track { id, name } => channels::track(&mut stdout, &db, id, name)?,
                ChannelsAction::List { json } => channels::list(&mut stdout, &db, *json)?,
            }
        }
        Some(Commands::Heartbeat {
            viewer,
            channel,
            timestamp,
            seconds,
        }) => {
            let (db, _config) = open_database(cli.config.as_deref())?;
            heartbeat::run(&mut stdout, db, viewer, channel, timestamp.as_deref(), *seconds)?;
        }
        Some(Commands::Aggregate {
            viewer,
            channel,
            allow_decreases,
            json,
        }) => {
            let (mut db, _config) = open_database(cli.config.as_deref())?;
            aggregate::run(
                &mut stdout,
                &mut db,
                viewer.as_deref(),
                channel,
                *allow_decreases,
                *json,
            )?;
        }
        Some(Commands::Ranks {
            channel,
            window_hours,
        }) => {
            let (mut db, config) = open_database(cli.config.as_deref())?;
            let window = window_hours.unwrap_or(config.percentile_window_hours);
            ranks::run(&mut stdout, &mut db, channel, window)?;
        }
        Some(Commands::Reconcile {
            viewer,
            channel,
            date,
        }) => {
            let (mut db, _config) = open_database(cli.config.as_deref())?;
            reconcile::run(&mut stdout, &mut db, viewer, channel, date)?;
        }
        Some(Commands::Listen { channels, label }) => {
            let (db, config) = open_database(cli.config.as_deref())?;
            listen::run(&config, db, channels, label.as_deref())?;
        }
        Some(Commands::Retention { days }) => {
            let (db, config) = open_database(cli.config.as_deref())?;
            retention::run(&mut stdout, &db, days.unwrap_or(config.retention_days))?;
        }
        Some(Commands::Status) => {
            let (db, config) = open_database(cli.config.as_deref())?;
            status::run(&mut stdout, &db, &config.database_path)?;
        }
        None => {
            use clap::CommandFactory;
            Cli::command().print_help()?;
            println!();
        }
    }

    Ok(())
}
