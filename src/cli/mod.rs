use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;

pub mod account;
pub mod init;
pub mod job;
pub mod maintenance;
pub mod migrate;
pub mod serve;

use crate::core::AppConfig;
use crate::core::db::async_db;
use crate::service::SyncService;
use account::AccountCommand;
use job::JobId;

#[derive(Subcommand)]
enum Command {
    /// Create the database schema
    Init {},
    /// Migrate the db schema
    Migrate {},
    /// Run the API server and background jobs
    Serve {
        /// Set the server host address
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Set the server port
        #[arg(long, default_value = "2323")]
        port: String,
    },
    /// Manage connected calendar accounts
    Account {
        #[command(subcommand)]
        command: AccountCommand,
    },
    /// Run a sync pass for one calendar
    Sync {
        #[arg(long)]
        calendar_id: i64,
        /// Re-list the calendar instead of reading changes since the last pass
        #[arg(long, default_value = "false")]
        full: bool,
    },
    /// Clean up orphaned and failed placeholders
    Reconcile {},
    /// Renew push subscriptions that are about to expire
    Renew {},
    /// Run a periodic job once
    Job {
        #[arg(long, value_enum)]
        id: JobId,
    },
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

/// Open the configured database and build the Google backed service.
pub async fn open_service(config: AppConfig) -> Result<Arc<SyncService>> {
    let db = async_db(&config.db_path).await?;
    Ok(Arc::new(SyncService::google(db, config)?))
}

pub async fn run() -> Result<()> {
    let args = Cli::parse();
    let config = AppConfig::default();

    // Handle each sub command
    match args.command {
        Some(Command::Init {}) => {
            init::run(&config).await?;
        }
        Some(Command::Migrate {}) => {
            migrate::run(&config).await?;
        }
        Some(Command::Serve { host, port }) => {
            serve::run(host, port, config).await?;
        }
        Some(Command::Account { command }) => {
            account::run(command, config).await?;
        }
        Some(Command::Sync { calendar_id, full }) => {
            maintenance::sync(calendar_id, full, config).await?;
        }
        Some(Command::Reconcile {}) => {
            maintenance::reconcile(config).await?;
        }
        Some(Command::Renew {}) => {
            maintenance::renew(config).await?;
        }
        Some(Command::Job { id }) => {
            job::run(id, config).await?;
        }
        None => {}
    }

    Ok(())
}
