//! Sub commands of the maintenance binary.

use clap::Parser;
use sqlx::SqlitePool;

use crate::{conf::Config, db};

pub mod db_init;
pub mod filter;
pub mod refresh_shadow;

/// Database and configuration location shared by all sub commands.
#[derive(Parser, Debug, Clone)]
pub struct DbArgs {
    /// Path to the SQLite database file.
    #[arg(long, required = true)]
    pub path_db: String,
    /// Optional path to the TOML configuration; defaults are used otherwise.
    #[arg(long)]
    pub path_config: Option<String>,
}

impl DbArgs {
    /// Load the configuration file, if any.
    pub fn config(&self) -> Result<Config, anyhow::Error> {
        Ok(match &self.path_config {
            Some(path) => {
                let path = shellexpand::tilde(path);
                tracing::info!("loading configuration from {}", &path);
                Config::load(path.as_ref())?
            }
            None => Config::default(),
        })
    }

    /// Open the database.
    pub async fn connect(&self) -> Result<SqlitePool, anyhow::Error> {
        let path = shellexpand::tilde(&self.path_db);
        Ok(db::connect(&format!("sqlite://{}", path)).await?)
    }
}

/// Current-thread runtime for the async part of a sub command.
pub(crate) fn runtime() -> Result<tokio::runtime::Runtime, anyhow::Error> {
    Ok(tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?)
}
