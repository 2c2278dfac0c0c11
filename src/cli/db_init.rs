//! Code implementing the "db init" sub command.

use std::time::Instant;

use clap::Parser;

use super::DbArgs;
use crate::{db, shadow};

/// Command line arguments for `db init` sub command.
#[derive(Parser, Debug)]
#[command(author, version, about = "Create the database schema", long_about = None)]
pub struct Args {
    #[command(flatten)]
    pub db: DbArgs,
}

/// Create the schema and frequency declarations; returns the number of
/// declared provider/population pairs.
pub async fn init(args: &Args) -> Result<usize, anyhow::Error> {
    let before = Instant::now();
    let conf = args.db.config()?;
    let pool = args.db.connect().await?;
    db::init(&pool, &conf).await?;
    let mut conn = pool.acquire().await?;
    let declarations = shadow::declarations(&mut conn).await?;
    tracing::info!(
        "schema ready with {} frequency declarations in {:?}",
        declarations.len(),
        before.elapsed()
    );
    Ok(declarations.len())
}

/// Main entry point for `db init` sub command.
pub fn run(args_common: &crate::common::Args, args: &Args) -> Result<(), anyhow::Error> {
    tracing::info!("args_common = {:?}", &args_common);
    tracing::info!("args = {:?}", &args);
    super::runtime()?.block_on(init(args))?;
    Ok(())
}
