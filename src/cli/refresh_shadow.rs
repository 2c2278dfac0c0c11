//! Code implementing the "db refresh-shadow" sub command.

use std::time::Instant;

use clap::Parser;
use thousands::Separable;

use super::DbArgs;
use crate::{db, shadow};

/// Command line arguments for `db refresh-shadow` sub command.
#[derive(Parser, Debug)]
#[command(author, version, about = "Sync and verify the annotation shadow", long_about = None)]
pub struct Args {
    #[command(flatten)]
    pub db: DbArgs,
    /// Recompute frequency rows even if the declaration is unchanged.
    #[arg(long, default_value_t = false)]
    pub force: bool,
    /// Compare stored shadow rows with the annotation of every allele.
    #[arg(long, default_value_t = false)]
    pub verify: bool,
}

/// Summary of a refresh.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Refreshed {
    pub declaration_changed: bool,
    pub recomputed_rows: Option<u64>,
    /// Alleles whose shadow diverges from their annotation.
    pub diverging: Vec<i64>,
}

pub async fn refresh(args: &Args) -> Result<Refreshed, anyhow::Error> {
    let before = Instant::now();
    let conf = args.db.config()?;
    let pool = args.db.connect().await?;
    db::init_schema(&pool).await?;

    let mut result = Refreshed {
        declaration_changed: shadow::sync_frequency_declarations(&pool, &conf.frequencies).await?,
        ..Default::default()
    };
    if args.force && !result.declaration_changed {
        let mut tx = pool.begin().await?;
        let rows = shadow::recompute_frequencies(&mut tx).await?;
        tx.commit().await?;
        tracing::info!("recomputed {} frequency shadow rows", rows.separate_with_commas());
        result.recomputed_rows = Some(rows);
    }

    if args.verify {
        let allele_ids: Vec<i64> = sqlx::query_scalar(
            "SELECT DISTINCT allele_id FROM annotation WHERE date_superceeded IS NULL ORDER BY allele_id",
        )
        .fetch_all(&pool)
        .await?;
        for allele_id in &allele_ids {
            if !shadow::verify_allele(&pool, *allele_id).await? {
                result.diverging.push(*allele_id);
            }
        }
        tracing::info!(
            "verified shadow of {} alleles, {} diverging",
            allele_ids.len().separate_with_commas(),
            result.diverging.len()
        );
    }
    tracing::info!("refreshed shadow in {:?}", before.elapsed());
    Ok(result)
}

/// Main entry point for `db refresh-shadow` sub command.
pub fn run(args_common: &crate::common::Args, args: &Args) -> Result<(), anyhow::Error> {
    tracing::info!("args_common = {:?}", &args_common);
    tracing::info!("args = {:?}", &args);
    let result = super::runtime()?.block_on(refresh(args))?;
    if !result.diverging.is_empty() {
        anyhow::bail!(
            "shadow diverges for alleles {:?}",
            &result.diverging
        );
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use temp_testdir::TempDir;

    use super::Args;
    use crate::{cli::DbArgs, testing};

    #[tokio::test]
    async fn force_and_verify() -> Result<(), anyhow::Error> {
        let tmp_dir = TempDir::default();
        let db = DbArgs {
            path_db: tmp_dir.join("ella.sqlite").to_string_lossy().to_string(),
            path_config: None,
        };
        {
            let pool = db.connect().await?;
            crate::db::init(&pool, &Default::default()).await?;
            let allele_id = testing::allele(&pool, "13", 32_900_000, 1).await?;
            testing::annotate(
                &pool,
                allele_id,
                testing::blob(
                    1101,
                    "NM_000059.3",
                    &["missense_variant"],
                    serde_json::json!({"GNOMAD_GENOMES": {"freq": {"G": 0.01}, "num": {"G": 10000}}}),
                ),
            )
            .await?;
            pool.close().await;
        }

        let result = super::refresh(&Args {
            db: db.clone(),
            force: true,
            verify: true,
        })
        .await?;

        assert!(!result.declaration_changed);
        assert_eq!(result.recomputed_rows, Some(1));
        assert!(result.diverging.is_empty());
        Ok(())
    }
}
