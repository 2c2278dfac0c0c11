//! Code implementing the "filter" sub command.

use std::time::Instant;

use clap::Parser;
use serde::Serialize;
use thousands::Separable;

use super::DbArgs;
use crate::{filters::chain::ChainResult, workflow};

/// Command line arguments for `filter` sub command.
#[derive(Parser, Debug)]
#[command(author, version, about = "Run a filter config on an analysis", long_about = None)]
pub struct Args {
    #[command(flatten)]
    pub db: DbArgs,
    /// Analysis to filter.
    #[arg(long, required = true)]
    pub analysis_id: i64,
    /// Filter config to run.
    #[arg(long, required = true)]
    pub filterconfig_id: i64,
    /// Path to the output TSV file.
    #[arg(long, required = true)]
    pub path_output: String,
}

/// One line of the output file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct Record {
    allele_id: i64,
    genepanel: String,
    /// Removing filter, "." for surviving alleles.
    filtered_by: String,
}

fn records(result: &ChainResult, input: &crate::common::GpAlleleIds) -> Vec<Record> {
    let mut records = Vec::new();
    for (gp_key, allele_ids) in input {
        for allele_id in allele_ids {
            let filtered_by = result
                .excluded_by
                .get(allele_id)
                .cloned()
                .unwrap_or_else(|| String::from("."));
            records.push(Record {
                allele_id: *allele_id,
                genepanel: gp_key.to_string(),
                filtered_by,
            });
        }
    }
    records
}

/// Run the filter config and write the per-allele breakdown.
pub async fn filter(args: &Args) -> Result<ChainResult, anyhow::Error> {
    let before = Instant::now();
    let conf = args.db.config()?;
    let pool = args.db.connect().await?;

    let input = {
        let mut conn = pool.acquire().await?;
        workflow::analysis_allele_ids(&mut conn, args.analysis_id).await?
    };
    let result = workflow::filtered_alleles(&pool, &conf, args.analysis_id, args.filterconfig_id).await?;

    let path_output = shellexpand::tilde(&args.path_output);
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(path_output.as_ref())?;
    for record in records(&result, &input) {
        writer.serialize(&record)?;
    }
    writer.flush()?;

    for (name, allele_ids) in result.excluded_allele_ids() {
        tracing::info!("  {:<20} {:>10}", name, allele_ids.len().separate_with_commas());
    }
    tracing::info!(
        "{} of {} alleles remain, written to {} in {:?}",
        result.remaining_allele_ids().len().separate_with_commas(),
        crate::common::all_allele_ids(&input).len().separate_with_commas(),
        &path_output,
        before.elapsed()
    );
    Ok(result)
}

/// Main entry point for `filter` sub command.
pub fn run(args_common: &crate::common::Args, args: &Args) -> Result<(), anyhow::Error> {
    tracing::info!("args_common = {:?}", &args_common);
    tracing::info!("args = {:?}", &args);
    super::runtime()?.block_on(filter(args))?;
    Ok(())
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use temp_testdir::TempDir;

    use super::Args;
    use crate::{
        cli::DbArgs,
        conf::Config,
        db::models::{CallerType, GenotypeType, Sex},
        filterconfig::{self, NewFilterConfig},
        testing,
    };

    #[tokio::test]
    async fn writes_breakdown() -> Result<(), anyhow::Error> {
        let tmp_dir = TempDir::default();
        let db = DbArgs {
            path_db: tmp_dir.join("ella.sqlite").to_string_lossy().to_string(),
            path_config: None,
        };
        let conf = Config::default();
        let (analysis_id, filterconfig_id, snv, cnv) = {
            let pool = db.connect().await?;
            crate::db::init(&pool, &conf).await?;
            let (usergroup_id, _) = testing::user(&pool, "alice", "lab").await?;
            let gp_key = testing::genepanel(&pool, "HBOC", "v01", serde_json::json!({})).await?;
            let analysis_id = testing::analysis(&pool, "sample1", &gp_key).await?;
            let proband =
                testing::sample(&pool, analysis_id, "P", true, true, Sex::Male, Default::default()).await?;
            let snv = testing::allele(&pool, "13", 32_900_000, 1).await?;
            let cnv = testing::allele_with(&pool, "13", 32_950_000, 5_000, CallerType::Cnv).await?;
            for allele_id in [snv, cnv] {
                testing::genotype(&pool, proband, allele_id, GenotypeType::Homozygous, None, None).await?;
            }
            let new = NewFilterConfig::from_json(
                serde_json::json!({
                    "name": "CNV",
                    "filterconfig": {"filters": [{"name": "callertype", "config": {"caller_types": ["CNV"]}}]}
                }),
                &conf,
            )?;
            let filterconfig_id = filterconfig::create(&pool, usergroup_id, &new, &conf).await?;
            pool.close().await;
            (analysis_id, filterconfig_id, snv, cnv)
        };
        let path_output = tmp_dir.join("out.tsv").to_string_lossy().to_string();

        super::filter(&Args {
            db,
            analysis_id,
            filterconfig_id,
            path_output: path_output.clone(),
        })
        .await?;

        let written = std::fs::read_to_string(&path_output)?;
        assert_eq!(
            written,
            format!(
                "allele_id\tgenepanel\tfiltered_by\n{}\tHBOC_v01\t.\n{}\tHBOC_v01\tcallertype\n",
                snv, cnv
            )
        );
        Ok(())
    }
}
