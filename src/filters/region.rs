//! Region filter, removes alleles outside the splice and UTR windows of the
//! considered transcripts.

use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;

use super::{parse_config, query, FilterContext, FilterKind};
use crate::{
    common::GpAlleleIds,
    conf,
    err::{Error, Result},
};

fn default_consequences() -> Vec<String> {
    [
        "splice_acceptor_variant",
        "splice_donor_variant",
        "splice_region_variant",
        "splice_donor_5th_base_variant",
        "splice_donor_region_variant",
        "splice_polypyrimidine_tract_variant",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_splice_region() -> (i64, i64) {
    (-20, 6)
}

fn default_utr_region() -> (i64, i64) {
    (-20, 20)
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Consequences that put a transcript in region regardless of distance.
    #[serde(default = "default_consequences")]
    pub consequences: Vec<String>,
    /// Window on `exon_distance` as `[upstream, downstream]`.
    #[serde(default = "default_splice_region")]
    pub splice_region: (i64, i64),
    /// Window on `coding_region_distance` as `[upstream, downstream]`.
    #[serde(default = "default_utr_region")]
    pub utr_region: (i64, i64),
    #[serde(default = "default_true")]
    pub genepanel_only: bool,
    #[serde(default)]
    pub transcript_inclusion_regex: Option<String>,
}

impl Config {
    pub fn parse(value: &serde_json::Value, conf: &conf::Config) -> Result<Self> {
        let config: Self = parse_config(FilterKind::Region, value)?;
        conf.transcripts.check_vocabulary(&config.consequences)?;
        for (label, (lo, hi)) in [
            ("splice_region", config.splice_region),
            ("utr_region", config.utr_region),
        ] {
            if lo > hi {
                return Err(Error::FilterConfiguration(format!(
                    "region {} [{}, {}] is empty",
                    label, lo, hi
                )));
            }
        }
        query::transcript_regex(config.transcript_inclusion_regex.as_deref())?;
        Ok(config)
    }
}

/// Remove alleles without any considered transcript in region.
pub async fn filter(
    conn: &mut SqliteConnection,
    _ctx: &FilterContext<'_>,
    gp_allele_ids: &GpAlleleIds,
    config: &Config,
) -> Result<GpAlleleIds> {
    let regex = query::transcript_regex(config.transcript_inclusion_regex.as_deref())?;
    let mut result = GpAlleleIds::new();
    for (gp_key, allele_ids) in gp_allele_ids {
        let in_region = query::TranscriptQuery::scoped(allele_ids, gp_key, config.genepanel_only)
            .in_region(&config.consequences, config.splice_region, config.utr_region)
            .transcript_matches(regex.clone())
            .fetch_allele_ids(&mut *conn)
            .await?;
        let filtered = allele_ids
            .iter()
            .filter(|allele_id| !in_region.contains(*allele_id))
            .copied()
            .inspect(|allele_id| {
                tracing::trace!("allele {} fails region filter in {}", allele_id, gp_key)
            })
            .collect();
        result.insert(gp_key.clone(), filtered);
    }
    Ok(result)
}
