//! Size filter on the allele length.

use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;

use super::{parse_config, query, FilterContext, FilterKind};
use crate::{
    common::{all_allele_ids, Comparison, GpAlleleIds},
    err::Result,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub threshold: i64,
    /// Alleles with `length <mode> threshold` are removed.
    pub mode: Comparison,
}

impl Config {
    pub fn parse(value: &serde_json::Value) -> Result<Self> {
        parse_config(FilterKind::Size, value)
    }
}

pub async fn filter(
    conn: &mut SqliteConnection,
    _ctx: &FilterContext<'_>,
    gp_allele_ids: &GpAlleleIds,
    config: &Config,
) -> Result<GpAlleleIds> {
    let alleles = query::alleles(conn, &all_allele_ids(gp_allele_ids)).await?;
    let sized = alleles
        .iter()
        .filter(|allele| config.mode.holds(allele.length, config.threshold))
        .map(|allele| {
            tracing::trace!(
                "allele {} fails size filter ({} {} {})",
                allele.id,
                allele.length,
                config.mode,
                config.threshold
            );
            allele.id
        })
        .collect::<std::collections::BTreeSet<_>>();
    Ok(gp_allele_ids
        .iter()
        .map(|(gp_key, allele_ids)| {
            (
                gp_key.clone(),
                allele_ids.intersection(&sized).copied().collect(),
            )
        })
        .collect())
}
