//! Caller type filter.

use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;

use super::{parse_config, query, FilterContext, FilterKind};
use crate::{
    common::{all_allele_ids, GpAlleleIds},
    db::models::CallerType,
    err::{Error, Result},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub caller_types: Vec<CallerType>,
}

impl Config {
    pub fn parse(value: &serde_json::Value) -> Result<Self> {
        let config: Self = parse_config(FilterKind::CallerType, value)?;
        if config.caller_types.is_empty() {
            return Err(Error::FilterConfiguration(String::from(
                "callertype filter needs at least one caller type",
            )));
        }
        Ok(config)
    }
}

pub async fn filter(
    conn: &mut SqliteConnection,
    _ctx: &FilterContext<'_>,
    gp_allele_ids: &GpAlleleIds,
    config: &Config,
) -> Result<GpAlleleIds> {
    let alleles = query::alleles(conn, &all_allele_ids(gp_allele_ids)).await?;
    let matching = alleles
        .iter()
        .filter(|allele| config.caller_types.contains(&allele.caller_type))
        .map(|allele| allele.id)
        .collect::<std::collections::BTreeSet<_>>();
    Ok(gp_allele_ids
        .iter()
        .map(|(gp_key, allele_ids)| {
            let filtered = allele_ids
                .intersection(&matching)
                .copied()
                .inspect(|allele_id| {
                    tracing::trace!("allele {} fails callertype filter", allele_id)
                })
                .collect();
            (gp_key.clone(), filtered)
        })
        .collect())
}
