//! Quality filter on the proband genotypes of an analysis.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;

use super::{parse_config, query, FilterContext, FilterKind};
use crate::{
    common::{all_allele_ids, GpAlleleIds},
    err::{Error, Result},
};

/// Predicate on the genotype filter status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterStatusConf {
    pub pattern: String,
    /// Candidate if the pattern does *not* match.
    #[serde(default)]
    pub inverse: bool,
    /// Whether a missing or `.` status is a candidate.
    #[serde(default)]
    pub filter_empty: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Candidate if `variant_quality < qual`.
    #[serde(default)]
    pub qual: Option<f64>,
    /// Candidate if `0 < allele_ratio < allele_ratio`.
    #[serde(default)]
    pub allele_ratio: Option<f64>,
    #[serde(default)]
    pub filter_status: Option<FilterStatusConf>,
}

impl Config {
    pub fn parse(value: &serde_json::Value) -> Result<Self> {
        let config: Self = parse_config(FilterKind::Quality, value)?;
        if config.qual.is_none() && config.allele_ratio.is_none() && config.filter_status.is_none() {
            return Err(Error::FilterConfiguration(String::from(
                "quality filter needs one of qual, allele_ratio, filter_status",
            )));
        }
        config.status_regex()?;
        Ok(config)
    }

    fn status_regex(&self) -> Result<Option<regex::Regex>> {
        self.filter_status
            .as_ref()
            .map(|status| {
                regex::Regex::new(&status.pattern).map_err(|e| {
                    Error::FilterConfiguration(format!(
                        "invalid filter_status pattern {:?}: {}",
                        &status.pattern, e
                    ))
                })
            })
            .transpose()
    }
}

/// Whether one proband genotype is a candidate for removal.
fn is_candidate(
    config: &Config,
    status_regex: Option<&regex::Regex>,
    genotype: &query::SampleGenotype,
) -> bool {
    if let Some(qual) = config.qual {
        match genotype.variant_quality {
            Some(value) if value < qual => (),
            _ => return false,
        }
    }
    if let Some(allele_ratio) = config.allele_ratio {
        match genotype.allele_ratio {
            Some(value) if value > 0.0 && value < allele_ratio => (),
            _ => return false,
        }
    }
    if let (Some(status), Some(regex)) = (&config.filter_status, status_regex) {
        let candidate = match genotype.filter_status.as_deref() {
            None | Some("") | Some(".") => status.filter_empty,
            Some(value) => regex.is_match(value) != status.inverse,
        };
        if !candidate {
            return false;
        }
    }
    true
}

/// Remove alleles that are candidates in every proband they occur in.
pub async fn filter(
    conn: &mut SqliteConnection,
    ctx: &FilterContext<'_>,
    gp_allele_ids: &GpAlleleIds,
    config: &Config,
) -> Result<GpAlleleIds> {
    let analysis_id = ctx.require_analysis(FilterKind::Quality)?;
    let status_regex = config.status_regex()?;
    let genotypes =
        query::sample_genotypes(&mut *conn, analysis_id, &all_allele_ids(gp_allele_ids)).await?;

    // allele id -> candidate flag per proband occurrence
    let mut verdicts: BTreeMap<i64, Vec<bool>> = BTreeMap::new();
    for genotype in genotypes.iter().filter(|g| g.proband && g.sample_id == g.proband_sample_id) {
        verdicts
            .entry(genotype.allele_id)
            .or_default()
            .push(is_candidate(config, status_regex.as_ref(), genotype));
    }

    Ok(gp_allele_ids
        .iter()
        .map(|(gp_key, allele_ids)| {
            let filtered = allele_ids
                .iter()
                .filter(|allele_id| {
                    verdicts
                        .get(*allele_id)
                        .map(|v| !v.is_empty() && v.iter().all(|c| *c))
                        .unwrap_or(false)
                })
                .copied()
                .inspect(|allele_id| tracing::trace!("allele {} fails quality filter", allele_id))
                .collect();
            (gp_key.clone(), filtered)
        })
        .collect())
}
