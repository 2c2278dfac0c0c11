//! Polypyrimidine tract filter.
//!
//! Removes pyrimidine-to-pyrimidine changes upstream of a splice acceptor
//! unless some considered transcript reports a consequence more severe than
//! `splice_region_variant`.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;

use super::{parse_config, query, FilterContext, FilterKind};
use crate::{
    common::GpAlleleIds,
    db::models::Allele,
    err::{Error, Result},
};

fn default_ppy_tract_region() -> (i64, i64) {
    (-20, -3)
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Window on `exon_distance` as `[upstream, downstream]`.
    #[serde(default = "default_ppy_tract_region")]
    pub ppy_tract_region: (i64, i64),
    #[serde(default = "default_true")]
    pub genepanel_only: bool,
}

impl Config {
    pub fn parse(value: &serde_json::Value) -> Result<Self> {
        let config: Self = parse_config(FilterKind::Ppy, value)?;
        let (lo, hi) = config.ppy_tract_region;
        if lo > hi {
            return Err(Error::FilterConfiguration(format!(
                "ppy_tract_region [{}, {}] is empty",
                lo, hi
            )));
        }
        Ok(config)
    }
}

/// Whether all bases of the change are pyrimidines when read on `strand`.
fn is_pyrimidine_change(allele: &Allele, strand: &str) -> bool {
    let pyrimidines: &[char] = match strand {
        "+" => &['C', 'T'],
        "-" => &['G', 'A'],
        _ => return false,
    };
    let bases = allele
        .change_from
        .chars()
        .chain(allele.change_to.chars())
        .collect::<Vec<_>>();
    !bases.is_empty()
        && bases
            .iter()
            .all(|base| pyrimidines.contains(&base.to_ascii_uppercase()))
}

pub async fn filter(
    conn: &mut SqliteConnection,
    ctx: &FilterContext<'_>,
    gp_allele_ids: &GpAlleleIds,
    config: &Config,
) -> Result<GpAlleleIds> {
    let threshold = ctx
        .conf
        .transcripts
        .severity("splice_region_variant")
        .ok_or_else(|| {
            Error::FilterConfiguration(String::from(
                "consequence vocabulary lacks splice_region_variant",
            ))
        })?;
    let is_severe = |consequence: &String| {
        ctx.conf
            .transcripts
            .severity(consequence)
            .map(|severity| severity < threshold)
            .unwrap_or(false)
    };

    let mut result = GpAlleleIds::new();
    for (gp_key, allele_ids) in gp_allele_ids {
        let alleles = query::alleles(&mut *conn, allele_ids)
            .await?
            .into_iter()
            .map(|allele| (allele.id, allele))
            .collect::<BTreeMap<_, _>>();
        let transcripts = query::TranscriptQuery::scoped(allele_ids, gp_key, config.genepanel_only)
            .fetch(&mut *conn)
            .await?;

        let severe = transcripts
            .iter()
            .filter(|row| row.consequences.iter().any(is_severe))
            .map(|row| row.allele_id)
            .collect::<BTreeSet<_>>();
        let (lo, hi) = config.ppy_tract_region;
        let in_tract = transcripts
            .iter()
            .filter(|row| matches!(row.exon_distance, Some(d) if d >= lo && d <= hi))
            .filter(|row| {
                match (alleles.get(&row.allele_id), row.strand.as_deref()) {
                    (Some(allele), Some(strand)) => is_pyrimidine_change(allele, strand),
                    _ => false,
                }
            })
            .map(|row| row.allele_id)
            .collect::<BTreeSet<_>>();

        let filtered = in_tract
            .difference(&severe)
            .copied()
            .inspect(|allele_id| tracing::trace!("allele {} fails ppy filter in {}", allele_id, gp_key))
            .collect();
        result.insert(gp_key.clone(), filtered);
    }
    Ok(result)
}
