//! Frequency filter, removes alleles that are common in the declared
//! population databases.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use super::{parse_config, query, FilterContext, FilterKind};
use crate::{
    common::GpAlleleIds,
    conf::{self, FrequencyGroups},
    err::{Error, Result},
    genepanel::{ConfigResolver, FreqCutoffs},
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    groups: Option<FrequencyGroups>,
    /// `{bucket: {group: threshold}}` with bucket `AD` or `default`.
    #[serde(default)]
    thresholds: Option<serde_json::Value>,
    #[serde(default)]
    num_thresholds: Option<IndexMap<String, IndexMap<String, i64>>>,
    #[serde(default)]
    exclude_filtered_frequencies: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub groups: FrequencyGroups,
    pub thresholds: Option<serde_json::Value>,
    pub num_thresholds: IndexMap<String, IndexMap<String, i64>>,
    /// Ignore shadow rows whose filter status lacks `PASS`.
    pub exclude_filtered_frequencies: bool,
}

impl Config {
    pub fn parse(value: &serde_json::Value, conf: &conf::Config) -> Result<Self> {
        let raw: RawConfig = parse_config(FilterKind::Frequency, value)?;
        let groups = raw.groups.unwrap_or_else(|| conf.frequencies.groups.clone());
        let declared = conf
            .frequencies
            .groups
            .triples()
            .into_iter()
            .map(|(_, provider, population)| (provider, population))
            .collect::<BTreeSet<_>>();
        for (_, provider, population) in groups.triples() {
            if !declared.contains(&(provider, population)) {
                return Err(Error::FilterConfiguration(format!(
                    "frequency {}.{} is not declared in the shadow",
                    provider, population
                )));
            }
        }
        if let Some(thresholds) = &raw.thresholds {
            // validates the layout
            ConfigResolver::new(
                &serde_json::json!({}),
                Some(thresholds),
                &serde_json::json!({}),
                Default::default(),
            )?;
        }
        Ok(Self {
            groups,
            thresholds: raw.thresholds,
            num_thresholds: raw
                .num_thresholds
                .unwrap_or_else(|| conf.frequencies.num_thresholds.clone()),
            exclude_filtered_frequencies: raw.exclude_filtered_frequencies,
        })
    }
}

/// Index of `cutoffs` in `cutoff_sets`, appended if new.
fn index_of(cutoffs: FreqCutoffs, cutoff_sets: &mut Vec<(FreqCutoffs, BTreeSet<i64>)>) -> usize {
    match cutoff_sets.iter().position(|(c, _)| *c == cutoffs) {
        Some(idx) => idx,
        None => {
            cutoff_sets.push((cutoffs, BTreeSet::new()));
            cutoff_sets.len() - 1
        }
    }
}

/// Alleles among `allele_ids` that are common under `cutoffs`.
async fn common_alleles(
    conn: &mut SqliteConnection,
    config: &Config,
    cutoffs: &FreqCutoffs,
    allele_ids: &BTreeSet<i64>,
) -> Result<BTreeSet<i64>> {
    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
        "SELECT DISTINCT f.allele_id FROM annotationshadowfrequency AS f \
         WHERE f.allele_id IN (SELECT value FROM json_each(",
    );
    builder.push_bind(query::ids_json(allele_ids));
    builder.push(")) AND (0");
    for (group, provider, population) in config.groups.triples() {
        builder.push(" OR (f.provider = ");
        builder.push_bind(provider.to_string());
        builder.push(" AND f.population = ");
        builder.push_bind(population.to_string());
        builder.push(" AND f.freq >= ");
        builder.push_bind(cutoffs.get(group).hi_freq_cutoff);
        let num_threshold = config
            .num_thresholds
            .get(provider)
            .and_then(|populations| populations.get(population));
        if let Some(num_threshold) = num_threshold {
            builder.push(" AND f.num >= ");
            builder.push_bind(*num_threshold);
        }
        builder.push(")");
    }
    builder.push(")");
    if config.exclude_filtered_frequencies {
        builder.push(
            " AND (f.filter_status IS NULL OR 'PASS' IN (SELECT value FROM json_each(\
             CASE WHEN json_valid(f.filter_status) THEN f.filter_status \
             ELSE json_array(f.filter_status) END)))",
        );
    }
    let rows: Vec<(i64,)> = builder.build_query_as().fetch_all(conn).await?;
    Ok(rows.into_iter().map(|(allele_id,)| allele_id).collect())
}

/// An allele is removed if it is common under the cutoffs of every panel gene
/// it overlaps; alleles outside panel genes use the panel-level cutoffs.
pub async fn filter(
    conn: &mut SqliteConnection,
    ctx: &FilterContext<'_>,
    gp_allele_ids: &GpAlleleIds,
    config: &Config,
) -> Result<GpAlleleIds> {
    let mut result = GpAlleleIds::new();
    for (gp_key, allele_ids) in gp_allele_ids {
        let resolver = ConfigResolver::load(
            &mut *conn,
            gp_key,
            &ctx.conf.genepanel.defaults,
            config.thresholds.as_ref(),
        )
        .await?;
        let genes = query::allele_panel_genes(&mut *conn, gp_key, allele_ids).await?;

        // distinct cutoffs and the common alleles under each of them
        let mut cutoff_sets: Vec<(FreqCutoffs, BTreeSet<i64>)> = Vec::new();
        let mut allele_cutoffs: Vec<(i64, Vec<usize>)> = Vec::new();
        for allele_id in allele_ids {
            let indices = match genes.get(allele_id) {
                Some(hgnc_ids) if !hgnc_ids.is_empty() => hgnc_ids
                    .iter()
                    .map(|hgnc_id| {
                        resolver
                            .freq_cutoffs(Some(*hgnc_id))
                            .map(|cutoffs| index_of(cutoffs, &mut cutoff_sets))
                    })
                    .collect::<Result<Vec<_>>>()?,
                _ => vec![index_of(resolver.freq_cutoffs(None)?, &mut cutoff_sets)],
            };
            allele_cutoffs.push((*allele_id, indices));
        }
        for (cutoffs, common) in cutoff_sets.iter_mut() {
            *common = common_alleles(&mut *conn, config, cutoffs, allele_ids).await?;
        }

        let filtered = allele_cutoffs
            .into_iter()
            .filter(|(allele_id, indices)| {
                let is_common = indices
                    .iter()
                    .all(|idx| cutoff_sets[*idx].1.contains(allele_id));
                if is_common {
                    tracing::trace!(
                        "allele {} fails frequency filter in {}",
                        allele_id,
                        gp_key
                    );
                }
                is_common
            })
            .map(|(allele_id, _)| allele_id)
            .collect();
        result.insert(gp_key.clone(), filtered);
    }
    Ok(result)
}
