//! Inheritance model filter.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;

use super::{parse_config, query, FilterContext, FilterKind};
use crate::{
    common::{GpAlleleIds, GpKey},
    db::models::GenotypeType,
    err::{Error, Result},
    genepanel::{self, Inheritance},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    /// Keep alleles in genes whose inheritance is in the allowed set.
    #[default]
    Allowed,
    /// Remove single heterozygous alleles in recessive-only genes.
    RecessiveNonCandidates,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub filter_mode: FilterMode,
    #[serde(default)]
    pub inheritance: Vec<Inheritance>,
}

impl Config {
    pub fn parse(value: &serde_json::Value) -> Result<Self> {
        let config: Self = parse_config(FilterKind::InheritanceModel, value)?;
        if config.filter_mode == FilterMode::Allowed && config.inheritance.is_empty() {
            return Err(Error::FilterConfiguration(String::from(
                "inheritancemodel filter needs a non-empty inheritance list",
            )));
        }
        Ok(config)
    }
}

pub async fn filter(
    conn: &mut SqliteConnection,
    ctx: &FilterContext<'_>,
    gp_allele_ids: &GpAlleleIds,
    config: &Config,
) -> Result<GpAlleleIds> {
    let mut result = GpAlleleIds::new();
    for (gp_key, allele_ids) in gp_allele_ids {
        let inheritance = genepanel::gene_inheritance(&mut *conn, gp_key).await?;
        let panel_genes = query::allele_panel_genes(&mut *conn, gp_key, allele_ids).await?;
        let filtered = match config.filter_mode {
            FilterMode::Allowed => allele_ids
                .iter()
                .filter(|allele_id| {
                    !panel_genes
                        .get(*allele_id)
                        .into_iter()
                        .flatten()
                        .any(|hgnc_id| {
                            inheritance
                                .get(hgnc_id)
                                .copied()
                                .unwrap_or(Inheritance::NotAvailable)
                                .matches(&config.inheritance)
                        })
                })
                .copied()
                .collect(),
            FilterMode::RecessiveNonCandidates => {
                let analysis_id = ctx.require_analysis(FilterKind::InheritanceModel)?;
                recessive_non_candidates(&mut *conn, analysis_id, gp_key, allele_ids, &inheritance)
                    .await?
            }
        };
        for allele_id in &filtered {
            tracing::trace!("allele {} fails inheritancemodel filter in {}", allele_id, gp_key);
        }
        result.insert(gp_key.clone(), filtered);
    }
    Ok(result)
}

/// Alleles whose panel genes are all `AR` and carry only this one
/// heterozygous proband allele and no homozygous one.
///
/// Genotypes are counted over all proband alleles of the analysis, so the
/// outcome does not depend on what earlier filter steps removed.
async fn recessive_non_candidates(
    conn: &mut SqliteConnection,
    analysis_id: i64,
    gp_key: &GpKey,
    allele_ids: &BTreeSet<i64>,
    inheritance: &BTreeMap<i64, Inheritance>,
) -> Result<BTreeSet<i64>> {
    let mut analysis_allele_ids = query::proband_variant_allele_ids(&mut *conn, analysis_id).await?;
    analysis_allele_ids.extend(allele_ids.iter().copied());
    let panel_genes = query::allele_panel_genes(&mut *conn, gp_key, &analysis_allele_ids).await?;
    let genotypes = query::sample_genotypes(&mut *conn, analysis_id, &analysis_allele_ids).await?;

    // hgnc id -> (heterozygous alleles, homozygous alleles) of the probands
    let mut per_gene: BTreeMap<i64, (BTreeSet<i64>, BTreeSet<i64>)> = BTreeMap::new();
    for genotype in genotypes
        .iter()
        .filter(|g| g.proband && g.sample_id == g.proband_sample_id)
    {
        for hgnc_id in panel_genes.get(&genotype.allele_id).into_iter().flatten() {
            let (het, hom) = per_gene.entry(*hgnc_id).or_default();
            match genotype.gt {
                GenotypeType::Heterozygous => {
                    het.insert(genotype.allele_id);
                }
                GenotypeType::Homozygous => {
                    hom.insert(genotype.allele_id);
                }
                _ => (),
            }
        }
    }

    let non_candidate_gene = |hgnc_id: &i64| {
        inheritance.get(hgnc_id) == Some(&Inheritance::Ar)
            && per_gene
                .get(hgnc_id)
                .map(|(het, hom)| het.len() == 1 && hom.is_empty())
                .unwrap_or(false)
    };
    Ok(allele_ids
        .iter()
        .filter(|allele_id| match panel_genes.get(*allele_id) {
            Some(genes) if !genes.is_empty() => genes.iter().all(non_candidate_gene),
            _ => false,
        })
        .copied()
        .collect())
}
