//! Segregation filter for family analyses.
//!
//! An allele is kept if its genotypes across the proband, the parents and the
//! unaffected siblings fit one of the enabled inheritance patterns.  Probands
//! without any parent in the analysis are not evaluated.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;

use super::{parse_config, query, FilterContext, FilterKind};
use crate::{
    common::{all_allele_ids, is_x_linked, GpAlleleIds},
    db::models::{Allele, GenotypeType, Sample, Sex},
    err::{Error, Result},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModeConf {
    #[serde(default)]
    pub enable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub denovo: ModeConf,
    pub recessive_homozygous: ModeConf,
    #[serde(alias = "recessive_compound_heterozygous")]
    pub compound_heterozygous: ModeConf,
    pub xlinked_recessive: ModeConf,
    pub autosomal_dominant: ModeConf,
    pub no_coverage_parents: ModeConf,
}

impl Config {
    pub fn parse(value: &serde_json::Value) -> Result<Self> {
        let config: Self = parse_config(FilterKind::Segregation, value)?;
        let enabled = [
            config.denovo,
            config.recessive_homozygous,
            config.compound_heterozygous,
            config.xlinked_recessive,
            config.autosomal_dominant,
            config.no_coverage_parents,
        ];
        if !enabled.iter().any(|mode| mode.enable) {
            return Err(Error::FilterConfiguration(String::from(
                "segregation filter needs at least one enabled mode",
            )));
        }
        Ok(config)
    }
}

/// A proband with the relatives present in the analysis.
#[derive(Debug, Clone)]
struct Family {
    proband: Sample,
    father: Option<Sample>,
    mother: Option<Sample>,
    siblings: Vec<Sample>,
}

impl Family {
    fn parents(&self) -> impl Iterator<Item = &Sample> {
        self.father.iter().chain(self.mother.iter())
    }

    fn unaffected_siblings(&self) -> impl Iterator<Item = &Sample> {
        self.siblings.iter().filter(|sibling| !sibling.affected)
    }
}

async fn load_families(conn: &mut SqliteConnection, analysis_id: i64) -> Result<Vec<Family>> {
    let samples: Vec<Sample> = sqlx::query_as(
        "SELECT id, identifier, analysis_id, proband, affected, sex, family_id, father_id, \
         mother_id, sibling_id FROM sample WHERE analysis_id = ?",
    )
    .bind(analysis_id)
    .fetch_all(conn)
    .await?;
    let by_id = |id: Option<i64>| id.and_then(|id| samples.iter().find(|s| s.id == id).cloned());
    Ok(samples
        .iter()
        .filter(|sample| sample.proband)
        .map(|proband| Family {
            proband: proband.clone(),
            father: by_id(proband.father_id),
            mother: by_id(proband.mother_id),
            siblings: samples
                .iter()
                .filter(|s| !s.proband && s.sibling_id == Some(proband.id))
                .cloned()
                .collect(),
        })
        .collect())
}

/// Genotypes of one family at one allele, by sample id.
struct AlleleView<'a> {
    family: &'a Family,
    genotypes: &'a BTreeMap<i64, GenotypeType>,
    x_linked: bool,
}

impl<'a> AlleleView<'a> {
    fn gt(&self, sample: &Sample) -> Option<GenotypeType> {
        self.genotypes.get(&sample.id).copied()
    }

    fn carries(&self, sample: &Sample) -> bool {
        self.gt(sample).map(|gt| gt.is_variant()).unwrap_or(false)
    }

    fn is(&self, sample: Option<&Sample>, gt: GenotypeType) -> bool {
        sample.and_then(|sample| self.gt(sample)) == Some(gt)
    }

    fn proband(&self) -> &Sample {
        &self.family.proband
    }

    fn denovo(&self) -> bool {
        self.carries(self.proband())
            && self.is(self.family.father.as_ref(), GenotypeType::Reference)
            && self.is(self.family.mother.as_ref(), GenotypeType::Reference)
            && self.family.unaffected_siblings().all(|s| !self.carries(s))
    }

    fn recessive_homozygous(&self) -> bool {
        self.gt(self.proband()) == Some(GenotypeType::Homozygous)
            && self
                .family
                .parents()
                .all(|parent| self.gt(parent) == Some(GenotypeType::Heterozygous))
            && self
                .family
                .unaffected_siblings()
                .all(|s| self.gt(s) != Some(GenotypeType::Homozygous))
    }

    fn xlinked_recessive(&self) -> bool {
        self.x_linked
            && self.proband().sex == Some(Sex::Male)
            && self.carries(self.proband())
            && self.is(self.family.mother.as_ref(), GenotypeType::Heterozygous)
            && !self.family.father.iter().any(|father| self.carries(father))
            && self
                .family
                .unaffected_siblings()
                .filter(|s| s.sex == Some(Sex::Male))
                .all(|s| !self.carries(s))
    }

    fn autosomal_dominant(&self) -> bool {
        self.carries(self.proband())
            && self
                .family
                .parents()
                .any(|parent| parent.affected && self.carries(parent))
            && self
                .family
                .parents()
                .filter(|parent| !parent.affected)
                .all(|parent| self.gt(parent) == Some(GenotypeType::Reference))
            && self.family.unaffected_siblings().all(|s| !self.carries(s))
    }

    fn no_coverage_parents(&self) -> bool {
        self.carries(self.proband())
            && self.family.parents().all(|parent| {
                matches!(self.gt(parent), None | Some(GenotypeType::NoCoverage))
            })
    }

    /// Parent the allele was inherited from, if exactly one parent carries it.
    fn inherited_from(&self) -> Option<Sex> {
        let (father, mother) = (self.family.father.as_ref()?, self.family.mother.as_ref()?);
        if self.gt(self.proband()) != Some(GenotypeType::Heterozygous) {
            return None;
        }
        match (self.gt(father), self.gt(mother)) {
            (Some(f), Some(GenotypeType::Reference)) if f.is_variant() => Some(Sex::Male),
            (Some(GenotypeType::Reference), Some(m)) if m.is_variant() => Some(Sex::Female),
            _ => None,
        }
    }

    fn matches(&self, config: &Config) -> bool {
        (config.denovo.enable && self.denovo())
            || (config.recessive_homozygous.enable && self.recessive_homozygous())
            || (config.xlinked_recessive.enable && self.xlinked_recessive())
            || (config.autosomal_dominant.enable && self.autosomal_dominant())
            || (config.no_coverage_parents.enable && self.no_coverage_parents())
    }
}

/// Alleles of one family that form a compound heterozygous pair in some gene.
fn compound_heterozygous(
    views: &BTreeMap<i64, AlleleView<'_>>,
    allele_genes: &BTreeMap<i64, BTreeSet<i64>>,
) -> BTreeSet<i64> {
    let mut per_gene: BTreeMap<i64, (BTreeSet<i64>, BTreeSet<i64>)> = BTreeMap::new();
    for (allele_id, view) in views {
        let Some(parent) = view.inherited_from() else {
            continue;
        };
        for hgnc_id in allele_genes.get(allele_id).into_iter().flatten() {
            let (paternal, maternal) = per_gene.entry(*hgnc_id).or_default();
            match parent {
                Sex::Male => paternal.insert(*allele_id),
                Sex::Female => maternal.insert(*allele_id),
            };
        }
    }
    per_gene
        .into_values()
        .filter(|(paternal, maternal)| !paternal.is_empty() && !maternal.is_empty())
        .flat_map(|(paternal, maternal)| paternal.into_iter().chain(maternal))
        .collect()
}

/// HGNC ids of the genes each allele overlaps.
async fn allele_genes(
    conn: &mut SqliteConnection,
    allele_ids: &BTreeSet<i64>,
) -> Result<BTreeMap<i64, BTreeSet<i64>>> {
    let mut result: BTreeMap<i64, BTreeSet<i64>> = BTreeMap::new();
    for row in query::TranscriptQuery::new(allele_ids).fetch(conn).await? {
        if let Some(hgnc_id) = row.hgnc_id {
            result.entry(row.allele_id).or_default().insert(hgnc_id);
        }
    }
    Ok(result)
}

pub async fn filter(
    conn: &mut SqliteConnection,
    ctx: &FilterContext<'_>,
    gp_allele_ids: &GpAlleleIds,
    config: &Config,
) -> Result<GpAlleleIds> {
    let analysis_id = ctx.require_analysis(FilterKind::Segregation)?;
    let families = load_families(&mut *conn, analysis_id)
        .await?
        .into_iter()
        .filter(|family| family.parents().next().is_some())
        .collect::<Vec<_>>();
    if families.is_empty() {
        tracing::debug!("analysis {} has no parents, segregation not applicable", analysis_id);
        return Ok(gp_allele_ids
            .keys()
            .map(|gp_key| (gp_key.clone(), BTreeSet::new()))
            .collect());
    }

    let allele_ids = all_allele_ids(gp_allele_ids);
    let alleles = query::alleles(&mut *conn, &allele_ids)
        .await?
        .into_iter()
        .map(|allele| (allele.id, allele))
        .collect::<BTreeMap<i64, Allele>>();
    let genotypes = query::sample_genotypes(&mut *conn, analysis_id, &allele_ids).await?;
    let allele_genes = if config.compound_heterozygous.enable {
        allele_genes(&mut *conn, &allele_ids).await?
    } else {
        BTreeMap::new()
    };

    let mut seen = BTreeSet::new();
    let mut admitted = BTreeSet::new();
    for family in &families {
        let mut per_allele: BTreeMap<i64, BTreeMap<i64, GenotypeType>> = BTreeMap::new();
        for genotype in genotypes
            .iter()
            .filter(|g| g.proband_sample_id == family.proband.id)
        {
            per_allele
                .entry(genotype.allele_id)
                .or_default()
                .insert(genotype.sample_id, genotype.gt);
        }
        per_allele.retain(|_, genotypes| genotypes.contains_key(&family.proband.id));

        let views = per_allele
            .iter()
            .map(|(allele_id, genotypes)| {
                let x_linked = alleles
                    .get(allele_id)
                    .map(|a| is_x_linked(&a.genome_reference, &a.chromosome, a.start_position + 1))
                    .unwrap_or(false);
                let view = AlleleView {
                    family,
                    genotypes,
                    x_linked,
                };
                (*allele_id, view)
            })
            .collect::<BTreeMap<_, _>>();

        seen.extend(views.keys().copied());
        admitted.extend(
            views
                .iter()
                .filter(|(_, view)| view.matches(config))
                .map(|(allele_id, _)| *allele_id),
        );
        if config.compound_heterozygous.enable {
            admitted.extend(compound_heterozygous(&views, &allele_genes));
        }
    }

    Ok(gp_allele_ids
        .iter()
        .map(|(gp_key, allele_ids)| {
            let filtered = allele_ids
                .iter()
                .filter(|allele_id| seen.contains(*allele_id) && !admitted.contains(*allele_id))
                .copied()
                .inspect(|allele_id| {
                    tracing::trace!("allele {} fails segregation filter", allele_id)
                })
                .collect();
            (gp_key.clone(), filtered)
        })
        .collect())
}
