//! Common functionality.

use std::collections::{BTreeMap, BTreeSet};

use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use serde::{Deserialize, Serialize};

/// Commonly used command line arguments.
#[derive(Parser, Debug)]
pub struct Args {
    /// Verbosity of the program
    #[clap(flatten)]
    pub verbose: Verbosity<InfoLevel>,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            verbose: Verbosity::new(0, 0),
        }
    }
}

/// Key of a gene panel, name and version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GpKey {
    pub name: String,
    pub version: String,
}

impl GpKey {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl std::fmt::Display for GpKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.name, self.version)
    }
}

/// Allele ids per gene panel, the currency of the filter engine.
pub type GpAlleleIds = BTreeMap<GpKey, BTreeSet<i64>>;

/// All allele ids, regardless of gene panel.
pub fn all_allele_ids(gp_allele_ids: &GpAlleleIds) -> BTreeSet<i64> {
    gp_allele_ids.values().flatten().copied().collect()
}

/// Per gene panel `lhs \ rhs`; keys of `lhs` are kept even if empty.
pub fn gp_difference(lhs: &GpAlleleIds, rhs: &GpAlleleIds) -> GpAlleleIds {
    lhs.iter()
        .map(|(key, ids)| {
            let remove = rhs.get(key);
            let ids = ids
                .iter()
                .filter(|id| !remove.map(|r| r.contains(*id)).unwrap_or(false))
                .copied()
                .collect();
            (key.clone(), ids)
        })
        .collect()
}

/// Per gene panel union of `lhs` and `rhs`.
pub fn gp_union(lhs: &GpAlleleIds, rhs: &GpAlleleIds) -> GpAlleleIds {
    let mut result = lhs.clone();
    for (key, ids) in rhs {
        result
            .entry(key.clone())
            .or_default()
            .extend(ids.iter().copied());
    }
    result
}

/// Restrict `result` to the keys and ids of `input`.
///
/// Primitives must only report ids they were given.
pub fn gp_restrict(result: GpAlleleIds, input: &GpAlleleIds) -> GpAlleleIds {
    input
        .iter()
        .map(|(key, ids)| {
            let filtered = result
                .get(key)
                .map(|r| r.intersection(ids).copied().collect())
                .unwrap_or_default();
            (key.clone(), filtered)
        })
        .collect()
}

/// Comparison operator used in size and annotation predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum Comparison {
    #[serde(rename = "<")]
    #[strum(serialize = "<")]
    Lt,
    #[serde(rename = "<=", alias = "≤")]
    #[strum(serialize = "<=")]
    Le,
    #[serde(rename = "==")]
    #[strum(serialize = "==")]
    Eq,
    #[serde(rename = ">=", alias = "≥")]
    #[strum(serialize = ">=")]
    Ge,
    #[serde(rename = ">")]
    #[strum(serialize = ">")]
    Gt,
}

impl Comparison {
    /// Evaluate `lhs <op> rhs`.
    pub fn holds<T: PartialOrd>(&self, lhs: T, rhs: T) -> bool {
        match self {
            Comparison::Lt => lhs < rhs,
            Comparison::Le => lhs <= rhs,
            Comparison::Eq => lhs == rhs,
            Comparison::Ge => lhs >= rhs,
            Comparison::Gt => lhs > rhs,
        }
    }
}

/// Strip a leading "chr" and normalize mitochondrial names.
pub fn canonicalize_chrom(chrom: &str) -> &str {
    let chrom = chrom
        .strip_prefix("chr")
        .or_else(|| chrom.strip_prefix("CHR"))
        .unwrap_or(chrom);
    match chrom {
        "M" | "m" | "mt" => "MT",
        "x" => "X",
        "y" => "Y",
        _ => chrom,
    }
}

/// Pseudo-autosomal regions on chrX as 1-based closed intervals.
const PAR_REGIONS_GRCH37: &[(i64, i64)] = &[(60_001, 2_699_520), (154_931_044, 155_260_560)];
const PAR_REGIONS_GRCH38: &[(i64, i64)] = &[(10_001, 2_781_479), (155_701_383, 156_030_895)];

/// Whether the position on `chrom` lies on X outside the pseudo-autosomal regions.
pub fn is_x_linked(genome_reference: &str, chrom: &str, pos: i64) -> bool {
    if canonicalize_chrom(chrom) != "X" {
        return false;
    }
    let regions = if genome_reference.to_ascii_lowercase().starts_with("grch38") {
        PAR_REGIONS_GRCH38
    } else {
        PAR_REGIONS_GRCH37
    };
    !regions
        .iter()
        .any(|(begin, end)| *begin <= pos && pos <= *end)
}
