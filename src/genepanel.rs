//! Gene panel lookup, consensus inheritance and the configuration resolver.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::SqliteConnection;

use crate::{
    common::GpKey,
    conf::FrequencyGroup,
    db::models::Genepanel,
    err::{Error, Result},
};

/// Consensus mode of inheritance of a gene within a panel.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
pub enum Inheritance {
    #[serde(rename = "AD")]
    #[strum(serialize = "AD")]
    Ad,
    #[serde(rename = "AR")]
    #[strum(serialize = "AR")]
    Ar,
    #[serde(rename = "XD")]
    #[strum(serialize = "XD")]
    Xd,
    #[serde(rename = "XR")]
    #[strum(serialize = "XR")]
    Xr,
    /// Phenotypes disagree.
    #[serde(rename = "AD/AR")]
    #[strum(serialize = "AD/AR")]
    AdAr,
    /// No phenotype with a recognised inheritance.
    #[serde(rename = "N/A")]
    #[strum(serialize = "N/A")]
    NotAvailable,
}

impl Inheritance {
    /// Consensus over the inheritance values of a gene's phenotypes.
    ///
    /// A phenotype value may list several modes separated by `,` or `/`.
    pub fn consensus<'a>(values: impl IntoIterator<Item = &'a str>) -> Self {
        let modes = values
            .into_iter()
            .flat_map(|value| value.split([',', '/']))
            .filter_map(|token| match token.trim() {
                "AD" => Some(Inheritance::Ad),
                "AR" => Some(Inheritance::Ar),
                "XD" => Some(Inheritance::Xd),
                "XR" => Some(Inheritance::Xr),
                _ => None,
            })
            .collect::<BTreeSet<_>>();
        let mut modes = modes.into_iter();
        match (modes.next(), modes.next()) {
            (None, _) => Inheritance::NotAvailable,
            (Some(mode), None) => mode,
            (Some(_), Some(_)) => Inheritance::AdAr,
        }
    }

    /// Whether this inheritance satisfies a filter's allowed set.
    ///
    /// `AD/AR` matches any non-empty set, `N/A` matches nothing.
    pub fn matches(&self, allowed: &[Inheritance]) -> bool {
        match self {
            Inheritance::NotAvailable => false,
            Inheritance::AdAr => !allowed.is_empty(),
            _ => allowed.contains(self),
        }
    }
}

/// Load the panel `key`.
pub async fn load(conn: &mut SqliteConnection, key: &GpKey) -> Result<Genepanel> {
    sqlx::query_as::<_, Genepanel>("SELECT * FROM genepanel WHERE name = ? AND version = ?")
        .bind(&key.name)
        .bind(&key.version)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| Error::not_found("genepanel", key))
}

/// Consensus inheritance for every gene with a transcript in the panel.
pub async fn gene_inheritance(
    conn: &mut SqliteConnection,
    key: &GpKey,
) -> Result<BTreeMap<i64, Inheritance>> {
    let rows: Vec<(i64, Option<String>)> = sqlx::query_as(
        r#"
        SELECT DISTINCT t.gene_id, p.inheritance
        FROM genepanel_transcript AS gt
        JOIN transcript AS t ON t.id = gt.transcript_id
        LEFT JOIN genepanel_phenotype AS gp
            ON gp.genepanel_name = gt.genepanel_name
           AND gp.genepanel_version = gt.genepanel_version
        LEFT JOIN phenotype AS p
            ON p.id = gp.phenotype_id AND p.gene_id = t.gene_id
        WHERE gt.genepanel_name = ? AND gt.genepanel_version = ?
        "#,
    )
    .bind(&key.name)
    .bind(&key.version)
    .fetch_all(conn)
    .await?;

    let mut per_gene: BTreeMap<i64, Vec<String>> = BTreeMap::new();
    for (gene_id, inheritance) in rows {
        let entry = per_gene.entry(gene_id).or_default();
        if let Some(inheritance) = inheritance {
            entry.push(inheritance);
        }
    }
    Ok(per_gene
        .into_iter()
        .map(|(gene_id, values)| {
            let consensus = Inheritance::consensus(values.iter().map(|s| s.as_str()));
            (gene_id, consensus)
        })
        .collect())
}

/// HGNC id of the panel gene with the given symbol.
pub async fn hgnc_id_for_symbol(
    conn: &mut SqliteConnection,
    key: &GpKey,
    symbol: &str,
) -> Result<i64> {
    sqlx::query_scalar(
        r#"
        SELECT DISTINCT g.hgnc_id
        FROM gene AS g
        JOIN transcript AS t ON t.gene_id = g.hgnc_id
        JOIN genepanel_transcript AS gt ON gt.transcript_id = t.id
        WHERE g.hgnc_symbol = ? AND gt.genepanel_name = ? AND gt.genepanel_version = ?
        "#,
    )
    .bind(symbol)
    .bind(&key.name)
    .bind(&key.version)
    .fetch_optional(conn)
    .await?
    .ok_or_else(|| Error::not_found("gene", format!("{} in {}", symbol, key)))
}

/// Recursively merge `overlay` into `base`; non-object values replace.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                deep_merge(base.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Frequency cutoffs of one group.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cutoff {
    pub hi_freq_cutoff: f64,
    #[serde(default = "Cutoff::default_lo")]
    pub lo_freq_cutoff: f64,
}

impl Cutoff {
    fn default_lo() -> f64 {
        1.0
    }
}

/// Cutoffs effective for one gene.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FreqCutoffs {
    pub external: Cutoff,
    pub internal: Cutoff,
}

impl FreqCutoffs {
    pub fn get(&self, group: FrequencyGroup) -> &Cutoff {
        match group {
            FrequencyGroup::External => &self.external,
            FrequencyGroup::Internal => &self.internal,
        }
    }
}

/// Resolves per-gene configuration of one panel.
///
/// Layers, lowest precedence first: global defaults, frequency filter
/// thresholds, panel `data`, panel `genes[hgnc_id]`.
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    base: Value,
    genes: Map<String, Value>,
    inheritance: BTreeMap<i64, Inheritance>,
}

impl ConfigResolver {
    pub fn new(
        defaults: &Value,
        filter_thresholds: Option<&Value>,
        panel_config: &Value,
        inheritance: BTreeMap<i64, Inheritance>,
    ) -> Result<Self> {
        let mut base = defaults.clone();
        if let Some(thresholds) = filter_thresholds {
            deep_merge(&mut base, &thresholds_as_cutoff_groups(thresholds)?);
        }
        if let Some(data) = panel_config.get("data") {
            deep_merge(&mut base, data);
        }
        let genes = match panel_config.get("genes") {
            Some(Value::Object(genes)) => genes.clone(),
            None | Some(Value::Null) => Map::new(),
            Some(other) => {
                return Err(Error::Validation(format!(
                    "genepanel config 'genes' must be an object, got {}",
                    other
                )))
            }
        };
        Ok(Self {
            base,
            genes,
            inheritance,
        })
    }

    /// Build the resolver of panel `key` from the database.
    pub async fn load(
        conn: &mut SqliteConnection,
        key: &GpKey,
        defaults: &Value,
        filter_thresholds: Option<&Value>,
    ) -> Result<Self> {
        let panel = load(&mut *conn, key).await?;
        let inheritance = gene_inheritance(&mut *conn, key).await?;
        Self::new(defaults, filter_thresholds, &panel.config.0, inheritance)
    }

    /// Consensus inheritance of a gene, `N/A` for genes outside the panel.
    pub fn inheritance(&self, hgnc_id: i64) -> Inheritance {
        self.inheritance
            .get(&hgnc_id)
            .copied()
            .unwrap_or(Inheritance::NotAvailable)
    }

    /// Effective configuration of a gene, or of the panel if `hgnc_id` is `None`.
    pub fn resolve(&self, hgnc_id: Option<i64>) -> Value {
        let mut result = self.base.clone();
        let gene = hgnc_id.and_then(|hgnc_id| self.genes.get(&hgnc_id.to_string()));
        if let Some(Value::Object(gene)) = gene {
            let mut gene = gene.clone();
            let cutoffs = gene.remove("freq_cutoffs");
            deep_merge(&mut result, &Value::Object(gene));
            if let (Some(Value::Object(cutoffs)), Value::Object(result)) = (cutoffs, &mut result) {
                let slot = result
                    .entry("freq_cutoffs")
                    .or_insert_with(|| Value::Object(Map::new()));
                if !slot.is_object() {
                    *slot = Value::Object(Map::new());
                }
                if let Value::Object(slot) = slot {
                    for (group, value) in cutoffs {
                        slot.insert(group, value);
                    }
                }
            }
        }
        result
    }

    /// Frequency cutoffs of a gene.
    ///
    /// AD genes use the `AD` bucket of `freq_cutoff_groups`, all others the
    /// `default` bucket; a gene-level `freq_cutoffs` replaces single groups.
    pub fn freq_cutoffs(&self, hgnc_id: Option<i64>) -> Result<FreqCutoffs> {
        let resolved = self.resolve(hgnc_id);
        let bucket = match hgnc_id.map(|hgnc_id| self.inheritance(hgnc_id)) {
            Some(Inheritance::Ad) => "AD",
            _ => "default",
        };
        let mut groups = match resolved.pointer(&format!("/freq_cutoff_groups/{}", bucket)) {
            Some(Value::Object(groups)) => groups.clone(),
            _ => {
                return Err(Error::FilterConfiguration(format!(
                    "no freq_cutoff_groups.{} configured",
                    bucket
                )))
            }
        };
        if let Some(Value::Object(overrides)) = resolved.get("freq_cutoffs") {
            for (group, value) in overrides {
                groups.insert(group.clone(), value.clone());
            }
        }
        serde_json::from_value(Value::Object(groups)).map_err(|e| {
            Error::FilterConfiguration(format!("invalid frequency cutoffs for {:?}: {}", hgnc_id, e))
        })
    }
}

/// Turn frequency filter `thresholds` (`{bucket: {group: number}}`) into the
/// `freq_cutoff_groups` layout.
fn thresholds_as_cutoff_groups(thresholds: &Value) -> Result<Value> {
    let buckets = thresholds.as_object().ok_or_else(|| {
        Error::FilterConfiguration(String::from("frequency thresholds must be an object"))
    })?;
    let mut result = Map::new();
    for (bucket, groups) in buckets {
        let groups = groups.as_object().ok_or_else(|| {
            Error::FilterConfiguration(format!("frequency thresholds.{} must be an object", bucket))
        })?;
        let mut converted = Map::new();
        for (group, threshold) in groups {
            let threshold = threshold.as_f64().ok_or_else(|| {
                Error::FilterConfiguration(format!(
                    "frequency thresholds.{}.{} must be a number",
                    bucket, group
                ))
            })?;
            converted.insert(
                group.clone(),
                serde_json::json!({ "hi_freq_cutoff": threshold }),
            );
        }
        result.insert(bucket.clone(), Value::Object(converted));
    }
    Ok(serde_json::json!({ "freq_cutoff_groups": result }))
}
