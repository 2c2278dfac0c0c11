//! Rust-side projection of an annotation blob into shadow rows.
//!
//! The database trigger is the authoritative projection; this code mirrors it
//! so that stored shadow rows can be verified against their blob.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Projected transcript row.
#[derive(Debug, Clone, PartialEq, PartialOrd, Serialize, Deserialize, sqlx::FromRow)]
pub struct TranscriptShadow {
    pub hgnc_id: Option<i64>,
    pub symbol: Option<String>,
    pub transcript: String,
    pub transcript_base: String,
    pub hgvsc: Option<String>,
    pub hgvsp: Option<String>,
    #[sqlx(json)]
    pub consequences: Vec<String>,
    pub exon_distance: Option<i64>,
    pub coding_region_distance: Option<i64>,
    pub in_last_exon: bool,
    pub is_canonical: bool,
}

/// Projected frequency row.
#[derive(Debug, Clone, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct FrequencyShadow {
    pub provider: String,
    pub population: String,
    pub freq: Option<f64>,
    pub count: Option<i64>,
    pub num: Option<i64>,
    pub hom: Option<i64>,
    pub hemi: Option<i64>,
    pub filter_status: Vec<String>,
}

/// Projected external database row.
#[derive(Debug, Clone, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct ExternalShadow {
    pub source: String,
    pub significance: Vec<String>,
    pub num_stars: Option<i64>,
}

/// All shadow rows of one annotation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Projection {
    pub transcripts: Vec<TranscriptShadow>,
    pub frequencies: Vec<FrequencyShadow>,
    pub external: Vec<ExternalShadow>,
}

impl Projection {
    /// Sort all rows so projections compare independent of row order.
    pub fn normalized(mut self) -> Self {
        self.transcripts
            .sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        self.frequencies
            .sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        self.external
            .sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        self
    }
}

/// Strip the version suffix of a transcript name.
pub fn transcript_base(transcript: &str) -> &str {
    transcript
        .split_once('.')
        .map(|(base, _)| base)
        .unwrap_or(transcript)
}

/// Interpret a filter status column, stored as JSON array or bare string.
pub fn parse_filter_status(raw: Option<&str>) -> Vec<String> {
    match raw {
        None => Vec::new(),
        Some(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(value) => string_list(&value),
            Err(_) => vec![raw.to_string()],
        },
    }
}

fn string_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(values) => values
            .iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect(),
        Value::String(s) => vec![s.clone()],
        _ => Vec::new(),
    }
}

fn is_one(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64() == Some(1.0),
        _ => false,
    }
}

fn is_yes(value: Option<&Value>) -> bool {
    matches!(value, Some(Value::String(s)) if s == "yes") || is_one(value)
}

fn lookup<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut current = value;
    for key in path {
        current = current.get(key)?;
    }
    if current.is_null() {
        None
    } else {
        Some(current)
    }
}

/// Project `annotations` given the declared `(provider, population)` pairs.
pub fn project(annotations: &Value, declarations: &[(String, String)]) -> Projection {
    let transcripts = annotations
        .get("transcripts")
        .and_then(|t| t.as_array())
        .map(|transcripts| {
            transcripts
                .iter()
                .filter_map(|tx| {
                    let name = tx.get("transcript")?.as_str()?;
                    Some(TranscriptShadow {
                        hgnc_id: tx.get("hgnc_id").and_then(|v| v.as_i64()),
                        symbol: tx.get("symbol").and_then(|v| v.as_str()).map(String::from),
                        transcript: name.to_string(),
                        transcript_base: transcript_base(name).to_string(),
                        hgvsc: tx.get("HGVSc").and_then(|v| v.as_str()).map(String::from),
                        hgvsp: tx.get("HGVSp").and_then(|v| v.as_str()).map(String::from),
                        consequences: tx
                            .get("consequences")
                            .map(string_list)
                            .unwrap_or_default(),
                        exon_distance: tx.get("exon_distance").and_then(|v| v.as_i64()),
                        coding_region_distance: tx
                            .get("coding_region_distance")
                            .and_then(|v| v.as_i64()),
                        in_last_exon: is_yes(tx.get("in_last_exon")),
                        is_canonical: is_one(tx.get("is_canonical")),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let frequencies = declarations
        .iter()
        .filter_map(|(provider, population)| {
            let field = |name: &str| lookup(annotations, &["frequencies", provider, name, population]);
            let freq = field("freq")?.as_f64();
            Some(FrequencyShadow {
                provider: provider.clone(),
                population: population.clone(),
                freq,
                count: field("count").and_then(|v| v.as_i64()),
                num: field("num").and_then(|v| v.as_i64()),
                hom: field("hom").and_then(|v| v.as_i64()),
                hemi: field("hemi").and_then(|v| v.as_i64()),
                filter_status: field("filter").map(string_list).unwrap_or_default(),
            })
        })
        .collect();

    let external = annotations
        .get("external")
        .and_then(|e| e.as_object())
        .map(|external| {
            external
                .iter()
                .filter(|(_, record)| record.is_object())
                .map(|(source, record)| {
                    let significance = match (record.get("significance"), record.get("tag")) {
                        (Some(sig @ Value::Array(_)), _) | (Some(sig @ Value::String(_)), _) => {
                            string_list(sig)
                        }
                        (_, Some(tag @ Value::String(_))) => string_list(tag),
                        _ => Vec::new(),
                    };
                    ExternalShadow {
                        source: source.clone(),
                        significance,
                        num_stars: record.get("num_stars").and_then(|v| v.as_i64()),
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    Projection {
        transcripts,
        frequencies,
        external,
    }
}
