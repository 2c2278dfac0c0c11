//! Generic annotation filter, a declarative rule set over a sub-tree of the
//! current annotation blob.
//!
//! The sub-tree at `target` is projected once per query with `json_extract`;
//! rules are evaluated on the projection.  Arrays match if any element does,
//! missing keys never match.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{types::Json, SqliteConnection};

use super::{parse_config, query, FilterContext, FilterKind};
use crate::{
    common::{all_allele_ids, Comparison, GpAlleleIds},
    err::{Error, Result},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Rule {
    /// Dotted path below `target`.
    pub key: String,
    pub operator: Comparison,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    All,
    Any,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Dotted path below the blob root.
    pub target: String,
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub mode: Mode,
}

fn check_path(label: &str, path: &str) -> Result<()> {
    let valid = !path.is_empty()
        && path
            .split('.')
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    if valid {
        Ok(())
    } else {
        Err(Error::FilterConfiguration(format!(
            "invalid {} path {:?}",
            label, path
        )))
    }
}

impl Config {
    pub fn parse(value: &Value) -> Result<Self> {
        let config: Self = parse_config(FilterKind::GenericAnnotation, value)?;
        check_path("target", &config.target)?;
        if config.rules.is_empty() {
            return Err(Error::FilterConfiguration(String::from(
                "genericannotation filter needs at least one rule",
            )));
        }
        for rule in &config.rules {
            check_path("rule key", &rule.key)?;
            if !(rule.value.is_number() || rule.value.is_string() || rule.value.is_boolean()) {
                return Err(Error::FilterConfiguration(format!(
                    "rule value for {:?} must be a number, string or boolean",
                    &rule.key
                )));
            }
        }
        Ok(config)
    }

    /// Whether the projected `target` sub-tree satisfies the rules.
    pub fn matches(&self, projection: &Value) -> bool {
        let mut outcomes = self.rules.iter().map(|rule| rule.matches(projection));
        match self.mode {
            Mode::All => outcomes.all(|outcome| outcome),
            Mode::Any => outcomes.any(|outcome| outcome),
        }
    }
}

/// Values at `path` below `value`, descending into arrays.
fn lookup<'a>(value: &'a Value, path: &[&str], out: &mut Vec<&'a Value>) {
    match (value, path.split_first()) {
        (Value::Array(items), _) => items.iter().for_each(|item| lookup(item, path, out)),
        (value, None) => out.push(value),
        (Value::Object(map), Some((head, rest))) => {
            if let Some(child) = map.get(*head) {
                lookup(child, rest, out)
            }
        }
        _ => (),
    }
}

fn compare(operator: Comparison, lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Number(lhs), Value::Number(rhs)) => match (lhs.as_f64(), rhs.as_f64()) {
            (Some(lhs), Some(rhs)) => operator.holds(lhs, rhs),
            _ => false,
        },
        (Value::String(lhs), Value::String(rhs)) => operator.holds(lhs.as_str(), rhs.as_str()),
        (Value::Bool(lhs), Value::Bool(rhs)) => operator == Comparison::Eq && lhs == rhs,
        _ => false,
    }
}

impl Rule {
    fn matches(&self, projection: &Value) -> bool {
        let path = self.key.split('.').collect::<Vec<_>>();
        let mut values = Vec::new();
        lookup(projection, &path, &mut values);
        values
            .into_iter()
            .any(|value| compare(self.operator, value, &self.value))
    }
}

pub async fn filter(
    conn: &mut SqliteConnection,
    _ctx: &FilterContext<'_>,
    gp_allele_ids: &GpAlleleIds,
    config: &Config,
) -> Result<GpAlleleIds> {
    let rows: Vec<(i64, Option<Json<Value>>)> = sqlx::query_as(
        "SELECT allele_id, json_quote(json_extract(annotations, ?)) FROM annotation \
         WHERE date_superceeded IS NULL AND allele_id IN (SELECT value FROM json_each(?))",
    )
    .bind(format!("$.{}", &config.target))
    .bind(query::ids_json(&all_allele_ids(gp_allele_ids)))
    .fetch_all(conn)
    .await?;

    let matching = rows
        .into_iter()
        .filter_map(|(allele_id, projection)| {
            projection
                .filter(|Json(projection)| config.matches(projection))
                .map(|_| allele_id)
        })
        .collect::<std::collections::BTreeSet<_>>();

    Ok(gp_allele_ids
        .iter()
        .map(|(gp_key, allele_ids)| {
            let filtered = allele_ids
                .intersection(&matching)
                .copied()
                .inspect(|allele_id| {
                    tracing::trace!("allele {} fails genericannotation filter", allele_id)
                })
                .collect();
            (gp_key.clone(), filtered)
        })
        .collect())
}
