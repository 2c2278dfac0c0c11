//! Filter configurations: wire format, validation, persistence and
//! applicability to an analysis.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::{types::Json, SqliteConnection, SqlitePool};

use crate::{
    conf::Config,
    err::{Error, Result},
    filters::FilterKind,
};

/// Exception sub-step of a filter step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExceptionStep {
    pub name: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// One step of a filter chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterStep {
    pub name: String,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exceptions: Vec<ExceptionStep>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterChainDef {
    pub filters: Vec<FilterStep>,
}

/// Parameters of the `analysis` requirement function.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnalysisRequirement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_trio: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_family: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_single: Option<bool>,
    /// Regular expression matched against the analysis name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Regular expression matched against the gene panel name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genepanel_name: Option<String>,
}

/// Predicate gating whether a filter config applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "function", content = "params", rename_all = "snake_case")]
pub enum Requirement {
    Analysis(AnalysisRequirement),
}

/// Payload for creating a filter config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewFilterConfig {
    pub name: String,
    pub filterconfig: FilterChainDef,
    #[serde(default)]
    pub requirements: Vec<Requirement>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub order: i64,
}

fn default_active() -> bool {
    true
}

impl NewFilterConfig {
    /// Parse and validate the JSON wire format.
    pub fn from_json(value: serde_json::Value, conf: &Config) -> Result<Self> {
        let result: Self = serde_json::from_value(value)
            .map_err(|e| Error::Validation(format!("invalid filter config: {}", e)))?;
        result.validate(conf)?;
        Ok(result)
    }

    /// Check step names, step configurations and requirement regexes.
    pub fn validate(&self, conf: &Config) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation(String::from(
                "filter config name must not be empty",
            )));
        }
        for step in &self.filterconfig.filters {
            validate_step(&step.name, &step.config, conf)?;
            for exception in &step.exceptions {
                validate_step(&exception.name, &exception.config, conf)?;
            }
        }
        for requirement in &self.requirements {
            let Requirement::Analysis(params) = requirement;
            for regex in [&params.name, &params.genepanel_name].into_iter().flatten() {
                Regex::new(regex).map_err(|e| {
                    Error::Validation(format!("invalid requirement regex {:?}: {}", regex, e))
                })?;
            }
        }
        Ok(())
    }
}

fn validate_step(name: &str, config: &serde_json::Value, conf: &Config) -> Result<()> {
    let kind: FilterKind = name
        .parse()
        .map_err(|_| Error::Validation(format!("unknown filter {:?}", name)))?;
    kind.validate(config, conf).map_err(|e| e.in_filter(name))
}

/// Persisted filter config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct FilterConfig {
    pub id: i64,
    pub name: String,
    pub usergroup_id: i64,
    pub filterconfig: Json<FilterChainDef>,
    pub requirements: Json<Vec<Requirement>>,
    pub active: bool,
    pub order: i64,
    pub previous_filterconfig_id: Option<i64>,
    pub date_created: DateTime<Utc>,
    pub date_superceeded: Option<DateTime<Utc>>,
}

/// Store a validated filter config for `usergroup_id`.
///
/// An active config with the same name is superseded and deactivated.
pub async fn create(
    pool: &SqlitePool,
    usergroup_id: i64,
    new: &NewFilterConfig,
    conf: &Config,
) -> Result<i64> {
    new.validate(conf)?;
    let now = Utc::now();
    let mut tx = pool.begin().await?;

    let previous: Option<i64> =
        sqlx::query_scalar("SELECT id FROM filterconfig WHERE name = ? AND active IS TRUE")
            .bind(&new.name)
            .fetch_optional(&mut *tx)
            .await?;
    if let Some(previous) = previous {
        sqlx::query("UPDATE filterconfig SET active = 0, date_superceeded = ? WHERE id = ?")
            .bind(now)
            .bind(previous)
            .execute(&mut *tx)
            .await?;
    }

    if new.active {
        let clash: Option<String> = sqlx::query_scalar(
            r#"SELECT name FROM filterconfig WHERE usergroup_id = ? AND "order" = ? AND active IS TRUE"#,
        )
        .bind(usergroup_id)
        .bind(new.order)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(clash) = clash {
            return Err(Error::Validation(format!(
                "order {} of usergroup {} is taken by filter config {:?}",
                new.order, usergroup_id, clash
            )));
        }
    }

    let id = sqlx::query(
        r#"INSERT INTO filterconfig (name, usergroup_id, filterconfig, requirements, active,
           "order", previous_filterconfig_id, date_created) VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&new.name)
    .bind(usergroup_id)
    .bind(Json(&new.filterconfig))
    .bind(Json(&new.requirements))
    .bind(new.active)
    .bind(new.order)
    .bind(previous)
    .bind(now)
    .execute(&mut *tx)
    .await?
    .last_insert_rowid();
    tx.commit().await?;

    tracing::info!(
        "created filter config {} {:?} (supersedes {:?})",
        id,
        &new.name,
        previous
    );
    Ok(id)
}

pub async fn get(conn: &mut SqliteConnection, filterconfig_id: i64) -> Result<FilterConfig> {
    sqlx::query_as::<_, FilterConfig>("SELECT * FROM filterconfig WHERE id = ?")
        .bind(filterconfig_id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| Error::not_found("filterconfig", filterconfig_id))
}

/// Active filter configs of a user group, by `order`.
pub async fn list_for_usergroup(pool: &SqlitePool, usergroup_id: i64) -> Result<Vec<FilterConfig>> {
    Ok(sqlx::query_as::<_, FilterConfig>(
        r#"SELECT * FROM filterconfig WHERE usergroup_id = ? AND active IS TRUE ORDER BY "order", id"#,
    )
    .bind(usergroup_id)
    .fetch_all(pool)
    .await?)
}

/// Facts about an analysis that requirements are evaluated against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisFacts {
    pub name: String,
    pub genepanel_name: String,
    /// A proband has both parents in the analysis.
    pub is_trio: bool,
    /// The analysis has samples besides the proband(s).
    pub is_family: bool,
    /// The analysis has exactly one sample.
    pub is_single: bool,
}

impl AnalysisFacts {
    pub async fn load(conn: &mut SqliteConnection, analysis_id: i64) -> Result<Self> {
        let (name, genepanel_name): (String, String) =
            sqlx::query_as("SELECT name, genepanel_name FROM analysis WHERE id = ?")
                .bind(analysis_id)
                .fetch_optional(&mut *conn)
                .await?
                .ok_or_else(|| Error::not_found("analysis", analysis_id))?;
        let (num_samples, num_family, num_trio_probands): (i64, i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), \
             COALESCE(SUM(CASE WHEN proband THEN 0 ELSE 1 END), 0), \
             COALESCE(SUM(CASE WHEN proband AND father_id IS NOT NULL AND mother_id IS NOT NULL \
                          THEN 1 ELSE 0 END), 0) \
             FROM sample WHERE analysis_id = ?",
        )
        .bind(analysis_id)
        .fetch_one(&mut *conn)
        .await?;
        Ok(Self {
            name,
            genepanel_name,
            is_trio: num_trio_probands > 0,
            is_family: num_family > 0,
            is_single: num_samples == 1,
        })
    }
}

impl Requirement {
    /// `Err` with the reason if the requirement does not hold.
    fn check(&self, facts: &AnalysisFacts) -> std::result::Result<(), String> {
        let Requirement::Analysis(params) = self;
        let flags = [
            ("is_trio", params.is_trio, facts.is_trio),
            ("is_family", params.is_family, facts.is_family),
            ("is_single", params.is_single, facts.is_single),
        ];
        for (label, wanted, actual) in flags {
            if let Some(wanted) = wanted {
                if wanted != actual {
                    return Err(format!("{} is {}, required {}", label, actual, wanted));
                }
            }
        }
        let patterns = [
            ("name", &params.name, &facts.name),
            ("genepanel_name", &params.genepanel_name, &facts.genepanel_name),
        ];
        for (label, pattern, value) in patterns {
            if let Some(pattern) = pattern {
                let regex = Regex::new(pattern).map_err(|e| e.to_string())?;
                if !regex.is_match(value) {
                    return Err(format!("{} {:?} does not match {:?}", label, value, pattern));
                }
            }
        }
        Ok(())
    }
}

impl FilterConfig {
    /// Check all requirements against the analysis.
    pub fn check_requirements(&self, facts: &AnalysisFacts) -> Result<()> {
        for requirement in self.requirements.iter() {
            requirement
                .check(facts)
                .map_err(|reason| Error::RequirementMismatch {
                    filterconfig_id: self.id,
                    reason,
                })?;
        }
        Ok(())
    }
}

/// Active filter configs of the user group applicable to the analysis.
pub async fn applicable_for_analysis(
    pool: &SqlitePool,
    usergroup_id: i64,
    analysis_id: i64,
) -> Result<Vec<FilterConfig>> {
    let facts = {
        let mut conn = pool.acquire().await?;
        AnalysisFacts::load(&mut conn, analysis_id).await?
    };
    Ok(list_for_usergroup(pool, usergroup_id)
        .await?
        .into_iter()
        .filter(|fc| fc.check_requirements(&facts).is_ok())
        .collect())
}
