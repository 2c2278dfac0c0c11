//! Allele filter primitives and the filter chain engine.
//!
//! Every primitive has the same shape: given allele ids per gene panel and a
//! JSON config, return the subset of allele ids to be filtered out.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sqlx::SqliteConnection;

use crate::{
    common::{gp_restrict, GpAlleleIds},
    conf::Config,
    err::{Error, Result},
};

pub mod callertype;
pub mod chain;
pub mod classification;
pub mod consequence;
pub mod external;
pub mod frequency;
pub mod generic;
pub mod inheritance;
pub mod ppy;
pub mod quality;
pub mod query;
pub mod region;
pub mod segregation;
pub mod size;

/// Registry of filter primitives, keyed by their name in filter configs.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum FilterKind {
    Frequency,
    Region,
    Consequence,
    Classification,
    Quality,
    Segregation,
    #[strum(serialize = "inheritancemodel")]
    InheritanceModel,
    Ppy,
    Size,
    #[strum(serialize = "callertype")]
    CallerType,
    External,
    #[strum(serialize = "genericannotation")]
    GenericAnnotation,
}

/// Everything a primitive may need besides its config.
#[derive(Debug, Clone)]
pub struct FilterContext<'a> {
    pub conf: &'a Config,
    /// Analysis being filtered; required by analysis-scoped primitives.
    pub analysis_id: Option<i64>,
    /// Reference time for age-dependent predicates.
    pub now: DateTime<Utc>,
}

impl<'a> FilterContext<'a> {
    pub fn new(conf: &'a Config, analysis_id: Option<i64>) -> Self {
        Self {
            conf,
            analysis_id,
            now: Utc::now(),
        }
    }

    /// The analysis id, or an error naming the primitive that needs it.
    pub fn require_analysis(&self, kind: FilterKind) -> Result<i64> {
        self.analysis_id.ok_or_else(|| {
            Error::FilterConfiguration(format!("filter {} requires an analysis", kind))
        })
    }
}

/// Deserialize a primitive config, mapping failures to `FilterConfiguration`.
pub fn parse_config<T: DeserializeOwned>(kind: FilterKind, config: &serde_json::Value) -> Result<T> {
    let config = if config.is_null() {
        serde_json::Value::Object(Default::default())
    } else {
        config.clone()
    };
    serde_json::from_value(config)
        .map_err(|e| Error::FilterConfiguration(format!("invalid {} config: {}", kind, e)))
}

impl FilterKind {
    /// Check `config` without touching the database.
    pub fn validate(&self, config: &serde_json::Value, conf: &Config) -> Result<()> {
        match self {
            FilterKind::Frequency => frequency::Config::parse(config, conf).map(|_| ()),
            FilterKind::Region => region::Config::parse(config, conf).map(|_| ()),
            FilterKind::Consequence => consequence::Config::parse(config, conf).map(|_| ()),
            FilterKind::Classification => classification::Config::parse(config).map(|_| ()),
            FilterKind::Quality => quality::Config::parse(config).map(|_| ()),
            FilterKind::Segregation => segregation::Config::parse(config).map(|_| ()),
            FilterKind::InheritanceModel => inheritance::Config::parse(config).map(|_| ()),
            FilterKind::Ppy => ppy::Config::parse(config).map(|_| ()),
            FilterKind::Size => size::Config::parse(config).map(|_| ()),
            FilterKind::CallerType => callertype::Config::parse(config).map(|_| ()),
            FilterKind::External => external::Config::parse(config).map(|_| ()),
            FilterKind::GenericAnnotation => generic::Config::parse(config).map(|_| ()),
        }
    }

    /// Run the primitive; the result is restricted to the input ids.
    pub async fn filter(
        &self,
        conn: &mut SqliteConnection,
        ctx: &FilterContext<'_>,
        gp_allele_ids: &GpAlleleIds,
        config: &serde_json::Value,
    ) -> Result<GpAlleleIds> {
        let before = std::time::Instant::now();
        let conf = ctx.conf;
        let result = match self {
            FilterKind::Frequency => {
                let config = frequency::Config::parse(config, conf)?;
                frequency::filter(conn, ctx, gp_allele_ids, &config).await?
            }
            FilterKind::Region => {
                let config = region::Config::parse(config, conf)?;
                region::filter(conn, ctx, gp_allele_ids, &config).await?
            }
            FilterKind::Consequence => {
                let config = consequence::Config::parse(config, conf)?;
                consequence::filter(conn, ctx, gp_allele_ids, &config).await?
            }
            FilterKind::Classification => {
                let config = classification::Config::parse(config)?;
                classification::filter(conn, ctx, gp_allele_ids, &config).await?
            }
            FilterKind::Quality => {
                let config = quality::Config::parse(config)?;
                quality::filter(conn, ctx, gp_allele_ids, &config).await?
            }
            FilterKind::Segregation => {
                let config = segregation::Config::parse(config)?;
                segregation::filter(conn, ctx, gp_allele_ids, &config).await?
            }
            FilterKind::InheritanceModel => {
                let config = inheritance::Config::parse(config)?;
                inheritance::filter(conn, ctx, gp_allele_ids, &config).await?
            }
            FilterKind::Ppy => {
                let config = ppy::Config::parse(config)?;
                ppy::filter(conn, ctx, gp_allele_ids, &config).await?
            }
            FilterKind::Size => {
                let config = size::Config::parse(config)?;
                size::filter(conn, ctx, gp_allele_ids, &config).await?
            }
            FilterKind::CallerType => {
                let config = callertype::Config::parse(config)?;
                callertype::filter(conn, ctx, gp_allele_ids, &config).await?
            }
            FilterKind::External => {
                let config = external::Config::parse(config)?;
                external::filter(conn, ctx, gp_allele_ids, &config).await?
            }
            FilterKind::GenericAnnotation => {
                let config = generic::Config::parse(config)?;
                generic::filter(conn, ctx, gp_allele_ids, &config).await?
            }
        };
        let result = gp_restrict(result, gp_allele_ids);
        tracing::debug!(
            "filter {} removed {} of {} alleles in {:?}",
            self,
            crate::common::all_allele_ids(&result).len(),
            crate::common::all_allele_ids(gp_allele_ids).len(),
            before.elapsed()
        );
        Ok(result)
    }
}
