//! Classification filter, removes alleles already assessed with one of the
//! configured classes.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;

use super::{parse_config, query, FilterContext, FilterKind};
use crate::{
    common::{all_allele_ids, GpAlleleIds},
    db::models::Classification,
    err::{Error, Result},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub classes: Vec<Classification>,
    /// Outdated assessments do not count.
    #[serde(default)]
    pub exclude_outdated: bool,
}

impl Config {
    pub fn parse(value: &serde_json::Value) -> Result<Self> {
        let config: Self = parse_config(FilterKind::Classification, value)?;
        if config.classes.is_empty() {
            return Err(Error::FilterConfiguration(String::from(
                "classification filter needs at least one class",
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
    let rows: Vec<(i64, Classification, DateTime<Utc>)> = sqlx::query_as(
        "SELECT allele_id, classification, date_created FROM alleleassessment \
         WHERE date_superceeded IS NULL AND allele_id IN (SELECT value FROM json_each(?))",
    )
    .bind(query::ids_json(&all_allele_ids(gp_allele_ids)))
    .fetch_all(conn)
    .await?;

    let classified = rows
        .into_iter()
        .filter(|(_, classification, _)| config.classes.contains(classification))
        .filter(|(allele_id, classification, date_created)| {
            let outdated = config.exclude_outdated
                && ctx
                    .conf
                    .classification
                    .outdated_after(*classification)
                    .map(|ttl| *date_created + ttl < ctx.now)
                    .unwrap_or(false);
            if outdated {
                tracing::trace!(
                    "allele {} has outdated class {} assessment from {}",
                    allele_id,
                    classification,
                    date_created
                );
            }
            !outdated
        })
        .map(|(allele_id, _, _)| allele_id)
        .collect::<BTreeSet<_>>();

    Ok(gp_allele_ids
        .iter()
        .map(|(gp_key, allele_ids)| {
            let filtered = allele_ids
                .intersection(&classified)
                .copied()
                .inspect(|allele_id| {
                    tracing::trace!("allele {} fails classification filter", allele_id)
                })
                .collect();
            (gp_key.clone(), filtered)
        })
        .collect())
}

#[cfg(test)]
mod test {
    use std::collections::BTreeSet;

    use chrono::{Duration, Utc};
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::Config;
    use crate::{
        common::GpAlleleIds, conf, db::models::Classification, filters::FilterContext, testing,
    };

    #[rstest]
    #[case(Classification::Class1, 10, false, true)]
    #[case(Classification::Class3, 10, false, false)]
    // class 1 ttl is 365 days
    #[case(Classification::Class1, 400, false, true)]
    #[case(Classification::Class1, 400, true, false)]
    #[case(Classification::Class1, 300, true, true)]
    #[tokio::test]
    async fn classes_and_ttl(
        #[case] classification: Classification,
        #[case] age_days: i64,
        #[case] exclude_outdated: bool,
        #[case] filtered: bool,
    ) -> Result<(), anyhow::Error> {
        let pool = testing::pool().await?;
        let (_, user_id) = testing::user(&pool, "alice", "group").await?;
        let gp_key = testing::genepanel(&pool, "HBOC", "v01", serde_json::json!({})).await?;
        let allele_id = testing::allele(&pool, "13", 32_900_000, 1).await?;
        testing::assessment(
            &pool,
            allele_id,
            user_id,
            classification,
            Utc::now() - Duration::days(age_days),
        )
        .await?;
        let conf = conf::Config::default();
        let config = Config::parse(&serde_json::json!({
            "classes": ["1", "2"], "exclude_outdated": exclude_outdated
        }))?;
        let ctx = FilterContext::new(&conf, None);
        let input = GpAlleleIds::from([(gp_key.clone(), BTreeSet::from([allele_id]))]);

        let mut conn = pool.acquire().await?;
        let result = super::filter(&mut conn, &ctx, &input, &config).await?;

        assert_eq!(result[&gp_key].contains(&allele_id), filtered);
        Ok(())
    }

    #[tokio::test]
    async fn unassessed_alleles_pass() -> Result<(), anyhow::Error> {
        let pool = testing::pool().await?;
        let gp_key = testing::genepanel(&pool, "HBOC", "v01", serde_json::json!({})).await?;
        let allele_id = testing::allele(&pool, "13", 32_900_000, 1).await?;
        let conf = conf::Config::default();
        let config = Config::parse(&serde_json::json!({"classes": ["1"]}))?;
        let ctx = FilterContext::new(&conf, None);
        let input = GpAlleleIds::from([(gp_key.clone(), BTreeSet::from([allele_id]))]);

        let mut conn = pool.acquire().await?;
        let result = super::filter(&mut conn, &ctx, &input, &config).await?;

        assert!(result[&gp_key].is_empty());
        Ok(())
    }

    #[rstest]
    #[case(serde_json::json!({"classes": []}))]
    #[case(serde_json::json!({"classes": ["6"]}))]
    #[case(serde_json::json!({}))]
    fn invalid_config(#[case] value: serde_json::Value) {
        assert!(Config::parse(&value).is_err());
    }
}
