//! External database filter, works on the external shadow.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use super::{parse_config, query, FilterContext, FilterKind};
use crate::{
    common::{all_allele_ids, GpAlleleIds},
    err::{Error, Result},
};

/// Record predicate for one database.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConf {
    /// Accepted significance values, compared case-insensitively; any if unset.
    #[serde(default)]
    pub significance: Option<Vec<String>>,
    #[serde(default)]
    pub min_stars: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub databases: IndexMap<String, DatabaseConf>,
    /// Remove alleles *with* a matching record instead.
    #[serde(default)]
    pub inverse: bool,
}

impl Config {
    pub fn parse(value: &serde_json::Value) -> Result<Self> {
        let config: Self = parse_config(FilterKind::External, value)?;
        if config.databases.is_empty() {
            return Err(Error::FilterConfiguration(String::from(
                "external filter needs at least one database",
            )));
        }
        Ok(config)
    }
}

/// Alleles with a record matching any configured database.
async fn matching_alleles(
    conn: &mut SqliteConnection,
    config: &Config,
    allele_ids: &BTreeSet<i64>,
) -> Result<BTreeSet<i64>> {
    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
        "SELECT DISTINCT e.allele_id FROM annotationshadowexternal AS e \
         WHERE e.allele_id IN (SELECT value FROM json_each(",
    );
    builder.push_bind(query::ids_json(allele_ids));
    builder.push(")) AND (");
    for (i, (database, db_conf)) in config.databases.iter().enumerate() {
        if i > 0 {
            builder.push(" OR ");
        }
        builder.push("(upper(e.source) = upper(");
        builder.push_bind(database.clone());
        builder.push(")");
        if let Some(significance) = &db_conf.significance {
            builder.push(
                " AND EXISTS (SELECT 1 FROM json_each(e.significance) AS s \
                 WHERE lower(s.value) IN (SELECT lower(value) FROM json_each(",
            );
            builder.push_bind(query::strings_json(significance));
            builder.push(")))");
        }
        if let Some(min_stars) = db_conf.min_stars {
            builder.push(" AND e.num_stars >= ");
            builder.push_bind(min_stars);
        }
        builder.push(")");
    }
    builder.push(")");

    let rows: Vec<(i64,)> = builder.build_query_as().fetch_all(conn).await?;
    Ok(rows.into_iter().map(|(allele_id,)| allele_id).collect())
}

pub async fn filter(
    conn: &mut SqliteConnection,
    _ctx: &FilterContext<'_>,
    gp_allele_ids: &GpAlleleIds,
    config: &Config,
) -> Result<GpAlleleIds> {
    let matching = matching_alleles(conn, config, &all_allele_ids(gp_allele_ids)).await?;
    Ok(gp_allele_ids
        .iter()
        .map(|(gp_key, allele_ids)| {
            let filtered = allele_ids
                .iter()
                .filter(|allele_id| matching.contains(*allele_id) == config.inverse)
                .copied()
                .inspect(|allele_id| tracing::trace!("allele {} fails external filter", allele_id))
                .collect();
            (gp_key.clone(), filtered)
        })
        .collect())
}

#[cfg(test)]
mod test {
    use std::collections::BTreeSet;

    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::Config;
    use crate::{common::GpAlleleIds, conf, filters::FilterContext, testing};

    #[rstest]
    #[case(serde_json::json!({"databases": {"CLINVAR": {"significance": ["pathogenic"]}}}), false)]
    #[case(
        serde_json::json!({"databases": {"CLINVAR": {"significance": ["pathogenic"]}}, "inverse": true}),
        true
    )]
    #[case(serde_json::json!({"databases": {"CLINVAR": {"min_stars": 3}}}), true)]
    #[case(serde_json::json!({"databases": {"CLINVAR": {"min_stars": 2}}}), false)]
    #[case(serde_json::json!({"databases": {"CLINVAR": {"significance": ["benign"]}}}), true)]
    // tag is projected as significance
    #[case(serde_json::json!({"databases": {"HGMD": {"significance": ["DM"]}}}), false)]
    #[tokio::test]
    async fn records(
        #[case] config: serde_json::Value,
        #[case] filtered: bool,
    ) -> Result<(), anyhow::Error> {
        let pool = testing::pool().await?;
        let gp_key = testing::genepanel(&pool, "HBOC", "v01", serde_json::json!({})).await?;
        let allele_id = testing::allele(&pool, "13", 32_900_000, 1).await?;
        testing::annotate(
            &pool,
            allele_id,
            serde_json::json!({"external": {
                "CLINVAR": {"significance": ["Pathogenic"], "num_stars": 2},
                "HGMD": {"tag": "DM"}
            }}),
        )
        .await?;
        let conf = conf::Config::default();
        let config = Config::parse(&config)?;
        let ctx = FilterContext::new(&conf, None);
        let input = GpAlleleIds::from([(gp_key.clone(), BTreeSet::from([allele_id]))]);

        let mut conn = pool.acquire().await?;
        let result = super::filter(&mut conn, &ctx, &input, &config).await?;

        assert_eq!(result[&gp_key].contains(&allele_id), filtered);
        Ok(())
    }

    #[tokio::test]
    async fn allele_without_records() -> Result<(), anyhow::Error> {
        let pool = testing::pool().await?;
        let gp_key = testing::genepanel(&pool, "HBOC", "v01", serde_json::json!({})).await?;
        let allele_id = testing::allele(&pool, "13", 32_900_000, 1).await?;
        let conf = conf::Config::default();
        let config = Config::parse(&serde_json::json!({"databases": {"CLINVAR": {}}}))?;
        let ctx = FilterContext::new(&conf, None);
        let input = GpAlleleIds::from([(gp_key.clone(), BTreeSet::from([allele_id]))]);

        let mut conn = pool.acquire().await?;
        let result = super::filter(&mut conn, &ctx, &input, &config).await?;

        assert_eq!(result[&gp_key], BTreeSet::from([allele_id]));
        Ok(())
    }
}
