//! The filter chain engine.

use std::collections::{BTreeMap, BTreeSet};

use sqlx::{SqliteConnection, SqlitePool};

use super::{FilterContext, FilterKind};
use crate::{
    common::{all_allele_ids, gp_difference, gp_union, GpAlleleIds},
    conf::Config,
    err::{Error, Result},
    filterconfig::{self, AnalysisFacts, FilterStep},
};

/// Outcome of running a chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainResult {
    /// Allele ids that survived every step.
    pub remaining: GpAlleleIds,
    /// Name of the step that removed each filtered allele.
    pub excluded_by: BTreeMap<i64, String>,
}

impl ChainResult {
    /// Filtered allele ids grouped by the name of the removing step.
    pub fn excluded_allele_ids(&self) -> BTreeMap<String, BTreeSet<i64>> {
        let mut result: BTreeMap<String, BTreeSet<i64>> = BTreeMap::new();
        for (allele_id, name) in &self.excluded_by {
            result.entry(name.clone()).or_default().insert(*allele_id);
        }
        result
    }

    /// Surviving allele ids over all gene panels.
    pub fn remaining_allele_ids(&self) -> BTreeSet<i64> {
        all_allele_ids(&self.remaining)
    }
}

fn kind_of(name: &str) -> Result<FilterKind> {
    name.parse::<FilterKind>()
        .map_err(|_| Error::Validation(format!("unknown filter {:?}", name)).in_filter(name))
}

/// Run one step: the primary filter, then every exception on its removals.
async fn run_step(
    conn: &mut SqliteConnection,
    ctx: &FilterContext<'_>,
    step: &FilterStep,
    remaining: &GpAlleleIds,
) -> Result<GpAlleleIds> {
    let removed = kind_of(&step.name)?
        .filter(&mut *conn, ctx, remaining, &step.config)
        .await
        .map_err(|e| e.in_filter(&step.name))?;

    let mut admitted = GpAlleleIds::new();
    for exception in &step.exceptions {
        let kind = kind_of(&exception.name)?;
        let readmit = kind
            .filter(&mut *conn, ctx, &removed, &exception.config)
            .await
            .map_err(|e| e.in_filter(&exception.name))?;
        tracing::debug!(
            "exception {} of {} readmits {} alleles",
            &exception.name,
            &step.name,
            all_allele_ids(&readmit).len()
        );
        admitted = gp_union(&admitted, &readmit);
    }
    Ok(gp_difference(&removed, &admitted))
}

/// Run `steps` in declared order on `gp_allele_ids`.
///
/// Survivors do not depend on the order of the steps; attribution does, the
/// first step removing an allele is credited with it.
pub async fn run_chain(
    conn: &mut SqliteConnection,
    ctx: &FilterContext<'_>,
    steps: &[FilterStep],
    gp_allele_ids: &GpAlleleIds,
) -> Result<ChainResult> {
    let before = std::time::Instant::now();
    let mut remaining = gp_allele_ids.clone();
    let mut excluded_by = BTreeMap::new();
    for step in steps {
        let removed = run_step(&mut *conn, ctx, step, &remaining).await?;
        for allele_id in all_allele_ids(&removed) {
            excluded_by
                .entry(allele_id)
                .or_insert_with(|| step.name.clone());
        }
        remaining = gp_difference(&remaining, &removed);
    }
    // an allele surviving in some panel is not excluded
    let survivors = all_allele_ids(&remaining);
    excluded_by.retain(|allele_id, _| !survivors.contains(allele_id));

    tracing::info!(
        "filter chain of {} steps kept {} of {} alleles in {:?}",
        steps.len(),
        survivors.len(),
        all_allele_ids(gp_allele_ids).len(),
        before.elapsed()
    );
    Ok(ChainResult {
        remaining,
        excluded_by,
    })
}

/// Run the persisted filter config `filterconfig_id` in one transaction.
///
/// With an analysis the requirements of the config are checked first.
pub async fn run_filterconfig(
    pool: &SqlitePool,
    conf: &Config,
    filterconfig_id: i64,
    analysis_id: Option<i64>,
    gp_allele_ids: &GpAlleleIds,
) -> Result<ChainResult> {
    let mut tx = pool.begin().await?;
    let result = run_filterconfig_in(&mut tx, conf, filterconfig_id, analysis_id, gp_allele_ids).await?;
    tx.rollback().await?;
    Ok(result)
}

/// As `run_filterconfig`, on an open connection or transaction.
pub async fn run_filterconfig_in(
    conn: &mut SqliteConnection,
    conf: &Config,
    filterconfig_id: i64,
    analysis_id: Option<i64>,
    gp_allele_ids: &GpAlleleIds,
) -> Result<ChainResult> {
    let fc = filterconfig::get(&mut *conn, filterconfig_id).await?;
    if let Some(analysis_id) = analysis_id {
        let facts = AnalysisFacts::load(&mut *conn, analysis_id).await?;
        fc.check_requirements(&facts)?;
    }
    tracing::debug!("running filter config {} {:?}", fc.id, &fc.name);
    let ctx = FilterContext::new(conf, analysis_id);
    run_chain(conn, &ctx, &fc.filterconfig.filters, gp_allele_ids).await
}

#[cfg(test)]
mod test {
    use std::collections::{BTreeMap, BTreeSet};

    use chrono::{Duration, Utc};
    use pretty_assertions::assert_eq;
    use sqlx::SqlitePool;

    use super::run_chain;
    use crate::{
        common::{GpAlleleIds, GpKey},
        conf::Config,
        db::models::{CallerType, Classification, Sex},
        err::Error,
        filterconfig::{self, FilterStep, NewFilterConfig},
        filters::FilterContext,
        testing,
    };

    fn steps(value: serde_json::Value) -> Vec<FilterStep> {
        serde_json::from_value(value).unwrap()
    }

    /// Three classified alleles and one large CNV.
    async fn setup() -> Result<(SqlitePool, GpKey, BTreeMap<&'static str, i64>), anyhow::Error> {
        let pool = testing::pool().await?;
        let (_, user_id) = testing::user(&pool, "alice", "lab").await?;
        let gp_key = testing::genepanel(&pool, "HBOC", "v01", serde_json::json!({})).await?;
        let mut ids = BTreeMap::new();
        for (name, pos, classification, age_days) in [
            ("class1", 1_000, Classification::Class1, 10),
            ("class3_fresh", 2_000, Classification::Class3, 10),
            ("class3_old", 3_000, Classification::Class3, 400),
        ] {
            let allele_id = testing::allele(&pool, "13", pos, 1).await?;
            testing::assessment(
                &pool,
                allele_id,
                user_id,
                classification,
                Utc::now() - Duration::days(age_days),
            )
            .await?;
            ids.insert(name, allele_id);
        }
        ids.insert(
            "cnv",
            testing::allele_with(&pool, "13", 4_000, 20_000, CallerType::Cnv).await?,
        );
        Ok((pool, gp_key, ids))
    }

    fn input(gp_key: &GpKey, ids: &BTreeMap<&'static str, i64>) -> GpAlleleIds {
        GpAlleleIds::from([(gp_key.clone(), ids.values().copied().collect())])
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn exception_readmits_fresh_assessments_only() -> Result<(), anyhow::Error> {
        let (pool, gp_key, ids) = setup().await?;
        let conf = Config::default();
        let ctx = FilterContext::new(&conf, None);
        let chain = steps(serde_json::json!([
            {"name": "classification", "config": {"classes": ["1", "2"]}},
            {"name": "size", "config": {"threshold": 0, "mode": ">"},
             "exceptions": [{"name": "classification",
                             "config": {"classes": ["3"], "exclude_outdated": true}}]}
        ]));

        let mut conn = pool.acquire().await?;
        let result = run_chain(&mut conn, &ctx, &chain, &input(&gp_key, &ids)).await?;

        assert_eq!(result.remaining[&gp_key], BTreeSet::from([ids["class3_fresh"]]));
        assert_eq!(
            result.excluded_allele_ids(),
            BTreeMap::from([
                (String::from("classification"), BTreeSet::from([ids["class1"]])),
                (String::from("size"), BTreeSet::from([ids["class3_old"], ids["cnv"]])),
            ])
        );
        assert!(logs_contain("exception classification of size readmits 1 alleles"));
        Ok(())
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn exceptions_readmit_union_of_removed() -> Result<(), anyhow::Error> {
        let (pool, gp_key, ids) = setup().await?;
        let conf = Config::default();
        let ctx = FilterContext::new(&conf, None);
        // the last two exceptions admit the same allele, each sees the full removed set
        let chain = steps(serde_json::json!([
            {"name": "size", "config": {"threshold": 0, "mode": ">"},
             "exceptions": [
                 {"name": "classification", "config": {"classes": ["1"]}},
                 {"name": "callertype", "config": {"caller_types": ["CNV"]}},
                 {"name": "size", "config": {"threshold": 20_000, "mode": ">="}}
             ]}
        ]));

        let mut conn = pool.acquire().await?;
        let result = run_chain(&mut conn, &ctx, &chain, &input(&gp_key, &ids)).await?;

        assert_eq!(
            result.remaining[&gp_key],
            BTreeSet::from([ids["class1"], ids["cnv"]])
        );
        assert_eq!(
            result.excluded_allele_ids(),
            BTreeMap::from([(
                String::from("size"),
                BTreeSet::from([ids["class3_fresh"], ids["class3_old"]])
            )])
        );
        assert!(logs_contain("exception classification of size readmits 1 alleles"));
        assert!(logs_contain("exception callertype of size readmits 1 alleles"));
        assert!(logs_contain("exception size of size readmits 1 alleles"));
        assert!(!logs_contain("readmits 0 alleles"));
        Ok(())
    }

    #[tokio::test]
    async fn order_changes_attribution_only() -> Result<(), anyhow::Error> {
        let (pool, gp_key, ids) = setup().await?;
        let conf = Config::default();
        let ctx = FilterContext::new(&conf, None);
        let callertype = serde_json::json!({"name": "callertype", "config": {"caller_types": ["CNV"]}});
        let size = serde_json::json!({"name": "size", "config": {"threshold": 100, "mode": ">="}});
        let classification =
            serde_json::json!({"name": "classification", "config": {"classes": ["1"]}});

        let mut conn = pool.acquire().await?;
        let forward = run_chain(
            &mut conn,
            &ctx,
            &steps(serde_json::json!([callertype, size, classification])),
            &input(&gp_key, &ids),
        )
        .await?;
        let backward = run_chain(
            &mut conn,
            &ctx,
            &steps(serde_json::json!([classification, size, callertype])),
            &input(&gp_key, &ids),
        )
        .await?;

        assert_eq!(forward.remaining, backward.remaining);
        assert_eq!(forward.excluded_by[&ids["cnv"]], "callertype");
        assert_eq!(backward.excluded_by[&ids["cnv"]], "size");
        assert_eq!(forward.excluded_by[&ids["class1"]], "classification");
        Ok(())
    }

    #[tokio::test]
    async fn removing_a_step_grows_survivors() -> Result<(), anyhow::Error> {
        let (pool, gp_key, ids) = setup().await?;
        let conf = Config::default();
        let ctx = FilterContext::new(&conf, None);
        let full = steps(serde_json::json!([
            {"name": "callertype", "config": {"caller_types": ["CNV"]}},
            {"name": "classification", "config": {"classes": ["3"]}}
        ]));

        let mut conn = pool.acquire().await?;
        let all = run_chain(&mut conn, &ctx, &full, &input(&gp_key, &ids)).await?;
        for skip in 0..full.len() {
            let mut partial = full.clone();
            partial.remove(skip);
            let fewer = run_chain(&mut conn, &ctx, &partial, &input(&gp_key, &ids)).await?;
            assert!(fewer.remaining_allele_ids().is_superset(&all.remaining_allele_ids()));
        }
        let none = run_chain(&mut conn, &ctx, &[], &input(&gp_key, &ids)).await?;
        assert_eq!(none.remaining, input(&gp_key, &ids));
        assert!(none.excluded_by.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn failing_step_is_named() -> Result<(), anyhow::Error> {
        let (pool, gp_key, ids) = setup().await?;
        let conf = Config::default();
        let ctx = FilterContext::new(&conf, None);
        let chain = steps(serde_json::json!([
            {"name": "callertype", "config": {"caller_types": ["CNV"]}},
            {"name": "quality", "config": {"qual": 50}}
        ]));

        let mut conn = pool.acquire().await?;
        let err = run_chain(&mut conn, &ctx, &chain, &input(&gp_key, &ids))
            .await
            .unwrap_err();

        match &err {
            Error::Filter { name, .. } => assert_eq!(name, "quality"),
            other => panic!("unexpected error {:?}", other),
        }
        assert!(matches!(err.root(), Error::FilterConfiguration(_)));
        Ok(())
    }

    #[tokio::test]
    async fn filterconfig_requirements_are_checked() -> Result<(), anyhow::Error> {
        let (pool, gp_key, ids) = setup().await?;
        let conf = Config::default();
        let (usergroup_id, _) = testing::user(&pool, "bob", "lab").await?;
        let analysis_id = testing::analysis(&pool, "single", &gp_key).await?;
        testing::sample(&pool, analysis_id, "P", true, true, Sex::Male, Default::default()).await?;
        let new = NewFilterConfig::from_json(
            serde_json::json!({
                "name": "Trio",
                "filterconfig": {"filters": [{"name": "callertype", "config": {"caller_types": ["CNV"]}}]},
                "requirements": [{"function": "analysis", "params": {"is_trio": true}}]
            }),
            &conf,
        )?;
        let fc_id = filterconfig::create(&pool, usergroup_id, &new, &conf).await?;

        let res =
            super::run_filterconfig(&pool, &conf, fc_id, Some(analysis_id), &input(&gp_key, &ids))
                .await;
        assert!(matches!(res, Err(Error::RequirementMismatch { .. })), "{:?}", res);

        let result = super::run_filterconfig(&pool, &conf, fc_id, None, &input(&gp_key, &ids)).await?;
        assert_eq!(result.excluded_by.get(&ids["cnv"]).map(String::as_str), Some("callertype"));
        Ok(())
    }
}
