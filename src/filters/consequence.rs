//! Consequence filter, removes alleles with any listed consequence.

use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;

use super::{parse_config, query, FilterContext, FilterKind};
use crate::{
    common::GpAlleleIds,
    conf,
    err::{Error, Result},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub consequences: Vec<String>,
    #[serde(default)]
    pub genepanel_only: bool,
    #[serde(default)]
    pub transcript_inclusion_regex: Option<String>,
}

impl Config {
    pub fn parse(value: &serde_json::Value, conf: &conf::Config) -> Result<Self> {
        let config: Self = parse_config(FilterKind::Consequence, value)?;
        if config.consequences.is_empty() {
            return Err(Error::FilterConfiguration(String::from(
                "consequence filter needs at least one consequence",
            )));
        }
        conf.transcripts.check_vocabulary(&config.consequences)?;
        query::transcript_regex(config.transcript_inclusion_regex.as_deref())?;
        Ok(config)
    }
}

pub async fn filter(
    conn: &mut SqliteConnection,
    _ctx: &FilterContext<'_>,
    gp_allele_ids: &GpAlleleIds,
    config: &Config,
) -> Result<GpAlleleIds> {
    let regex = query::transcript_regex(config.transcript_inclusion_regex.as_deref())?;
    let mut result = GpAlleleIds::new();
    for (gp_key, allele_ids) in gp_allele_ids {
        let filtered = query::TranscriptQuery::scoped(allele_ids, gp_key, config.genepanel_only)
            .consequences_overlap(&config.consequences)
            .transcript_matches(regex.clone())
            .fetch_allele_ids(&mut *conn)
            .await?;
        for allele_id in &filtered {
            tracing::trace!("allele {} fails consequence filter in {}", allele_id, gp_key);
        }
        result.insert(gp_key.clone(), filtered);
    }
    Ok(result)
}

#[cfg(test)]
mod test {
    use std::collections::BTreeSet;

    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::Config;
    use crate::{common::GpAlleleIds, conf, filters::FilterContext, testing};

    #[rstest]
    // any overlap is enough
    #[case(&["intron_variant", "splice_region_variant"], serde_json::json!({}), true)]
    #[case(&["missense_variant"], serde_json::json!({}), false)]
    // transcript excluded by the regex
    #[case(
        &["intron_variant"],
        serde_json::json!({"transcript_inclusion_regex": "NR_.*"}),
        false
    )]
    #[tokio::test]
    async fn overlap(
        #[case] consequences: &[&str],
        #[case] extra: serde_json::Value,
        #[case] filtered: bool,
    ) -> Result<(), anyhow::Error> {
        let pool = testing::pool().await?;
        let gp_key = testing::genepanel(&pool, "HBOC", "v01", serde_json::json!({})).await?;
        let allele_id = testing::allele(&pool, "13", 32_900_000, 1).await?;
        testing::annotate(
            &pool,
            allele_id,
            testing::blob(1101, "NM_000059.3", consequences, serde_json::json!({})),
        )
        .await?;
        let conf = conf::Config::default();
        let mut value = serde_json::json!({"consequences": ["intron_variant"]});
        crate::genepanel::deep_merge(&mut value, &extra);
        let config = Config::parse(&value, &conf)?;
        let ctx = FilterContext::new(&conf, None);
        let input = GpAlleleIds::from([(gp_key.clone(), BTreeSet::from([allele_id]))]);

        let mut conn = pool.acquire().await?;
        let result = super::filter(&mut conn, &ctx, &input, &config).await?;

        assert_eq!(result[&gp_key].contains(&allele_id), filtered);
        Ok(())
    }

    #[rstest]
    #[case(serde_json::json!({"consequences": []}))]
    #[case(serde_json::json!({"consequences": ["not_a_consequence"]}))]
    #[case(serde_json::json!({"consequences": ["intron_variant"], "unknown": 1}))]
    fn invalid_config(#[case] value: serde_json::Value) {
        assert!(Config::parse(&value, &conf::Config::default()).is_err());
    }
}
