//! Immutable per-allele records written when a round is finalized.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use super::Subject;
use crate::{db::models::InterpretationSnapshot, err::Result};

/// Write one snapshot row per allele in `allele_ids`.
///
/// Assessment, report and annotation ids are the current ones, so this must
/// run after the decisions of the round were committed.
pub async fn write(
    conn: &mut SqliteConnection,
    subject: Subject,
    interpretation_id: i64,
    allele_ids: &BTreeSet<i64>,
    excluded_by: &BTreeMap<i64, String>,
    now: DateTime<Utc>,
) -> Result<usize> {
    let sql = format!(
        "INSERT INTO {} (interpretation_id, allele_id, filtered, alleleassessment_id, \
         allelereport_id, annotation_id, customannotation_id, date_created) \
         VALUES (?, ?, ?, \
         (SELECT id FROM alleleassessment WHERE allele_id = ? AND date_superceeded IS NULL), \
         (SELECT id FROM allelereport WHERE allele_id = ? AND date_superceeded IS NULL), \
         (SELECT id FROM annotation WHERE allele_id = ? AND date_superceeded IS NULL), \
         (SELECT id FROM customannotation WHERE allele_id = ? AND date_superceeded IS NULL), \
         ?)",
        subject.snapshot_table()
    );
    for allele_id in allele_ids {
        sqlx::query(&sql)
            .bind(interpretation_id)
            .bind(*allele_id)
            .bind(excluded_by.get(allele_id).map(String::as_str))
            .bind(*allele_id)
            .bind(*allele_id)
            .bind(*allele_id)
            .bind(*allele_id)
            .bind(now)
            .execute(&mut *conn)
            .await?;
    }
    tracing::debug!(
        "wrote {} snapshots for {} round {}",
        allele_ids.len(),
        subject,
        interpretation_id
    );
    Ok(allele_ids.len())
}

/// Snapshots of the round `interpretation_id`, by allele id.
pub async fn load(
    conn: &mut SqliteConnection,
    subject: Subject,
    interpretation_id: i64,
) -> Result<Vec<InterpretationSnapshot>> {
    let sql = format!(
        "SELECT * FROM {} WHERE interpretation_id = ? ORDER BY allele_id",
        subject.snapshot_table()
    );
    Ok(sqlx::query_as::<_, InterpretationSnapshot>(&sql)
        .bind(interpretation_id)
        .fetch_all(conn)
        .await?)
}
