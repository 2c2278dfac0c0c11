//! Annotation storage and the typed shadow projection used by the filters.
//!
//! Shadow rows are written by the triggers in the embedded schema.  The only
//! application write to shadow tables is the recompute after the declared
//! frequency providers changed, see `sync_frequency_declarations`.

use std::collections::BTreeSet;

use serde_json::Value;
use sqlx::{types::Json, SqliteConnection, SqlitePool};

use crate::{
    conf::FrequencyConf,
    db::models::Annotation,
    err::{Error, Result},
};

pub mod projection;

use projection::{parse_filter_status, ExternalShadow, FrequencyShadow, Projection, TranscriptShadow};

/// Store `annotations` as the current annotation of `allele_id`.
///
/// A previously current annotation is superseded first; the triggers replace
/// the shadow rows within the same transaction.
pub async fn insert_annotation(
    pool: &SqlitePool,
    allele_id: i64,
    annotations: &Value,
    annotation_config_id: Option<i64>,
) -> Result<i64> {
    let mut tx = pool.begin().await?;
    let id = insert_annotation_in(&mut tx, allele_id, annotations, annotation_config_id).await?;
    tx.commit().await?;
    Ok(id)
}

/// Like `insert_annotation` but on a caller-managed connection or transaction.
pub async fn insert_annotation_in(
    conn: &mut SqliteConnection,
    allele_id: i64,
    annotations: &Value,
    annotation_config_id: Option<i64>,
) -> Result<i64> {
    if !annotations.is_object() {
        return Err(Error::Validation(format!(
            "annotation of allele {} must be a JSON object",
            allele_id
        )));
    }
    let now = chrono::Utc::now();
    let previous: Option<i64> = sqlx::query_scalar(
        "SELECT id FROM annotation WHERE allele_id = ? AND date_superceeded IS NULL",
    )
    .bind(allele_id)
    .fetch_optional(&mut *conn)
    .await?;
    if let Some(previous) = previous {
        sqlx::query("UPDATE annotation SET date_superceeded = ? WHERE id = ?")
            .bind(now)
            .bind(previous)
            .execute(&mut *conn)
            .await?;
    }
    let id = sqlx::query(
        "INSERT INTO annotation (allele_id, annotations, annotation_config_id, \
         previous_annotation_id, date_created) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(allele_id)
    .bind(Json(annotations))
    .bind(annotation_config_id)
    .bind(previous)
    .bind(now)
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();
    tracing::debug!(
        "annotation {} of allele {} stored, supersedes {:?}",
        id,
        allele_id,
        previous
    );
    Ok(id)
}

/// Current annotation of `allele_id`, if any.
pub async fn current_annotation(
    conn: &mut SqliteConnection,
    allele_id: i64,
) -> Result<Option<Annotation>> {
    Ok(sqlx::query_as::<_, Annotation>(
        "SELECT * FROM annotation WHERE allele_id = ? AND date_superceeded IS NULL",
    )
    .bind(allele_id)
    .fetch_optional(conn)
    .await?)
}

/// Declared `(provider, population)` pairs of the frequency shadow.
pub async fn declarations(conn: &mut SqliteConnection) -> Result<Vec<(String, String)>> {
    Ok(sqlx::query_as(
        "SELECT provider, population FROM annotationshadowfrequencydeclaration \
         ORDER BY provider, population",
    )
    .fetch_all(conn)
    .await?)
}

/// Bring the declaration in line with `conf`, recomputing frequency rows if
/// it changed.  Returns whether anything changed.
pub async fn sync_frequency_declarations(pool: &SqlitePool, conf: &FrequencyConf) -> Result<bool> {
    let configured = conf
        .groups
        .triples()
        .into_iter()
        .map(|(_, provider, population)| (provider.to_string(), population.to_string()))
        .collect::<BTreeSet<_>>();

    let mut tx = pool.begin().await?;
    let stored = declarations(&mut tx).await?.into_iter().collect::<BTreeSet<_>>();
    if stored == configured {
        tx.rollback().await?;
        return Ok(false);
    }

    tracing::info!(
        "frequency shadow declaration changes from {} to {} provider/population pairs",
        stored.len(),
        configured.len()
    );
    sqlx::query("DELETE FROM annotationshadowfrequencydeclaration")
        .execute(&mut *tx)
        .await?;
    for (provider, population) in &configured {
        sqlx::query(
            "INSERT INTO annotationshadowfrequencydeclaration (provider, population) VALUES (?, ?)",
        )
        .bind(provider)
        .bind(population)
        .execute(&mut *tx)
        .await?;
    }
    recompute_frequencies(&mut tx).await?;
    tx.commit().await?;
    Ok(true)
}

/// Rebuild all frequency shadow rows from the current annotations.
pub async fn recompute_frequencies(conn: &mut SqliteConnection) -> Result<u64> {
    let before = std::time::Instant::now();
    sqlx::query("DELETE FROM annotationshadowfrequency")
        .execute(&mut *conn)
        .await?;
    let inserted = sqlx::query(
        r#"
        INSERT INTO annotationshadowfrequency (
            allele_id, annotation_id, provider, population,
            freq, count, num, hom, hemi, filter_status
        )
        SELECT
            a.allele_id,
            a.id,
            decl.provider,
            decl.population,
            json_extract(a.annotations, '$.frequencies."' || decl.provider || '".freq."' || decl.population || '"'),
            json_extract(a.annotations, '$.frequencies."' || decl.provider || '".count."' || decl.population || '"'),
            json_extract(a.annotations, '$.frequencies."' || decl.provider || '".num."' || decl.population || '"'),
            json_extract(a.annotations, '$.frequencies."' || decl.provider || '".hom."' || decl.population || '"'),
            json_extract(a.annotations, '$.frequencies."' || decl.provider || '".hemi."' || decl.population || '"'),
            json_extract(a.annotations, '$.frequencies."' || decl.provider || '".filter."' || decl.population || '"')
        FROM annotation AS a
        CROSS JOIN annotationshadowfrequencydeclaration AS decl
        WHERE a.date_superceeded IS NULL
          AND json_extract(a.annotations, '$.frequencies."' || decl.provider || '".freq."' || decl.population || '"') IS NOT NULL
        "#,
    )
    .execute(&mut *conn)
    .await?
    .rows_affected();
    tracing::debug!(
        "recomputed {} frequency shadow rows in {:?}",
        inserted,
        before.elapsed()
    );
    Ok(inserted)
}

/// Stored shadow rows of `allele_id`.
pub async fn stored_projection(conn: &mut SqliteConnection, allele_id: i64) -> Result<Projection> {
    let transcripts = sqlx::query_as::<_, TranscriptShadow>(
        "SELECT hgnc_id, symbol, transcript, transcript_base, hgvsc, hgvsp, consequences, \
         exon_distance, coding_region_distance, in_last_exon, is_canonical \
         FROM annotationshadowtranscript WHERE allele_id = ?",
    )
    .bind(allele_id)
    .fetch_all(&mut *conn)
    .await?;

    #[allow(clippy::type_complexity)]
    let frequency_rows: Vec<(
        String,
        String,
        Option<f64>,
        Option<i64>,
        Option<i64>,
        Option<i64>,
        Option<i64>,
        Option<String>,
    )> = sqlx::query_as(
        "SELECT provider, population, freq, count, num, hom, hemi, filter_status \
         FROM annotationshadowfrequency WHERE allele_id = ?",
    )
    .bind(allele_id)
    .fetch_all(&mut *conn)
    .await?;
    let frequencies = frequency_rows
        .into_iter()
        .map(
            |(provider, population, freq, count, num, hom, hemi, filter_status)| FrequencyShadow {
                provider,
                population,
                freq,
                count,
                num,
                hom,
                hemi,
                filter_status: parse_filter_status(filter_status.as_deref()),
            },
        )
        .collect();

    let external_rows: Vec<(String, Json<Vec<String>>, Option<i64>)> = sqlx::query_as(
        "SELECT source, significance, num_stars FROM annotationshadowexternal WHERE allele_id = ?",
    )
    .bind(allele_id)
    .fetch_all(&mut *conn)
    .await?;
    let external = external_rows
        .into_iter()
        .map(|(source, significance, num_stars)| ExternalShadow {
            source,
            significance: significance.0,
            num_stars,
        })
        .collect();

    Ok(Projection {
        transcripts,
        frequencies,
        external,
    })
}

/// Whether two projections agree; frequencies are compared with a tolerance
/// as SQLite and serde may round decimal literals differently.
fn agree(lhs: &Projection, rhs: &Projection) -> bool {
    let same_freq = |a: Option<f64>, b: Option<f64>| match (a, b) {
        (Some(a), Some(b)) => (a - b).abs() <= 1e-12 * a.abs().max(b.abs()).max(1.0),
        (a, b) => a == b,
    };
    lhs.transcripts == rhs.transcripts
        && lhs.external == rhs.external
        && lhs.frequencies.len() == rhs.frequencies.len()
        && lhs
            .frequencies
            .iter()
            .zip(rhs.frequencies.iter())
            .all(|(a, b)| {
                same_freq(a.freq, b.freq)
                    && FrequencyShadow { freq: None, ..a.clone() }
                        == FrequencyShadow { freq: None, ..b.clone() }
            })
}

/// Check that the stored shadow rows of `allele_id` equal the projection of
/// its current annotation.
pub async fn verify_allele(pool: &SqlitePool, allele_id: i64) -> Result<bool> {
    let mut conn = pool.acquire().await?;
    let stored = stored_projection(&mut conn, allele_id).await?.normalized();
    let expected = match current_annotation(&mut conn, allele_id).await? {
        Some(annotation) => {
            let declarations = declarations(&mut conn).await?;
            projection::project(&annotation.annotations.0, &declarations).normalized()
        }
        None => Projection::default(),
    };
    let ok = agree(&stored, &expected);
    if !ok {
        tracing::warn!(
            "shadow of allele {} diverges from its annotation: stored {:?}, expected {:?}",
            allele_id,
            &stored,
            &expected
        );
    }
    Ok(ok)
}
