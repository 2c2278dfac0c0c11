//! Append-only lifecycle of assessments, reports and custom annotations.
//!
//! Every kind keeps at most one current row per natural key.  A new record
//! supersedes the current one and links to it; the partial unique indexes of
//! the schema turn a racing insert into a `ConcurrencyConflict`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{types::Json, SqliteConnection, SqlitePool};

use crate::{
    common::GpKey,
    db::models::{AlleleAssessment, AlleleReport, Classification, CustomAnnotation, GeneAssessment, ReferenceAssessment},
    err::{Error, Result},
};

/// Client decision for one record.
///
/// `presented_id` is the id of the current record the client has seen and
/// acts as optimistic-concurrency token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Decision<T> {
    /// Keep the current record.
    Reuse { presented_id: i64 },
    /// Supersede the current record, if any, with `data`.
    New {
        #[serde(default)]
        presented_id: Option<i64>,
        data: T,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAlleleAssessment {
    pub classification: Classification,
    #[serde(default)]
    pub evaluation: Value,
    /// References whose current reference assessments are attached.
    #[serde(default)]
    pub reference_ids: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewReferenceAssessment {
    #[serde(default)]
    pub evaluation: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAlleleReport {
    #[serde(default)]
    pub evaluation: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewGeneAssessment {
    #[serde(default)]
    pub evaluation: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCustomAnnotation {
    pub annotations: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceDecision {
    pub allele_id: i64,
    pub reference_id: i64,
    pub decision: Decision<NewReferenceAssessment>,
}

/// All decisions submitted together, e.g. on finalize.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Decisions {
    /// By allele id.
    pub alleleassessments: BTreeMap<i64, Decision<NewAlleleAssessment>>,
    pub referenceassessments: Vec<ReferenceDecision>,
    /// By allele id.
    pub allelereports: BTreeMap<i64, Decision<NewAlleleReport>>,
    /// By HGNC id.
    pub geneassessments: BTreeMap<i64, Decision<NewGeneAssessment>>,
    /// By allele id.
    pub customannotations: BTreeMap<i64, Decision<NewCustomAnnotation>>,
}

/// Who records the decisions and in which context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Author {
    pub user_id: i64,
    pub usergroup_id: Option<i64>,
    pub genepanel: GpKey,
    pub analysis_id: Option<i64>,
}

/// Resulting current record ids.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Committed {
    pub alleleassessments: BTreeMap<i64, i64>,
    pub referenceassessments: BTreeMap<(i64, i64), i64>,
    pub allelereports: BTreeMap<i64, i64>,
    pub geneassessments: BTreeMap<i64, i64>,
    pub customannotations: BTreeMap<i64, i64>,
    /// Number of rows inserted over all kinds.
    pub created: usize,
}

/// Table of an append-only kind; names are static and never user input.
struct Kind {
    table: &'static str,
    label: &'static str,
    key: &'static [&'static str],
}

const ALLELEASSESSMENT: Kind = Kind {
    table: "alleleassessment",
    label: "allele assessment",
    key: &["allele_id"],
};
const REFERENCEASSESSMENT: Kind = Kind {
    table: "referenceassessment",
    label: "reference assessment",
    key: &["allele_id", "reference_id"],
};
const ALLELEREPORT: Kind = Kind {
    table: "allelereport",
    label: "allele report",
    key: &["allele_id"],
};
const GENEASSESSMENT: Kind = Kind {
    table: "geneassessment",
    label: "gene assessment",
    key: &["gene_id"],
};
const CUSTOMANNOTATION: Kind = Kind {
    table: "customannotation",
    label: "custom annotation",
    key: &["allele_id"],
};

impl Kind {
    async fn current_id(&self, conn: &mut SqliteConnection, key: &[i64]) -> Result<Option<i64>> {
        let predicate = self
            .key
            .iter()
            .map(|column| format!("{} = ?", column))
            .collect::<Vec<_>>()
            .join(" AND ");
        let sql = format!(
            "SELECT id FROM {} WHERE {} AND date_superceeded IS NULL",
            self.table, predicate
        );
        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        for value in key {
            query = query.bind(*value);
        }
        Ok(query.fetch_optional(conn).await?)
    }

    async fn supersede(&self, conn: &mut SqliteConnection, id: i64, now: DateTime<Utc>) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET date_superceeded = ? WHERE id = ? AND date_superceeded IS NULL",
            self.table
        );
        let result = sqlx::query(&sql).bind(now).bind(id).execute(conn).await?;
        if result.rows_affected() != 1 {
            return Err(Error::ConcurrencyConflict(format!(
                "{} {} was superseded concurrently",
                self.label, id
            )));
        }
        Ok(())
    }

    /// Check `decision` against the current row; supersede it for a new record.
    async fn resolve<'d, T>(
        &self,
        conn: &mut SqliteConnection,
        key: &[i64],
        decision: &'d Decision<T>,
        now: DateTime<Utc>,
    ) -> Result<Resolution<'d, T>> {
        let current = self.current_id(&mut *conn, key).await?;
        match decision {
            Decision::Reuse { presented_id } => {
                if current == Some(*presented_id) {
                    Ok(Resolution::Reused(*presented_id))
                } else {
                    Err(Error::ConcurrencyConflict(format!(
                        "{} {} presented for {:?} is not current (current: {:?})",
                        self.label, presented_id, key, current
                    )))
                }
            }
            Decision::New { presented_id, data } => {
                if current != *presented_id {
                    return Err(Error::ConcurrencyConflict(format!(
                        "{} {:?} presented for {:?} is not current (current: {:?})",
                        self.label, presented_id, key, current
                    )));
                }
                if let Some(current) = current {
                    self.supersede(&mut *conn, current, now).await?;
                }
                Ok(Resolution::Insert {
                    previous: current,
                    data,
                })
            }
        }
    }
}

enum Resolution<'d, T> {
    Reused(i64),
    Insert { previous: Option<i64>, data: &'d T },
}

async fn commit_referenceassessment(
    conn: &mut SqliteConnection,
    author: &Author,
    decision: &ReferenceDecision,
    now: DateTime<Utc>,
    committed: &mut Committed,
) -> Result<()> {
    let key = [decision.allele_id, decision.reference_id];
    let id = match REFERENCEASSESSMENT
        .resolve(&mut *conn, &key, &decision.decision, now)
        .await?
    {
        Resolution::Reused(id) => id,
        Resolution::Insert { previous, data } => {
            committed.created += 1;
            sqlx::query(
                "INSERT INTO referenceassessment (allele_id, reference_id, evaluation, user_id, \
                 usergroup_id, genepanel_name, genepanel_version, analysis_id, \
                 previous_assessment_id, date_created) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(decision.allele_id)
            .bind(decision.reference_id)
            .bind(Json(&data.evaluation))
            .bind(author.user_id)
            .bind(author.usergroup_id)
            .bind(&author.genepanel.name)
            .bind(&author.genepanel.version)
            .bind(author.analysis_id)
            .bind(previous)
            .bind(now)
            .execute(&mut *conn)
            .await?
            .last_insert_rowid()
        }
    };
    committed
        .referenceassessments
        .insert((decision.allele_id, decision.reference_id), id);
    Ok(())
}

async fn commit_alleleassessment(
    conn: &mut SqliteConnection,
    author: &Author,
    allele_id: i64,
    decision: &Decision<NewAlleleAssessment>,
    now: DateTime<Utc>,
    committed: &mut Committed,
) -> Result<()> {
    let id = match ALLELEASSESSMENT
        .resolve(&mut *conn, &[allele_id], decision, now)
        .await?
    {
        Resolution::Reused(id) => id,
        Resolution::Insert { previous, data } => {
            let annotation_id: Option<i64> = sqlx::query_scalar(
                "SELECT id FROM annotation WHERE allele_id = ? AND date_superceeded IS NULL",
            )
            .bind(allele_id)
            .fetch_optional(&mut *conn)
            .await?;
            let custom_annotation_id = CUSTOMANNOTATION.current_id(&mut *conn, &[allele_id]).await?;
            let id = sqlx::query(
                "INSERT INTO alleleassessment (allele_id, classification, evaluation, user_id, \
                 usergroup_id, genepanel_name, genepanel_version, analysis_id, annotation_id, \
                 custom_annotation_id, previous_assessment_id, date_created) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(allele_id)
            .bind(data.classification)
            .bind(Json(&data.evaluation))
            .bind(author.user_id)
            .bind(author.usergroup_id)
            .bind(&author.genepanel.name)
            .bind(&author.genepanel.version)
            .bind(author.analysis_id)
            .bind(annotation_id)
            .bind(custom_annotation_id)
            .bind(previous)
            .bind(now)
            .execute(&mut *conn)
            .await?
            .last_insert_rowid();

            for reference_id in &data.reference_ids {
                let referenceassessment_id = REFERENCEASSESSMENT
                    .current_id(&mut *conn, &[allele_id, *reference_id])
                    .await?
                    .ok_or_else(|| {
                        Error::Validation(format!(
                            "allele {} has no reference assessment for reference {}",
                            allele_id, reference_id
                        ))
                    })?;
                sqlx::query(
                    "INSERT INTO alleleassessment_referenceassessment \
                     (alleleassessment_id, referenceassessment_id) VALUES (?, ?)",
                )
                .bind(id)
                .bind(referenceassessment_id)
                .execute(&mut *conn)
                .await?;
            }
            committed.created += 1;
            tracing::debug!(
                "allele assessment {} of allele {} classified {}, supersedes {:?}",
                id,
                allele_id,
                data.classification,
                previous
            );
            id
        }
    };
    committed.alleleassessments.insert(allele_id, id);
    Ok(())
}

async fn commit_allelereport(
    conn: &mut SqliteConnection,
    author: &Author,
    allele_id: i64,
    decision: &Decision<NewAlleleReport>,
    now: DateTime<Utc>,
    committed: &mut Committed,
) -> Result<()> {
    let id = match ALLELEREPORT
        .resolve(&mut *conn, &[allele_id], decision, now)
        .await?
    {
        Resolution::Reused(id) => id,
        Resolution::Insert { previous, data } => {
            let alleleassessment_id = ALLELEASSESSMENT.current_id(&mut *conn, &[allele_id]).await?;
            committed.created += 1;
            sqlx::query(
                "INSERT INTO allelereport (allele_id, evaluation, user_id, usergroup_id, \
                 analysis_id, alleleassessment_id, previous_report_id, date_created) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(allele_id)
            .bind(Json(&data.evaluation))
            .bind(author.user_id)
            .bind(author.usergroup_id)
            .bind(author.analysis_id)
            .bind(alleleassessment_id)
            .bind(previous)
            .bind(now)
            .execute(&mut *conn)
            .await?
            .last_insert_rowid()
        }
    };
    committed.allelereports.insert(allele_id, id);
    Ok(())
}

async fn commit_geneassessment(
    conn: &mut SqliteConnection,
    author: &Author,
    gene_id: i64,
    decision: &Decision<NewGeneAssessment>,
    now: DateTime<Utc>,
    committed: &mut Committed,
) -> Result<()> {
    let id = match GENEASSESSMENT
        .resolve(&mut *conn, &[gene_id], decision, now)
        .await?
    {
        Resolution::Reused(id) => id,
        Resolution::Insert { previous, data } => {
            committed.created += 1;
            sqlx::query(
                "INSERT INTO geneassessment (gene_id, evaluation, user_id, usergroup_id, \
                 genepanel_name, genepanel_version, analysis_id, previous_assessment_id, \
                 date_created) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(gene_id)
            .bind(Json(&data.evaluation))
            .bind(author.user_id)
            .bind(author.usergroup_id)
            .bind(&author.genepanel.name)
            .bind(&author.genepanel.version)
            .bind(author.analysis_id)
            .bind(previous)
            .bind(now)
            .execute(&mut *conn)
            .await?
            .last_insert_rowid()
        }
    };
    committed.geneassessments.insert(gene_id, id);
    Ok(())
}

async fn commit_customannotation(
    conn: &mut SqliteConnection,
    author: &Author,
    allele_id: i64,
    decision: &Decision<NewCustomAnnotation>,
    now: DateTime<Utc>,
    committed: &mut Committed,
) -> Result<()> {
    let id = match CUSTOMANNOTATION
        .resolve(&mut *conn, &[allele_id], decision, now)
        .await?
    {
        Resolution::Reused(id) => id,
        Resolution::Insert { previous, data } => {
            if !data.annotations.is_object() {
                return Err(Error::Validation(format!(
                    "custom annotation of allele {} must be a JSON object",
                    allele_id
                )));
            }
            committed.created += 1;
            sqlx::query(
                "INSERT INTO customannotation (allele_id, annotations, user_id, \
                 previous_annotation_id, date_created) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(allele_id)
            .bind(Json(&data.annotations))
            .bind(author.user_id)
            .bind(previous)
            .bind(now)
            .execute(&mut *conn)
            .await?
            .last_insert_rowid()
        }
    };
    committed.customannotations.insert(allele_id, id);
    Ok(())
}

/// Apply `decisions` on an open transaction.
///
/// Custom annotations and reference assessments go first so new allele
/// assessments can link to them; reports go last and link to the assessment.
pub async fn commit_in(
    conn: &mut SqliteConnection,
    author: &Author,
    decisions: &Decisions,
) -> Result<Committed> {
    let now = Utc::now();
    let mut committed = Committed::default();
    for (allele_id, decision) in &decisions.customannotations {
        commit_customannotation(&mut *conn, author, *allele_id, decision, now, &mut committed).await?;
    }
    for decision in &decisions.referenceassessments {
        commit_referenceassessment(&mut *conn, author, decision, now, &mut committed).await?;
    }
    for (allele_id, decision) in &decisions.alleleassessments {
        commit_alleleassessment(&mut *conn, author, *allele_id, decision, now, &mut committed).await?;
    }
    for (allele_id, decision) in &decisions.allelereports {
        commit_allelereport(&mut *conn, author, *allele_id, decision, now, &mut committed).await?;
    }
    for (gene_id, decision) in &decisions.geneassessments {
        commit_geneassessment(&mut *conn, author, *gene_id, decision, now, &mut committed).await?;
    }
    tracing::info!(
        "committed decisions by user {}: {} new records",
        author.user_id,
        committed.created
    );
    Ok(committed)
}

/// Apply `decisions` in one transaction.
pub async fn commit(pool: &SqlitePool, author: &Author, decisions: &Decisions) -> Result<Committed> {
    let mut tx = pool.begin().await?;
    let committed = commit_in(&mut tx, author, decisions).await?;
    tx.commit().await?;
    Ok(committed)
}

/// Current allele assessment of `allele_id`.
pub async fn current_alleleassessment(
    conn: &mut SqliteConnection,
    allele_id: i64,
) -> Result<Option<AlleleAssessment>> {
    Ok(sqlx::query_as::<_, AlleleAssessment>(
        "SELECT * FROM alleleassessment WHERE allele_id = ? AND date_superceeded IS NULL",
    )
    .bind(allele_id)
    .fetch_optional(conn)
    .await?)
}

/// All allele assessments of `allele_id`, newest first.
pub async fn alleleassessment_history(
    conn: &mut SqliteConnection,
    allele_id: i64,
) -> Result<Vec<AlleleAssessment>> {
    Ok(sqlx::query_as::<_, AlleleAssessment>(
        "SELECT * FROM alleleassessment WHERE allele_id = ? ORDER BY id DESC",
    )
    .bind(allele_id)
    .fetch_all(conn)
    .await?)
}

/// Reference assessments attached to an allele assessment.
pub async fn linked_referenceassessments(
    conn: &mut SqliteConnection,
    alleleassessment_id: i64,
) -> Result<Vec<ReferenceAssessment>> {
    Ok(sqlx::query_as::<_, ReferenceAssessment>(
        "SELECT r.* FROM referenceassessment AS r \
         JOIN alleleassessment_referenceassessment AS l ON l.referenceassessment_id = r.id \
         WHERE l.alleleassessment_id = ? ORDER BY r.id",
    )
    .bind(alleleassessment_id)
    .fetch_all(conn)
    .await?)
}

pub async fn current_allelereport(
    conn: &mut SqliteConnection,
    allele_id: i64,
) -> Result<Option<AlleleReport>> {
    Ok(sqlx::query_as::<_, AlleleReport>(
        "SELECT * FROM allelereport WHERE allele_id = ? AND date_superceeded IS NULL",
    )
    .bind(allele_id)
    .fetch_optional(conn)
    .await?)
}

pub async fn current_geneassessment(
    conn: &mut SqliteConnection,
    gene_id: i64,
) -> Result<Option<GeneAssessment>> {
    Ok(sqlx::query_as::<_, GeneAssessment>(
        "SELECT * FROM geneassessment WHERE gene_id = ? AND date_superceeded IS NULL",
    )
    .bind(gene_id)
    .fetch_optional(conn)
    .await?)
}

pub async fn current_customannotation(
    conn: &mut SqliteConnection,
    allele_id: i64,
) -> Result<Option<CustomAnnotation>> {
    Ok(sqlx::query_as::<_, CustomAnnotation>(
        "SELECT * FROM customannotation WHERE allele_id = ? AND date_superceeded IS NULL",
    )
    .bind(allele_id)
    .fetch_optional(conn)
    .await?)
}
