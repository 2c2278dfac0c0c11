//! Thin query layer over the shadow tables shared by the primitives.
//!
//! Id sets are bound as a single JSON array and expanded with `json_each`.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sqlx::{types::Json, QueryBuilder, Sqlite, SqliteConnection};

use crate::{
    common::GpKey,
    db::models::{Allele, GenotypeType},
    err::Result,
};

/// Bind value for a set of ids.
pub fn ids_json<'a>(ids: impl IntoIterator<Item = &'a i64>) -> Json<Vec<i64>> {
    Json(ids.into_iter().copied().collect())
}

/// Bind value for a list of strings.
pub fn strings_json<'a>(values: impl IntoIterator<Item = &'a String>) -> Json<Vec<String>> {
    Json(values.into_iter().cloned().collect())
}

/// Alleles by id.
pub async fn alleles(conn: &mut SqliteConnection, allele_ids: &BTreeSet<i64>) -> Result<Vec<Allele>> {
    Ok(sqlx::query_as::<_, Allele>(
        "SELECT id, genome_reference, chromosome, start_position, open_end_position, change_from, \
         change_to, change_type, vcf_pos, vcf_ref, vcf_alt, length, caller_type \
         FROM allele WHERE id IN (SELECT value FROM json_each(?))",
    )
    .bind(ids_json(allele_ids))
    .fetch_all(conn)
    .await?)
}

/// HGNC ids of the panel genes each allele overlaps, by transcript.
pub async fn allele_panel_genes(
    conn: &mut SqliteConnection,
    gp_key: &GpKey,
    allele_ids: &BTreeSet<i64>,
) -> Result<BTreeMap<i64, BTreeSet<i64>>> {
    let rows: Vec<(i64, i64)> = sqlx::query_as(
        r#"
        SELECT DISTINCT ast.allele_id, t.gene_id
        FROM annotationshadowtranscript AS ast
        JOIN transcript AS t ON t.transcript_base = ast.transcript_base
        JOIN genepanel_transcript AS gt ON gt.transcript_id = t.id
        WHERE gt.genepanel_name = ? AND gt.genepanel_version = ?
          AND ast.allele_id IN (SELECT value FROM json_each(?))
        "#,
    )
    .bind(&gp_key.name)
    .bind(&gp_key.version)
    .bind(ids_json(allele_ids))
    .fetch_all(conn)
    .await?;
    let mut result: BTreeMap<i64, BTreeSet<i64>> = BTreeMap::new();
    for (allele_id, gene_id) in rows {
        result.entry(allele_id).or_default().insert(gene_id);
    }
    Ok(result)
}

/// Transcript shadow row as seen by the primitives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TranscriptRow {
    pub allele_id: i64,
    pub hgnc_id: Option<i64>,
    pub transcript: String,
    #[sqlx(json)]
    pub consequences: Vec<String>,
    pub exon_distance: Option<i64>,
    pub coding_region_distance: Option<i64>,
    /// Strand from the transcript table, if the transcript is known.
    pub strand: Option<String>,
}

/// Builder for queries over the transcript shadow.
///
/// Predicates are conjunctive; each one appends an `AND` clause.
pub struct TranscriptQuery<'args> {
    builder: QueryBuilder<'args, Sqlite>,
    transcript_regex: Option<regex::Regex>,
}

impl<'args> TranscriptQuery<'args> {
    /// Transcripts of the given alleles.
    pub fn new(allele_ids: &BTreeSet<i64>) -> Self {
        let mut builder = QueryBuilder::new(
            "SELECT DISTINCT ast.allele_id, ast.hgnc_id, ast.transcript, ast.consequences, \
             ast.exon_distance, ast.coding_region_distance, ",
        );
        builder.push(
            "(SELECT t.strand FROM transcript AS t WHERE t.transcript_base = ast.transcript_base \
             LIMIT 1) AS strand FROM annotationshadowtranscript AS ast ",
        );
        builder.push("WHERE ast.allele_id IN (SELECT value FROM json_each(");
        builder.push_bind(ids_json(allele_ids));
        builder.push("))");
        Self {
            builder,
            transcript_regex: None,
        }
    }

    /// Transcripts of the given alleles that belong to the panel, with strand.
    pub fn in_panel(allele_ids: &BTreeSet<i64>, gp_key: &GpKey) -> Self {
        let mut builder = QueryBuilder::new(
            "SELECT DISTINCT ast.allele_id, ast.hgnc_id, ast.transcript, ast.consequences, \
             ast.exon_distance, ast.coding_region_distance, t.strand AS strand \
             FROM annotationshadowtranscript AS ast \
             JOIN transcript AS t ON t.transcript_base = ast.transcript_base \
             JOIN genepanel_transcript AS gt ON gt.transcript_id = t.id \
             WHERE gt.genepanel_name = ",
        );
        builder.push_bind(gp_key.name.clone());
        builder.push(" AND gt.genepanel_version = ");
        builder.push_bind(gp_key.version.clone());
        builder.push(" AND ast.allele_id IN (SELECT value FROM json_each(");
        builder.push_bind(ids_json(allele_ids));
        builder.push("))");
        Self {
            builder,
            transcript_regex: None,
        }
    }

    /// Either of the two constructors.
    pub fn scoped(allele_ids: &BTreeSet<i64>, gp_key: &GpKey, genepanel_only: bool) -> Self {
        if genepanel_only {
            Self::in_panel(allele_ids, gp_key)
        } else {
            Self::new(allele_ids)
        }
    }

    /// Keep transcripts whose consequences intersect `consequences`.
    pub fn consequences_overlap(mut self, consequences: &[String]) -> Self {
        self.builder.push(
            " AND EXISTS (SELECT 1 FROM json_each(ast.consequences) AS c \
             WHERE c.value IN (SELECT value FROM json_each(",
        );
        self.builder.push_bind(strings_json(consequences));
        self.builder.push(")))");
        self
    }

    /// Keep transcripts in region: an accepted consequence, or both distances
    /// inside their windows where a missing distance counts as inside.
    pub fn in_region(
        mut self,
        consequences: &[String],
        splice_region: (i64, i64),
        utr_region: (i64, i64),
    ) -> Self {
        self.builder.push(
            " AND (EXISTS (SELECT 1 FROM json_each(ast.consequences) AS c \
             WHERE c.value IN (SELECT value FROM json_each(",
        );
        self.builder.push_bind(strings_json(consequences));
        self.builder
            .push("))) OR ((ast.exon_distance IS NULL OR ast.exon_distance BETWEEN ");
        self.builder.push_bind(splice_region.0);
        self.builder.push(" AND ");
        self.builder.push_bind(splice_region.1);
        self.builder.push(
            ") AND (ast.coding_region_distance IS NULL OR ast.coding_region_distance BETWEEN ",
        );
        self.builder.push_bind(utr_region.0);
        self.builder.push(" AND ");
        self.builder.push_bind(utr_region.1);
        self.builder.push(")))");
        self
    }

    /// Keep transcripts whose exon distance lies in `[lo, hi]`.
    pub fn exon_distance_between(mut self, lo: i64, hi: i64) -> Self {
        self.builder.push(" AND ast.exon_distance BETWEEN ");
        self.builder.push_bind(lo);
        self.builder.push(" AND ");
        self.builder.push_bind(hi);
        self
    }

    /// Keep transcripts whose name matches `regex`; evaluated after fetching.
    pub fn transcript_matches(mut self, regex: Option<regex::Regex>) -> Self {
        self.transcript_regex = regex;
        self
    }

    pub async fn fetch(mut self, conn: &mut SqliteConnection) -> Result<Vec<TranscriptRow>> {
        let mut rows = self
            .builder
            .build_query_as::<TranscriptRow>()
            .fetch_all(conn)
            .await?;
        if let Some(regex) = &self.transcript_regex {
            rows.retain(|row| regex.is_match(&row.transcript));
        }
        Ok(rows)
    }

    /// Distinct allele ids of the matching transcripts.
    pub async fn fetch_allele_ids(self, conn: &mut SqliteConnection) -> Result<BTreeSet<i64>> {
        Ok(self
            .fetch(conn)
            .await?
            .into_iter()
            .map(|row| row.allele_id)
            .collect())
    }
}

/// Compile an optional transcript regex as a full match.
pub fn transcript_regex(pattern: Option<&str>) -> Result<Option<regex::Regex>> {
    pattern
        .map(|pattern| {
            regex::Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| {
                crate::err::Error::FilterConfiguration(format!(
                    "invalid transcript regex {:?}: {}",
                    pattern, e
                ))
            })
        })
        .transpose()
}

/// Genotype of one sample at one allele in an analysis.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct SampleGenotype {
    pub allele_id: i64,
    pub proband_sample_id: i64,
    pub sample_id: i64,
    pub proband: bool,
    #[sqlx(rename = "type")]
    pub gt: GenotypeType,
    pub variant_quality: Option<f64>,
    pub filter_status: Option<String>,
    pub allele_ratio: Option<f64>,
}

/// Alleles the probands of the analysis carry heterozygous or homozygous.
pub async fn proband_variant_allele_ids(
    conn: &mut SqliteConnection,
    analysis_id: i64,
) -> Result<BTreeSet<i64>> {
    let allele_ids: Vec<i64> = sqlx::query_scalar(
        "SELECT DISTINCT allele_id FROM allele_sample_genotype \
         WHERE analysis_id = ? AND proband AND sample_id = proband_sample_id \
         AND type IN ('Heterozygous', 'Homozygous')",
    )
    .bind(analysis_id)
    .fetch_all(conn)
    .await?;
    Ok(allele_ids.into_iter().collect())
}

/// Genotypes of all samples of the analysis at the given alleles.
pub async fn sample_genotypes(
    conn: &mut SqliteConnection,
    analysis_id: i64,
    allele_ids: &BTreeSet<i64>,
) -> Result<Vec<SampleGenotype>> {
    Ok(sqlx::query_as::<_, SampleGenotype>(
        "SELECT allele_id, proband_sample_id, sample_id, proband, type, variant_quality, \
         filter_status, allele_ratio FROM allele_sample_genotype \
         WHERE analysis_id = ? AND allele_id IN (SELECT value FROM json_each(?))",
    )
    .bind(analysis_id)
    .bind(ids_json(allele_ids))
    .fetch_all(conn)
    .await?)
}
