//! Fixtures shared by the unit tests.

use serde_json::Value;
use sqlx::{types::Json, SqlitePool};

use crate::{
    common::GpKey,
    conf::Config,
    db::{
        self,
        models::{CallerType, Classification, GenotypeType, Sex},
    },
    err::Result,
    shadow,
};

/// In-memory database with schema and default configuration.
pub async fn pool() -> Result<SqlitePool> {
    pool_with(&Config::default()).await
}

/// In-memory database initialized with `config`.
pub async fn pool_with(config: &Config) -> Result<SqlitePool> {
    let pool = db::connect_memory().await?;
    db::init(&pool, config).await?;
    Ok(pool)
}

/// Create a user, along with its group if needed.  Returns `(usergroup_id, user_id)`.
pub async fn user(pool: &SqlitePool, username: &str, usergroup: &str) -> Result<(i64, i64)> {
    sqlx::query("INSERT OR IGNORE INTO usergroup (name) VALUES (?)")
        .bind(usergroup)
        .execute(pool)
        .await?;
    let usergroup_id: i64 = sqlx::query_scalar("SELECT id FROM usergroup WHERE name = ?")
        .bind(usergroup)
        .fetch_one(pool)
        .await?;
    let user_id = sqlx::query("INSERT INTO user (username, usergroup_id) VALUES (?, ?)")
        .bind(username)
        .bind(usergroup_id)
        .execute(pool)
        .await?
        .last_insert_rowid();
    Ok((usergroup_id, user_id))
}

/// Create an SNV (length 1) or deletion allele at `chrom:pos`.
pub async fn allele(pool: &SqlitePool, chrom: &str, pos: i64, length: i64) -> Result<i64> {
    allele_with(pool, chrom, pos, length, CallerType::Snv).await
}

pub async fn allele_with(
    pool: &SqlitePool,
    chrom: &str,
    pos: i64,
    length: i64,
    caller_type: CallerType,
) -> Result<i64> {
    let (change_type, change_from, change_to) = if length == 1 {
        ("SNP", String::from("A"), String::from("G"))
    } else {
        ("del", "A".repeat(length as usize), String::new())
    };
    let id = sqlx::query(
        "INSERT INTO allele (chromosome, start_position, open_end_position, change_from, \
         change_to, change_type, vcf_pos, vcf_ref, vcf_alt, length, caller_type) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(chrom)
    .bind(pos - 1)
    .bind(pos - 1 + length)
    .bind(&change_from)
    .bind(&change_to)
    .bind(change_type)
    .bind(pos)
    .bind(format!("T{}", change_from))
    .bind("T")
    .bind(length)
    .bind(caller_type)
    .execute(pool)
    .await?
    .last_insert_rowid();
    Ok(id)
}

/// Store `blob` as current annotation of `allele_id`.
pub async fn annotate(pool: &SqlitePool, allele_id: i64, blob: Value) -> Result<i64> {
    shadow::insert_annotation(pool, allele_id, &blob, None).await
}

/// Annotation blob with one transcript and frequency entries.
pub fn blob(
    hgnc_id: i64,
    transcript: &str,
    consequences: &[&str],
    frequencies: Value,
) -> Value {
    serde_json::json!({
        "frequencies": frequencies,
        "transcripts": [{
            "hgnc_id": hgnc_id,
            "symbol": format!("GENE{}", hgnc_id),
            "transcript": transcript,
            "consequences": consequences,
            "exon_distance": 0,
            "coding_region_distance": 0,
        }],
    })
}

pub async fn genepanel(pool: &SqlitePool, name: &str, version: &str, config: Value) -> Result<GpKey> {
    sqlx::query(
        "INSERT INTO genepanel (name, version, genome_reference, official, config, date_created) \
         VALUES (?, ?, 'GRCh37', 1, ?, ?)",
    )
    .bind(name)
    .bind(version)
    .bind(Json(config))
    .bind(chrono::Utc::now())
    .execute(pool)
    .await?;
    Ok(GpKey::new(name, version))
}

/// Add a gene with one transcript and phenotypes of the given inheritances
/// to the panel.  Returns the transcript id.
pub async fn panel_gene(
    pool: &SqlitePool,
    gp_key: &GpKey,
    hgnc_id: i64,
    transcript: &str,
    strand: &str,
    inheritances: &[&str],
) -> Result<i64> {
    sqlx::query("INSERT OR IGNORE INTO gene (hgnc_id, hgnc_symbol) VALUES (?, ?)")
        .bind(hgnc_id)
        .bind(format!("GENE{}", hgnc_id))
        .execute(pool)
        .await?;
    sqlx::query(
        "INSERT OR IGNORE INTO transcript (gene_id, transcript_name, chromosome, strand, tx_start, tx_end) \
         VALUES (?, ?, '13', ?, 1, 100000000)",
    )
    .bind(hgnc_id)
    .bind(transcript)
    .bind(strand)
    .execute(pool)
    .await?;
    let transcript_id: i64 =
        sqlx::query_scalar("SELECT id FROM transcript WHERE transcript_name = ?")
            .bind(transcript)
            .fetch_one(pool)
            .await?;
    sqlx::query(
        "INSERT INTO genepanel_transcript (genepanel_name, genepanel_version, transcript_id) \
         VALUES (?, ?, ?)",
    )
    .bind(&gp_key.name)
    .bind(&gp_key.version)
    .bind(transcript_id)
    .execute(pool)
    .await?;
    for inheritance in inheritances {
        let phenotype_id = sqlx::query(
            "INSERT INTO phenotype (gene_id, description, inheritance) VALUES (?, 'phenotype', ?)",
        )
        .bind(hgnc_id)
        .bind(*inheritance)
        .execute(pool)
        .await?
        .last_insert_rowid();
        sqlx::query(
            "INSERT INTO genepanel_phenotype (genepanel_name, genepanel_version, phenotype_id) \
             VALUES (?, ?, ?)",
        )
        .bind(&gp_key.name)
        .bind(&gp_key.version)
        .bind(phenotype_id)
        .execute(pool)
        .await?;
    }
    Ok(transcript_id)
}

pub async fn analysis(pool: &SqlitePool, name: &str, gp_key: &GpKey) -> Result<i64> {
    let id = sqlx::query(
        "INSERT INTO analysis (name, genepanel_name, genepanel_version, date_deposited) \
         VALUES (?, ?, ?, ?)",
    )
    .bind(name)
    .bind(&gp_key.name)
    .bind(&gp_key.version)
    .bind(chrono::Utc::now())
    .execute(pool)
    .await?
    .last_insert_rowid();
    Ok(id)
}

/// Parents of a sample, by sample id.
#[derive(Debug, Clone, Copy, Default)]
pub struct Parents {
    pub father_id: Option<i64>,
    pub mother_id: Option<i64>,
}

pub async fn sample(
    pool: &SqlitePool,
    analysis_id: i64,
    identifier: &str,
    proband: bool,
    affected: bool,
    sex: Sex,
    parents: Parents,
) -> Result<i64> {
    let id = sqlx::query(
        "INSERT INTO sample (identifier, analysis_id, proband, affected, sex, family_id, \
         father_id, mother_id, date_deposited) VALUES (?, ?, ?, ?, ?, 'FAM', ?, ?, ?)",
    )
    .bind(identifier)
    .bind(analysis_id)
    .bind(proband)
    .bind(affected)
    .bind(sex)
    .bind(parents.father_id)
    .bind(parents.mother_id)
    .bind(chrono::Utc::now())
    .execute(pool)
    .await?
    .last_insert_rowid();
    Ok(id)
}

/// Sample ids of a trio.
#[derive(Debug, Clone, Copy)]
pub struct Trio {
    pub proband: i64,
    pub father: i64,
    pub mother: i64,
}

/// Create an unaffected father and mother and an affected proband of `sex`.
pub async fn trio(pool: &SqlitePool, analysis_id: i64, sex: Sex) -> Result<Trio> {
    let father = sample(pool, analysis_id, "father", false, false, Sex::Male, Parents::default()).await?;
    let mother = sample(pool, analysis_id, "mother", false, false, Sex::Female, Parents::default()).await?;
    let proband = sample(
        pool,
        analysis_id,
        "proband",
        true,
        true,
        sex,
        Parents {
            father_id: Some(father),
            mother_id: Some(mother),
        },
    )
    .await?;
    Ok(Trio {
        proband,
        father,
        mother,
    })
}

/// Genotype of the proband sample at `allele_id`.  Returns the genotype id.
pub async fn genotype(
    pool: &SqlitePool,
    proband_id: i64,
    allele_id: i64,
    gt: GenotypeType,
    variant_quality: Option<f64>,
    allele_ratio: Option<f64>,
) -> Result<i64> {
    let genotype_id = sqlx::query(
        "INSERT INTO genotype (allele_id, sample_id, variant_quality, filter_status) \
         VALUES (?, ?, ?, 'PASS')",
    )
    .bind(allele_id)
    .bind(proband_id)
    .bind(variant_quality)
    .execute(pool)
    .await?
    .last_insert_rowid();
    sample_data(pool, genotype_id, proband_id, gt, allele_ratio).await?;
    Ok(genotype_id)
}

/// Per-sample data of a family member on the proband genotype `genotype_id`.
pub async fn sample_data(
    pool: &SqlitePool,
    genotype_id: i64,
    sample_id: i64,
    gt: GenotypeType,
    allele_ratio: Option<f64>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO genotypesampledata (genotype_id, sample_id, type, allele_ratio, sequencing_depth) \
         VALUES (?, ?, ?, ?, 30)",
    )
    .bind(genotype_id)
    .bind(sample_id)
    .bind(gt)
    .bind(allele_ratio)
    .execute(pool)
    .await?;
    Ok(())
}

/// Current allele assessment of `allele_id` created at `date_created`.
pub async fn assessment(
    pool: &SqlitePool,
    allele_id: i64,
    user_id: i64,
    classification: Classification,
    date_created: chrono::DateTime<chrono::Utc>,
) -> Result<i64> {
    let id = sqlx::query(
        "INSERT INTO alleleassessment (allele_id, classification, user_id, genepanel_name, \
         genepanel_version, date_created) VALUES (?, ?, ?, 'HBOC', 'v01', ?)",
    )
    .bind(allele_id)
    .bind(classification)
    .bind(user_id)
    .bind(date_created)
    .execute(pool)
    .await?
    .last_insert_rowid();
    Ok(id)
}
