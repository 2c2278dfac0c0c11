//! Row types and enumerations of the relational store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;

/// Variant caller that produced an allele.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    sqlx::Type,
)]
pub enum CallerType {
    #[serde(rename = "SNV")]
    #[strum(serialize = "SNV")]
    #[sqlx(rename = "SNV")]
    Snv,
    #[serde(rename = "CNV")]
    #[strum(serialize = "CNV")]
    #[sqlx(rename = "CNV")]
    Cnv,
}

/// Classification of an allele assessment.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    sqlx::Type,
)]
pub enum Classification {
    #[serde(rename = "1")]
    #[strum(serialize = "1")]
    #[sqlx(rename = "1")]
    Class1,
    #[serde(rename = "2")]
    #[strum(serialize = "2")]
    #[sqlx(rename = "2")]
    Class2,
    #[serde(rename = "3")]
    #[strum(serialize = "3")]
    #[sqlx(rename = "3")]
    Class3,
    #[serde(rename = "4")]
    #[strum(serialize = "4")]
    #[sqlx(rename = "4")]
    Class4,
    #[serde(rename = "5")]
    #[strum(serialize = "5")]
    #[sqlx(rename = "5")]
    Class5,
    /// Not provided.
    #[serde(rename = "NP")]
    #[strum(serialize = "NP")]
    #[sqlx(rename = "NP")]
    NotProvided,
    /// Drug response.
    #[serde(rename = "DR")]
    #[strum(serialize = "DR")]
    #[sqlx(rename = "DR")]
    DrugResponse,
    /// Risk factor.
    #[serde(rename = "RF")]
    #[strum(serialize = "RF")]
    #[sqlx(rename = "RF")]
    RiskFactor,
}

/// Genotype of one sample at one allele.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    sqlx::Type,
)]
pub enum GenotypeType {
    Homozygous,
    Heterozygous,
    Reference,
    #[serde(rename = "No coverage")]
    #[strum(serialize = "No coverage")]
    #[sqlx(rename = "No coverage")]
    NoCoverage,
}

impl GenotypeType {
    /// Whether the sample carries the alternative allele.
    pub fn is_variant(&self) -> bool {
        matches!(self, GenotypeType::Homozygous | GenotypeType::Heterozygous)
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    sqlx::Type,
)]
pub enum Sex {
    Male,
    Female,
}

/// Progress of one interpretation round.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    sqlx::Type,
)]
pub enum InterpretationStatus {
    #[serde(rename = "Not started")]
    #[strum(serialize = "Not started")]
    #[sqlx(rename = "Not started")]
    NotStarted,
    Ongoing,
    Done,
}

/// Stage of the review process an interpretation round belongs to.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    sqlx::Type,
)]
pub enum WorkflowStatus {
    #[serde(rename = "Not ready")]
    #[strum(serialize = "Not ready")]
    #[sqlx(rename = "Not ready")]
    NotReady,
    Interpretation,
    Review,
    #[serde(rename = "Medical review")]
    #[strum(serialize = "Medical review")]
    #[sqlx(rename = "Medical review")]
    MedicalReview,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Allele {
    pub id: i64,
    pub genome_reference: String,
    pub chromosome: String,
    pub start_position: i64,
    pub open_end_position: i64,
    pub change_from: String,
    pub change_to: String,
    pub change_type: String,
    pub vcf_pos: i64,
    pub vcf_ref: String,
    pub vcf_alt: String,
    pub length: i64,
    pub caller_type: CallerType,
}

/// An allele that has not been persisted yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAllele {
    pub genome_reference: String,
    pub chromosome: String,
    pub start_position: i64,
    pub open_end_position: i64,
    pub change_from: String,
    pub change_to: String,
    pub change_type: String,
    pub vcf_pos: i64,
    pub vcf_ref: String,
    pub vcf_alt: String,
    pub length: i64,
    pub caller_type: CallerType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Annotation {
    pub id: i64,
    pub allele_id: i64,
    pub annotations: Json<serde_json::Value>,
    pub annotation_config_id: Option<i64>,
    pub previous_annotation_id: Option<i64>,
    pub date_created: DateTime<Utc>,
    pub date_superceeded: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Genepanel {
    pub name: String,
    pub version: String,
    pub genome_reference: String,
    pub official: bool,
    pub config: Json<serde_json::Value>,
    pub date_created: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Analysis {
    pub id: i64,
    pub name: String,
    pub genepanel_name: String,
    pub genepanel_version: String,
    pub warnings: Option<String>,
    pub date_deposited: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Sample {
    pub id: i64,
    pub identifier: String,
    pub analysis_id: i64,
    pub proband: bool,
    pub affected: bool,
    pub sex: Option<Sex>,
    pub family_id: Option<String>,
    pub father_id: Option<i64>,
    pub mother_id: Option<i64>,
    pub sibling_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct AlleleAssessment {
    pub id: i64,
    pub allele_id: i64,
    pub classification: Classification,
    pub evaluation: Json<serde_json::Value>,
    pub user_id: i64,
    pub usergroup_id: Option<i64>,
    pub genepanel_name: String,
    pub genepanel_version: String,
    pub analysis_id: Option<i64>,
    pub annotation_id: Option<i64>,
    pub custom_annotation_id: Option<i64>,
    pub previous_assessment_id: Option<i64>,
    pub date_created: DateTime<Utc>,
    pub date_superceeded: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ReferenceAssessment {
    pub id: i64,
    pub allele_id: i64,
    pub reference_id: i64,
    pub evaluation: Json<serde_json::Value>,
    pub user_id: i64,
    pub genepanel_name: String,
    pub genepanel_version: String,
    pub previous_assessment_id: Option<i64>,
    pub date_created: DateTime<Utc>,
    pub date_superceeded: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct AlleleReport {
    pub id: i64,
    pub allele_id: i64,
    pub evaluation: Json<serde_json::Value>,
    pub user_id: i64,
    pub alleleassessment_id: Option<i64>,
    pub previous_report_id: Option<i64>,
    pub date_created: DateTime<Utc>,
    pub date_superceeded: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct GeneAssessment {
    pub id: i64,
    pub gene_id: i64,
    pub evaluation: Json<serde_json::Value>,
    pub user_id: i64,
    pub genepanel_name: String,
    pub genepanel_version: String,
    pub previous_assessment_id: Option<i64>,
    pub date_created: DateTime<Utc>,
    pub date_superceeded: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CustomAnnotation {
    pub id: i64,
    pub allele_id: i64,
    pub annotations: Json<serde_json::Value>,
    pub user_id: i64,
    pub previous_annotation_id: Option<i64>,
    pub date_created: DateTime<Utc>,
    pub date_superceeded: Option<DateTime<Utc>>,
}

/// One interpretation round, of either an analysis or a single allele.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Interpretation {
    pub id: i64,
    /// Analysis id or allele id, depending on the table.
    pub subject_id: i64,
    pub genepanel_name: String,
    pub genepanel_version: String,
    pub user_id: Option<i64>,
    pub status: InterpretationStatus,
    pub workflow_status: WorkflowStatus,
    pub finalized: bool,
    pub state: Json<serde_json::Value>,
    pub user_state: Json<serde_json::Value>,
    pub filterconfig_id: Option<i64>,
    pub date_created: DateTime<Utc>,
    pub date_last_update: DateTime<Utc>,
}

/// Per-allele record written on finalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct InterpretationSnapshot {
    pub id: i64,
    pub interpretation_id: i64,
    pub allele_id: i64,
    /// Name of the filter that removed the allele, `None` if it was interpreted.
    pub filtered: Option<String>,
    pub alleleassessment_id: Option<i64>,
    pub allelereport_id: Option<i64>,
    pub annotation_id: Option<i64>,
    pub customannotation_id: Option<i64>,
    pub date_created: DateTime<Utc>,
}
