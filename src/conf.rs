//! Code for the TOML configuration of the interpretation backend.

use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    db::models::{Classification, WorkflowStatus},
    err::{Error, Result},
};

/// Frequency groups distinguish public databases from in-house counts.
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
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FrequencyGroup {
    External,
    Internal,
}

/// Provider to populations mapping, per frequency group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrequencyGroups {
    #[serde(default)]
    pub external: IndexMap<String, Vec<String>>,
    #[serde(default)]
    pub internal: IndexMap<String, Vec<String>>,
}

impl Default for FrequencyGroups {
    fn default() -> Self {
        let populations = ["G", "AFR", "AMR", "ASJ", "EAS", "FIN", "NFE", "OTH", "SAS"]
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>();
        Self {
            external: IndexMap::from([
                (String::from("GNOMAD_GENOMES"), populations.clone()),
                (String::from("GNOMAD_EXOMES"), populations),
            ]),
            internal: IndexMap::from([(String::from("inDB"), vec![String::from("OUSWES")])]),
        }
    }
}

impl FrequencyGroups {
    /// Providers of the given group.
    pub fn get(&self, group: FrequencyGroup) -> &IndexMap<String, Vec<String>> {
        match group {
            FrequencyGroup::External => &self.external,
            FrequencyGroup::Internal => &self.internal,
        }
    }

    /// All `(group, provider, population)` triples in declaration order.
    pub fn triples(&self) -> Vec<(FrequencyGroup, &str, &str)> {
        let mut result = Vec::new();
        for (group, providers) in [
            (FrequencyGroup::External, &self.external),
            (FrequencyGroup::Internal, &self.internal),
        ] {
            for (provider, populations) in providers {
                for population in populations {
                    result.push((group, provider.as_str(), population.as_str()));
                }
            }
        }
        result
    }
}

/// Frequency provider declaration and observation count minimums.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrequencyConf {
    /// Declared providers and populations, drives the frequency shadow.
    pub groups: FrequencyGroups,
    /// Minimal `num` per provider and population for a frequency to count.
    pub num_thresholds: IndexMap<String, IndexMap<String, i64>>,
}

impl Default for FrequencyConf {
    fn default() -> Self {
        let gnomad = ["G", "AFR", "AMR", "ASJ", "EAS", "FIN", "NFE", "OTH", "SAS"]
            .iter()
            .map(|pop| (pop.to_string(), 5000))
            .collect::<IndexMap<_, _>>();
        Self {
            groups: Default::default(),
            num_thresholds: IndexMap::from([
                (String::from("GNOMAD_GENOMES"), gnomad.clone()),
                (String::from("GNOMAD_EXOMES"), gnomad),
            ]),
        }
    }
}

/// Settings for one classification value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationOption {
    pub value: Classification,
    /// Number of days after which an assessment of this class is outdated.
    #[serde(default)]
    pub outdated_after_days: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationConf {
    pub options: Vec<ClassificationOption>,
}

impl Default for ClassificationConf {
    fn default() -> Self {
        use Classification::*;
        let option = |value, days| ClassificationOption {
            value,
            outdated_after_days: days,
        };
        Self {
            options: vec![
                option(Class1, Some(365)),
                option(Class2, Some(365)),
                option(Class3, Some(180)),
                option(Class4, Some(180)),
                option(Class5, Some(180)),
                option(NotProvided, None),
                option(DrugResponse, None),
                option(RiskFactor, None),
            ],
        }
    }
}

impl ClassificationConf {
    /// Time to live of an assessment with the given class, if any.
    pub fn outdated_after(&self, classification: Classification) -> Option<chrono::Duration> {
        self.options
            .iter()
            .find(|option| option.value == classification)
            .and_then(|option| option.outdated_after_days)
            .map(chrono::Duration::days)
    }
}

/// Ensembl consequence terms, most severe first.
pub const CONSEQUENCES: &[&str] = &[
    "transcript_ablation",
    "splice_acceptor_variant",
    "splice_donor_variant",
    "stop_gained",
    "frameshift_variant",
    "stop_lost",
    "start_lost",
    "transcript_amplification",
    "inframe_insertion",
    "inframe_deletion",
    "missense_variant",
    "protein_altering_variant",
    "splice_region_variant",
    "splice_donor_5th_base_variant",
    "splice_donor_region_variant",
    "splice_polypyrimidine_tract_variant",
    "incomplete_terminal_codon_variant",
    "start_retained_variant",
    "stop_retained_variant",
    "synonymous_variant",
    "coding_sequence_variant",
    "mature_miRNA_variant",
    "5_prime_UTR_variant",
    "3_prime_UTR_variant",
    "non_coding_transcript_exon_variant",
    "intron_variant",
    "NMD_transcript_variant",
    "non_coding_transcript_variant",
    "upstream_gene_variant",
    "downstream_gene_variant",
    "TFBS_ablation",
    "TFBS_amplification",
    "TF_binding_site_variant",
    "regulatory_region_ablation",
    "regulatory_region_amplification",
    "feature_elongation",
    "regulatory_region_variant",
    "feature_truncation",
    "intergenic_variant",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptConf {
    /// Consequence vocabulary ordered by severity, most severe first.
    pub consequences: Vec<String>,
    /// Transcripts considered when a filter asks for the default inclusion.
    pub inclusion_regex: Option<String>,
}

impl Default for TranscriptConf {
    fn default() -> Self {
        Self {
            consequences: CONSEQUENCES.iter().map(|s| s.to_string()).collect(),
            inclusion_regex: Some(String::from("NM_.*")),
        }
    }
}

impl TranscriptConf {
    /// Severity rank of `consequence`, 0 is most severe.
    pub fn severity(&self, consequence: &str) -> Option<usize> {
        self.consequences.iter().position(|c| c == consequence)
    }

    /// Return error naming the unknown terms if `consequences` is not a subset
    /// of the vocabulary.
    pub fn check_vocabulary<'a>(
        &self,
        consequences: impl IntoIterator<Item = &'a String>,
    ) -> Result<()> {
        let unknown = consequences
            .into_iter()
            .filter(|c| self.severity(c).is_none())
            .cloned()
            .collect::<Vec<_>>();
        if unknown.is_empty() {
            Ok(())
        } else {
            Err(Error::FilterConfiguration(format!(
                "unknown consequences: {}",
                unknown.join(", ")
            )))
        }
    }
}

/// Defaults for gene panel configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenepanelConf {
    /// Default layer of the gene panel configuration resolver.
    pub defaults: serde_json::Value,
}

impl Default for GenepanelConf {
    fn default() -> Self {
        Self {
            defaults: serde_json::json!({
                "freq_cutoff_groups": {
                    "AD": {
                        "external": {"hi_freq_cutoff": 0.005, "lo_freq_cutoff": 0.001},
                        "internal": {"hi_freq_cutoff": 0.05, "lo_freq_cutoff": 1.0}
                    },
                    "default": {
                        "external": {"hi_freq_cutoff": 0.01, "lo_freq_cutoff": 1.0},
                        "internal": {"hi_freq_cutoff": 0.05, "lo_freq_cutoff": 1.0}
                    }
                },
                "disease_mode": "ANY",
                "last_exon_important": "LEI"
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizeRequirements {
    /// Workflow statuses from which a round may be finalized.
    pub workflow_status: Vec<WorkflowStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTypeConf {
    pub finalize_requirements: FinalizeRequirements,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConf {
    pub analysis: WorkflowTypeConf,
    pub allele: WorkflowTypeConf,
}

impl Default for WorkflowConf {
    fn default() -> Self {
        Self {
            analysis: WorkflowTypeConf {
                finalize_requirements: FinalizeRequirements {
                    workflow_status: vec![
                        WorkflowStatus::Interpretation,
                        WorkflowStatus::Review,
                        WorkflowStatus::MedicalReview,
                    ],
                },
            },
            allele: WorkflowTypeConf {
                finalize_requirements: FinalizeRequirements {
                    workflow_status: vec![WorkflowStatus::Interpretation, WorkflowStatus::Review],
                },
            },
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub frequencies: FrequencyConf,
    pub classification: ClassificationConf,
    pub transcripts: TranscriptConf,
    pub genepanel: GenepanelConf,
    pub workflow: WorkflowConf,
}

impl Config {
    /// Parse configuration from TOML text and validate it.
    pub fn from_toml_str(toml_str: &str) -> Result<Self> {
        let config: Config = toml::from_str(toml_str)
            .map_err(|e| Error::Validation(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the TOML file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let toml_str = std::fs::read_to_string(path).map_err(|e| {
            Error::Validation(format!("could not read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&toml_str)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for option in &self.classification.options {
            if !seen.insert(option.value) {
                return Err(Error::Validation(format!(
                    "classification option {} declared twice",
                    option.value
                )));
            }
        }
        if let Some(regex) = &self.transcripts.inclusion_regex {
            regex::Regex::new(regex).map_err(|e| {
                Error::Validation(format!("invalid transcripts.inclusion_regex: {}", e))
            })?;
        }
        for (group, provider, population) in self.frequencies.groups.triples() {
            if provider.contains('"') || population.contains('"') {
                return Err(Error::Validation(format!(
                    "invalid {} frequency key {}.{}",
                    group, provider, population
                )));
            }
        }
        if !self.genepanel.defaults.is_object() {
            return Err(Error::Validation(String::from(
                "genepanel.defaults must be a table",
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::{Config, FrequencyGroup};
    use crate::db::models::{Classification, WorkflowStatus};

    #[test]
    fn empty_toml_yields_defaults() -> Result<(), anyhow::Error> {
        let config = Config::from_toml_str("")?;
        assert_eq!(config, Config::default());
        Ok(())
    }

    #[test]
    fn load_from_file() -> Result<(), anyhow::Error> {
        let tmpdir = temp_testdir::TempDir::default();
        let path = tmpdir.to_path_buf().join("conf.toml");
        std::fs::write(
            &path,
            r#"
[frequencies.groups.external]
GNOMAD_GENOMES = ["G"]

[frequencies.groups.internal]
inDB = ["OUSWES"]

[frequencies.num_thresholds.GNOMAD_GENOMES]
G = 2000

[[classification.options]]
value = "3"
outdated_after_days = 30

[workflow.analysis.finalize_requirements]
workflow_status = ["Review", "Medical review"]
"#,
        )?;

        let config = Config::load(&path)?;

        assert_eq!(
            config.frequencies.groups.triples(),
            vec![
                (FrequencyGroup::External, "GNOMAD_GENOMES", "G"),
                (FrequencyGroup::Internal, "inDB", "OUSWES"),
            ]
        );
        assert_eq!(config.frequencies.num_thresholds["GNOMAD_GENOMES"]["G"], 2000);
        assert_eq!(
            config.classification.outdated_after(Classification::Class3),
            Some(chrono::Duration::days(30))
        );
        assert_eq!(
            config.classification.outdated_after(Classification::Class5),
            None
        );
        assert_eq!(
            config.workflow.analysis.finalize_requirements.workflow_status,
            vec![WorkflowStatus::Review, WorkflowStatus::MedicalReview]
        );

        Ok(())
    }

    #[test]
    fn duplicate_classification_option_is_rejected() {
        let res = Config::from_toml_str(
            r#"
[[classification.options]]
value = "1"

[[classification.options]]
value = "1"
"#,
        );
        assert!(res.is_err());
    }

    #[test]
    fn vocabulary_check_names_unknown_terms() {
        let config = Config::default();
        let res = config
            .transcripts
            .check_vocabulary(&[String::from("missense_variant"), String::from("bogus")]);
        let msg = format!("{}", res.unwrap_err());
        assert!(msg.contains("bogus"), "{}", msg);
        assert!(!msg.contains("missense"), "{}", msg);
    }
}
