//! Scenario corpus capability and the file-backed `StaticCorpus`

use std::collections::BTreeSet;
use std::path::Path;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{GateError, GateResult};
use crate::trajectory::Fingerprint;

/// Failure reported by a corpus backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CorpusError {
    #[error("corpus unreachable: {0}")]
    Unreachable(String),

    #[error("corpus returned an inconsistent answer: {0}")]
    Inconsistent(String),
}

/// Answer of one corpus for one fingerprint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorpusMatch {
    pub scenario_ids: BTreeSet<String>,
    /// Scenarios in the corpus, matched or not
    pub total_count: u64,
    /// Scenario categories the matches span
    #[serde(default)]
    pub categories: BTreeSet<String>,
    /// The corpus explicitly does not cover this failure category
    #[serde(default)]
    pub not_applicable: bool,
}

impl CorpusMatch {
    pub fn affected(&self) -> u64 {
        self.scenario_ids.len() as u64
    }
}

/// Read-only evaluation corpus
#[async_trait]
pub trait ScenarioCorpus: Send + Sync {
    fn name(&self) -> String;

    async fn match_fingerprint(&self, fingerprint: &Fingerprint)
        -> Result<CorpusMatch, CorpusError>;
}

// ---------------------------------------------------------------------------
// Static corpus
// ---------------------------------------------------------------------------

/// One scenario as it appears in a catalogue file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioRecord {
    pub id: String,
    /// Scenario category (e.g. `financial_fraud`)
    pub category: String,
    /// Taxonomy categories this scenario exercises
    #[serde(default)]
    pub failure_categories: Vec<String>,
    /// Regex over the fingerprint trigger; absent matches any trigger
    #[serde(default)]
    pub trigger_pattern: Option<String>,
}

/// Catalogue file format (JSON or YAML)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorpusFile {
    pub name: String,
    #[serde(default)]
    pub not_applicable_categories: Vec<String>,
    pub scenarios: Vec<ScenarioRecord>,
}

#[derive(Debug, Clone)]
struct CompiledScenario {
    record: ScenarioRecord,
    trigger: Option<Regex>,
}

/// In-process corpus over a loaded catalogue
#[derive(Debug, Clone)]
pub struct StaticCorpus {
    name: String,
    not_applicable: BTreeSet<String>,
    scenarios: Vec<CompiledScenario>,
}

impl StaticCorpus {
    /// Compile trigger patterns; an invalid regex is `InvalidConfiguration`
    pub fn from_file(file: CorpusFile) -> GateResult<Self> {
        let scenarios = file
            .scenarios
            .into_iter()
            .map(|record| {
                let trigger = record
                    .trigger_pattern
                    .as_deref()
                    .map(Regex::new)
                    .transpose()
                    .map_err(|e| {
                        GateError::invalid_config(format!(
                            "scenario {} in corpus {}: bad trigger_pattern: {e}",
                            record.id, file.name
                        ))
                    })?;
                Ok(CompiledScenario { record, trigger })
            })
            .collect::<GateResult<Vec<_>>>()?;
        Ok(Self {
            name: file.name,
            not_applicable: file.not_applicable_categories.into_iter().collect(),
            scenarios,
        })
    }

    /// Parse a catalogue, YAML for `.yaml`/`.yml`, JSON otherwise
    pub fn parse(text: &str, yaml: bool) -> GateResult<Self> {
        let file: CorpusFile = if yaml {
            serde_yaml::from_str(text)?
        } else {
            serde_json::from_str(text)?
        };
        Self::from_file(file)
    }

    pub fn load(path: &Path) -> GateResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        Self::parse(&text, yaml)
    }

    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }

    fn matches(scenario: &CompiledScenario, fingerprint: &Fingerprint) -> bool {
        if !scenario
            .record
            .failure_categories
            .iter()
            .any(|c| *c == fingerprint.category)
        {
            return false;
        }
        match &scenario.trigger {
            Some(re) => re.is_match(&fingerprint.trigger),
            None => true,
        }
    }
}

#[async_trait]
impl ScenarioCorpus for StaticCorpus {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn match_fingerprint(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<CorpusMatch, CorpusError> {
        let mut result = CorpusMatch {
            total_count: self.scenarios.len() as u64,
            not_applicable: self.not_applicable.contains(&fingerprint.category),
            ..Default::default()
        };
        if result.not_applicable {
            return Ok(result);
        }
        for scenario in self.scenarios.iter().filter(|s| Self::matches(s, fingerprint)) {
            result.scenario_ids.insert(scenario.record.id.clone());
            result.categories.insert(scenario.record.category.clone());
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
name: misuse_benchmark
not_applicable_categories: [tool_hallucination]
scenarios:
  - id: MB-001
    category: financial_fraud
    failure_categories: [trajectory_monitoring_fn]
    trigger_pattern: "^gradual"
  - id: MB-002
    category: cyber
    failure_categories: [trajectory_monitoring_fn, threshold_misconfig]
  - id: MB-003
    category: cyber
    failure_categories: [pre_action_detection_fn]
"#;

    #[tokio::test]
    async fn test_static_corpus_matches_category_and_trigger() {
        let corpus = StaticCorpus::parse(YAML, true).unwrap();
        assert_eq!(corpus.len(), 3);
        let m = corpus
            .match_fingerprint(&Fingerprint::new("trajectory_monitoring_fn", "gradual_drift"))
            .await
            .unwrap();
        assert_eq!(m.total_count, 3);
        assert_eq!(m.affected(), 2);
        assert_eq!(m.categories.len(), 2);

        let m = corpus
            .match_fingerprint(&Fingerprint::new("trajectory_monitoring_fn", "roleplay"))
            .await
            .unwrap();
        assert_eq!(m.scenario_ids.into_iter().collect::<Vec<_>>(), vec!["MB-002"]);
    }

    #[tokio::test]
    async fn test_not_applicable_category() {
        let corpus = StaticCorpus::parse(YAML, true).unwrap();
        let m = corpus
            .match_fingerprint(&Fingerprint::new("tool_hallucination", "x"))
            .await
            .unwrap();
        assert!(m.not_applicable);
        assert_eq!(m.affected(), 0);
    }

    #[test]
    fn test_bad_regex_rejected() {
        let json = r#"{"name": "c", "scenarios": [
            {"id": "S1", "category": "c", "failure_categories": ["x"], "trigger_pattern": "(["}
        ]}"#;
        let err = StaticCorpus::parse(json, false).unwrap_err();
        assert!(matches!(err, GateError::InvalidConfiguration { .. }));
    }

    #[test]
    fn test_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corpus.yml");
        std::fs::write(&path, YAML).unwrap();
        let corpus = StaticCorpus::load(&path).unwrap();
        assert_eq!(corpus.name(), "misuse_benchmark");
    }
}
