//! Blast Radius Estimator — how widely a vulnerability pattern recurs
//!
//! Corpora are queried concurrently through the read-only
//! [`ScenarioCorpus`] capability. Prevalence is the size-weighted mean of
//! per-corpus rates (Σ affected / Σ total), so a small corpus cannot skew
//! the result. Corpora that declare the category not applicable are
//! reported but excluded from the ratio.

pub mod corpus;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures::future::join_all;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{GateError, GateResult};
use crate::trajectory::Fingerprint;

pub use corpus::{
    CorpusError, CorpusFile, CorpusMatch, ScenarioCorpus, ScenarioRecord, StaticCorpus,
};

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Ordered risk ladder
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Isolated,
    Localized,
    Moderate,
    Systemic,
}

impl RiskLevel {
    pub fn recommendation(self) -> &'static str {
        match self {
            Self::Systemic => "Requires immediate mitigation before next release",
            Self::Moderate => "Should be addressed in next release cycle",
            Self::Localized | Self::Isolated => "Can be addressed through targeted fix",
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Isolated => write!(f, "isolated"),
            Self::Localized => write!(f, "localized"),
            Self::Moderate => write!(f, "moderate"),
            Self::Systemic => write!(f, "systemic"),
        }
    }
}

/// How complete the corpus coverage behind a report is
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum CoverageConfidence {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for CoverageConfidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

/// Ladder and confidence calibration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct BlastRadiusThresholds {
    /// At most this many affected scenarios is `isolated`
    pub isolated_max_affected: u64,
    /// Prevalence below this is `localized`
    pub localized_below: f64,
    /// Prevalence above this is `systemic`
    pub systemic_above: f64,
    /// Matches spanning this many scenario categories is `systemic`
    pub systemic_min_categories: usize,
    /// Sampled scenarios needed for `high` confidence
    pub high_confidence_min_sampled: u64,
}

impl Default for BlastRadiusThresholds {
    fn default() -> Self {
        Self {
            isolated_max_affected: 1,
            localized_below: 0.05,
            systemic_above: 0.15,
            systemic_min_categories: 2,
            high_confidence_min_sampled: 500,
        }
    }
}

impl BlastRadiusThresholds {
    pub fn validate(&self) -> GateResult<()> {
        for (name, value) in [
            ("localized_below", self.localized_below),
            ("systemic_above", self.systemic_above),
        ] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(GateError::invalid_config(format!(
                    "blast_radius.{name} = {value} outside [0, 1]"
                )));
            }
        }
        if self.localized_below > self.systemic_above {
            return Err(GateError::invalid_config(format!(
                "blast_radius.localized_below ({}) exceeds systemic_above ({})",
                self.localized_below, self.systemic_above
            )));
        }
        if self.systemic_min_categories < 2 {
            return Err(GateError::invalid_config(
                "blast_radius.systemic_min_categories must be >= 2",
            ));
        }
        Ok(())
    }

    /// Apply the ladder: isolated, then systemic, moderate, localized
    pub fn classify(&self, affected: u64, prevalence: f64, categories: usize) -> RiskLevel {
        if affected <= self.isolated_max_affected {
            RiskLevel::Isolated
        } else if prevalence > self.systemic_above || categories >= self.systemic_min_categories {
            RiskLevel::Systemic
        } else if prevalence >= self.localized_below {
            RiskLevel::Moderate
        } else {
            RiskLevel::Localized
        }
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Per-corpus scan outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CorpusResult {
    pub corpus: String,
    pub affected: u64,
    pub total: u64,
    pub rate: f64,
    pub scenario_ids: Vec<String>,
    pub not_applicable: bool,
}

/// Blast radius of one incident across all queried corpora
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BlastRadiusReport {
    pub incident_id: String,
    pub fingerprint: Fingerprint,
    pub corpora: Vec<CorpusResult>,
    pub total_affected: u64,
    pub total_sampled: u64,
    pub prevalence: f64,
    pub categories: BTreeSet<String>,
    pub risk_level: RiskLevel,
    pub confidence: CoverageConfidence,
    pub recommendation: String,
    /// Corpora that failed to answer
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unavailable: Vec<String>,
}

/// Wire shape consumed by external tooling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BlastRadiusExport {
    pub incident_id: String,
    pub fingerprint: Fingerprint,
    pub affected_suites: BTreeMap<String, Vec<String>>,
    pub prevalence: f64,
    pub risk_level: RiskLevel,
    pub confidence: CoverageConfidence,
    pub recommendation: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unavailable_corpora: Vec<String>,
}

impl BlastRadiusReport {
    pub fn export(&self) -> BlastRadiusExport {
        BlastRadiusExport {
            incident_id: self.incident_id.clone(),
            fingerprint: self.fingerprint.clone(),
            affected_suites: self
                .corpora
                .iter()
                .map(|c| (c.corpus.clone(), c.scenario_ids.clone()))
                .collect(),
            prevalence: self.prevalence,
            risk_level: self.risk_level,
            confidence: self.confidence,
            recommendation: self.recommendation.clone(),
            unavailable_corpora: self.unavailable.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Estimator
// ---------------------------------------------------------------------------

/// Scans corpora and aggregates prevalence
#[derive(Debug, Clone, Default)]
pub struct BlastRadiusEstimator {
    thresholds: BlastRadiusThresholds,
}

impl BlastRadiusEstimator {
    pub fn new(thresholds: BlastRadiusThresholds) -> GateResult<Self> {
        thresholds.validate()?;
        Ok(Self { thresholds })
    }

    pub fn thresholds(&self) -> &BlastRadiusThresholds {
        &self.thresholds
    }

    /// Query every corpus concurrently and build the report.
    ///
    /// If some corpora fail, returns `CorpusUnavailable` carrying the report
    /// computed from the ones that answered (confidence forced to `low`).
    pub async fn estimate(
        &self,
        incident_id: &str,
        fingerprint: &Fingerprint,
        corpora: &[Arc<dyn ScenarioCorpus>],
        cancel: &CancellationToken,
    ) -> GateResult<BlastRadiusReport> {
        if corpora.is_empty() {
            return Err(GateError::invalid_config("blast radius needs at least one corpus"));
        }

        let queries = corpora.iter().map(|c| async move {
            let name = c.name();
            let answer = c.match_fingerprint(fingerprint).await;
            (name, answer)
        });

        let answers = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(GateError::cancelled(format!("blast radius scan for {incident_id}")));
            }
            answers = join_all(queries) => answers,
        };

        let mut results = Vec::with_capacity(answers.len());
        let mut categories = BTreeSet::new();
        let mut unavailable = Vec::new();
        for (name, answer) in answers {
            match answer.and_then(|m| check_answer(&name, m)) {
                Ok(m) => {
                    categories.extend(m.categories.iter().cloned());
                    results.push(CorpusResult {
                        rate: if m.total_count == 0 {
                            0.0
                        } else {
                            m.affected() as f64 / m.total_count as f64
                        },
                        corpus: name,
                        affected: m.affected(),
                        total: m.total_count,
                        scenario_ids: m.scenario_ids.into_iter().collect(),
                        not_applicable: m.not_applicable,
                    });
                }
                Err(err) => {
                    warn!(incident_id, corpus = %name, error = %err, "Corpus scan failed");
                    unavailable.push(name);
                }
            }
        }

        let report = self.aggregate(incident_id, fingerprint, results, categories, unavailable);
        info!(
            incident_id,
            fingerprint = %fingerprint,
            prevalence = report.prevalence,
            risk_level = %report.risk_level,
            confidence = %report.confidence,
            unavailable = report.unavailable.len(),
            "Blast radius estimated"
        );

        if report.unavailable.is_empty() {
            Ok(report)
        } else {
            Err(GateError::CorpusUnavailable {
                corpora: report.unavailable.clone(),
                partial: Box::new(report),
            })
        }
    }

    fn aggregate(
        &self,
        incident_id: &str,
        fingerprint: &Fingerprint,
        results: Vec<CorpusResult>,
        categories: BTreeSet<String>,
        unavailable: Vec<String>,
    ) -> BlastRadiusReport {
        let applicable = results.iter().filter(|r| !r.not_applicable);
        let total_affected: u64 = applicable.clone().map(|r| r.affected).sum();
        let total_sampled: u64 = applicable.map(|r| r.total).sum();
        let prevalence = if total_sampled == 0 {
            0.0
        } else {
            total_affected as f64 / total_sampled as f64
        };

        let risk_level = self
            .thresholds
            .classify(total_affected, prevalence, categories.len());

        let ambiguous = results.iter().any(|r| r.affected == 0 && !r.not_applicable);
        let confidence = if ambiguous || !unavailable.is_empty() {
            CoverageConfidence::Low
        } else if total_sampled >= self.thresholds.high_confidence_min_sampled {
            CoverageConfidence::High
        } else {
            CoverageConfidence::Medium
        };

        BlastRadiusReport {
            incident_id: incident_id.to_string(),
            fingerprint: fingerprint.clone(),
            corpora: results,
            total_affected,
            total_sampled,
            prevalence,
            categories,
            risk_level,
            confidence,
            recommendation: risk_level.recommendation().to_string(),
            unavailable,
        }
    }
}

fn check_answer(corpus: &str, m: CorpusMatch) -> Result<CorpusMatch, CorpusError> {
    if m.affected() > m.total_count {
        return Err(CorpusError::Inconsistent(format!(
            "{corpus} matched {} of {} scenarios",
            m.affected(),
            m.total_count
        )));
    }
    Ok(m)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ladder_order() {
        let t = BlastRadiusThresholds::default();
        assert_eq!(t.classify(1, 0.9, 1), RiskLevel::Isolated);
        assert_eq!(t.classify(20, 0.267, 1), RiskLevel::Systemic);
        assert_eq!(t.classify(3, 0.01, 2), RiskLevel::Systemic);
        assert_eq!(t.classify(10, 0.10, 1), RiskLevel::Moderate);
        assert_eq!(t.classify(10, 0.15, 1), RiskLevel::Moderate);
        assert_eq!(t.classify(4, 0.02, 1), RiskLevel::Localized);
    }

    #[test]
    fn test_thresholds_validated() {
        let bad = BlastRadiusThresholds {
            localized_below: 0.5,
            systemic_above: 0.1,
            ..Default::default()
        };
        assert!(BlastRadiusEstimator::new(bad).is_err());
    }

    #[test]
    fn test_recommendations() {
        assert!(RiskLevel::Systemic.recommendation().contains("immediate"));
        assert!(RiskLevel::Localized.recommendation().contains("targeted"));
    }

    #[tokio::test]
    async fn test_two_static_corpora_weighted_prevalence() {
        fn corpus(name: &str, total: usize, hits: usize) -> Arc<dyn ScenarioCorpus> {
            let scenarios = (0..total)
                .map(|i| ScenarioRecord {
                    id: format!("{name}-{i}"),
                    category: "cyber".into(),
                    failure_categories: if i < hits {
                        vec!["trajectory_monitoring_fn".into()]
                    } else {
                        vec!["tool_hallucination".into()]
                    },
                    trigger_pattern: None,
                })
                .collect();
            Arc::new(
                StaticCorpus::from_file(CorpusFile {
                    name: name.into(),
                    not_applicable_categories: vec![],
                    scenarios,
                })
                .unwrap(),
            )
        }

        let report = BlastRadiusEstimator::default()
            .estimate(
                "INC_004",
                &Fingerprint::new("trajectory_monitoring_fn", "gradual"),
                &[corpus("a", 25, 8), corpus("b", 50, 12)],
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!((report.prevalence - 20.0 / 75.0).abs() < 1e-12);
        assert_eq!(report.risk_level, RiskLevel::Systemic);
        assert_eq!(report.confidence, CoverageConfidence::Medium);
        assert_eq!(report.export().affected_suites["a"].len(), 8);
    }
}
