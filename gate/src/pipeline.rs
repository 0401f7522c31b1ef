//! Incident Pipeline — from one incident to a graded release decision
//!
//! severity → baseline/candidate replay → counterfactuals → near misses →
//! signals → optional blast radius → verdict, with business impact reported
//! alongside. The only stateful collaborator is the
//! optional lifecycle manager, read for the regression flag and written only
//! by an explicit [`IncidentPipeline::promote`].

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::blast_radius::{BlastRadiusEstimator, BlastRadiusReport, ScenarioCorpus};
use crate::config::GateConfig;
use crate::error::{GateError, GateResult};
use crate::grading::impact::tier_for;
use crate::grading::{
    assess_impact, ImpactAssessment, ImpactSignals, RiskGrader, RiskVerdict, Signals,
};
use crate::lifecycle::{LifecycleManager, PromotionRequest, RegressionCase};
use crate::replay::{
    detect_near_miss, summarize, CounterfactualResult, CounterfactualSummary, NearMiss,
    ReplayEngine, ReplayTrace,
};
use crate::taxonomy::{SeverityTier, Taxonomy};
use crate::trajectory::{Fingerprint, Incident};

/// Everything derived for one incident
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    pub incident_id: String,
    pub incident_version: u32,
    pub taxonomy_version: String,
    /// Noisy-OR severity of the root-cause factors, in [0, 1]
    pub severity_score: f64,
    /// Tier of the fingerprint's primary category
    pub severity_tier: Option<SeverityTier>,
    /// `None` when the incident has no root-cause factors
    pub fingerprint: Option<Fingerprint>,
    pub baseline: ReplayTrace,
    pub candidate: ReplayTrace,
    pub counterfactuals: Vec<CounterfactualResult>,
    pub counterfactual_summary: CounterfactualSummary,
    /// Baseline and candidate replays that held, but only just
    pub near_misses: Vec<NearMiss>,
    pub signals: Signals,
    /// Present when corpora are configured; may be partial
    pub blast_radius: Option<BlastRadiusReport>,
    pub verdict: RiskVerdict,
    /// Advisory; does not affect `verdict`
    pub impact: ImpactAssessment,
}

impl Assessment {
    pub fn exit_code(&self) -> i32 {
        self.verdict.exit_code
    }
}

pub struct IncidentPipeline {
    config: GateConfig,
    taxonomy: Taxonomy,
    engine: ReplayEngine,
    grader: RiskGrader,
    estimator: BlastRadiusEstimator,
    corpora: Vec<Arc<dyn ScenarioCorpus>>,
    lifecycle: Option<Arc<LifecycleManager>>,
}

impl IncidentPipeline {
    /// Validates the configuration and resolves both scorer ids up front
    pub fn new(config: GateConfig, taxonomy: Taxonomy) -> GateResult<Self> {
        config.validate()?;
        let engine = ReplayEngine::default();
        engine.check_config(&config.baseline)?;
        engine.check_config(&config.candidate)?;
        Ok(Self {
            grader: RiskGrader::new(config.grading.clone())?,
            estimator: BlastRadiusEstimator::new(config.blast_radius.clone())?,
            engine,
            taxonomy,
            config,
            corpora: Vec::new(),
            lifecycle: None,
        })
    }

    pub fn with_engine(mut self, engine: ReplayEngine) -> GateResult<Self> {
        engine.check_config(&self.config.baseline)?;
        engine.check_config(&self.config.candidate)?;
        self.engine = engine;
        Ok(self)
    }

    pub fn with_corpora(mut self, corpora: Vec<Arc<dyn ScenarioCorpus>>) -> Self {
        self.corpora = corpora;
        self
    }

    pub fn with_lifecycle(mut self, lifecycle: Arc<LifecycleManager>) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn taxonomy(&self) -> &Taxonomy {
        &self.taxonomy
    }

    pub fn engine(&self) -> &ReplayEngine {
        &self.engine
    }

    /// Run every stage for one incident. Nothing is written anywhere.
    pub async fn assess(
        &self,
        incident: &Incident,
        cancel: &CancellationToken,
    ) -> GateResult<Assessment> {
        let severity_score = self.taxonomy.severity_score(incident.factors())?;
        let fingerprint = if incident.factors().is_empty() {
            None
        } else {
            Some(incident.fingerprint(&self.taxonomy)?)
        };
        let severity_tier = fingerprint
            .as_ref()
            .map(|fp| self.taxonomy.severity_tier(&fp.category))
            .transpose()?;

        let baseline = self
            .engine
            .replay_incident(incident, &self.config.baseline, cancel)?;
        let candidate = self
            .engine
            .replay_incident(incident, &self.config.candidate, cancel)?;

        let counterfactuals = self
            .config
            .counterfactuals
            .iter()
            .map(|p| {
                self.engine.counterfactual_against(
                    &baseline,
                    incident.trajectory(),
                    &self.config.baseline,
                    p,
                    cancel,
                )
            })
            .collect::<GateResult<Vec<_>>>()?;
        let counterfactual_summary = summarize(&counterfactuals);

        let near_misses: Vec<NearMiss> = [&baseline, &candidate]
            .into_iter()
            .filter_map(|trace| detect_near_miss(trace, &self.config.near_miss))
            .collect();
        for nm in &near_misses {
            debug!(
                incident_id = incident.id(),
                config = %nm.config,
                kind = %nm.kind,
                turn = nm.turn,
                catch_margin = nm.catch_margin,
                "Near miss"
            );
        }

        let regression_flag = match (&self.lifecycle, &fingerprint) {
            (Some(lifecycle), Some(fp)) => lifecycle.has_case_for(fp).await?,
            _ => false,
        };
        let signals = self.derive_signals(incident, &baseline, &candidate, regression_flag)?;

        let blast_radius = match &fingerprint {
            Some(fp) if !self.corpora.is_empty() => {
                Some(self.scan(incident.id(), fp, cancel).await?)
            }
            _ => None,
        };

        if cancel.is_cancelled() {
            return Err(GateError::cancelled(format!("assessment of {}", incident.id())));
        }
        let verdict = self.grader.grade(&signals)?;

        let technical = severity_tier.unwrap_or_else(|| tier_for(incident.severity()));
        let impact = assess_impact(
            technical,
            &ImpactSignals::from_incident(incident)?,
            &self.config.impact,
        );

        info!(
            incident_id = incident.id(),
            severity_score,
            baseline_intervention = ?baseline.intervention_turn,
            candidate_intervention = ?candidate.intervention_turn,
            prevented = counterfactual_summary.would_have_helped,
            regression_flag,
            near_misses = near_misses.len(),
            verdict = %verdict.verdict,
            release_action = %impact.release_action,
            "Incident assessed"
        );

        Ok(Assessment {
            incident_id: incident.id().to_string(),
            incident_version: incident.version(),
            taxonomy_version: self.taxonomy.version().to_string(),
            severity_score,
            severity_tier,
            fingerprint,
            baseline,
            candidate,
            counterfactuals,
            counterfactual_summary,
            near_misses,
            signals,
            blast_radius,
            verdict,
            impact,
        })
    }

    /// Candidate-minus-baseline rate deltas floored at zero, with per
    /// category deltas scaled by each factor's normalized weight
    pub fn derive_signals(
        &self,
        incident: &Incident,
        baseline: &ReplayTrace,
        candidate: &ReplayTrace,
        regression_flag: bool,
    ) -> GateResult<Signals> {
        let erosion_delta =
            (candidate.policy_erosion_rate() - baseline.policy_erosion_rate()).max(0.0);
        let delayed_delta =
            (candidate.delayed_failure_rate() - baseline.delayed_failure_rate()).max(0.0);

        let max_weight = self.taxonomy.max_weight();
        let mut category_deltas: BTreeMap<String, f64> = BTreeMap::new();
        for factor in incident.factors() {
            let weight = self.taxonomy.classify(factor)?;
            let delta = (erosion_delta * factor.confidence * weight / max_weight).clamp(0.0, 1.0);
            let slot = category_deltas.entry(factor.category.clone()).or_insert(0.0);
            *slot = slot.max(delta);
        }

        Ok(Signals::from_category_deltas(
            erosion_delta,
            delayed_delta,
            category_deltas,
            regression_flag,
            self.config.grading.significance_floor,
        ))
    }

    /// Blast radius scan; an unavailable corpus degrades to the partial
    /// report instead of failing the assessment
    async fn scan(
        &self,
        incident_id: &str,
        fingerprint: &Fingerprint,
        cancel: &CancellationToken,
    ) -> GateResult<BlastRadiusReport> {
        match self
            .estimator
            .estimate(incident_id, fingerprint, &self.corpora, cancel)
            .await
        {
            Ok(report) => Ok(report),
            Err(GateError::CorpusUnavailable { corpora, partial }) => {
                warn!(
                    incident_id,
                    unavailable = ?corpora,
                    "Continuing with partial blast radius"
                );
                Ok(*partial)
            }
            Err(e) => Err(e),
        }
    }

    /// Turn an assessment into an ACTIVE regression case
    pub async fn promote(
        &self,
        incident: &Incident,
        assessment: &Assessment,
        actor: &str,
        cancel: &CancellationToken,
    ) -> GateResult<RegressionCase> {
        let lifecycle = self
            .lifecycle
            .as_ref()
            .ok_or_else(|| GateError::invalid_config("promotion needs a regression store"))?;
        let fingerprint = match &assessment.fingerprint {
            Some(fp) => fp.clone(),
            None => incident.fingerprint(&self.taxonomy)?,
        };
        lifecycle
            .promote(
                PromotionRequest {
                    incident,
                    fingerprint,
                    verdict: &assessment.verdict,
                    baseline: &assessment.baseline,
                    actor,
                },
                cancel,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::grading::{ReleaseAction, Verdict};
    use crate::replay::NearMissKind;
    use crate::lifecycle::InMemoryRegressionStore;
    use crate::trajectory::{ActorRole, RootCauseFactor, SafetyLabel, Severity, Trajectory, Turn};

    /// Turns 1-6 SAFE, 7-9 UNSAFE
    fn incident(factors: Vec<RootCauseFactor>) -> Incident {
        incident_with(factors, BTreeMap::new())
    }

    fn incident_with(
        factors: Vec<RootCauseFactor>,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> Incident {
        let turns = (1..=9)
            .map(|p| {
                let label = if p <= 6 { SafetyLabel::Safe } else { SafetyLabel::Unsafe };
                Turn::new(p, ActorRole::Assistant, "", Some(label))
            })
            .collect();
        Incident::new(
            "INC_004",
            Severity::Sev1,
            Trajectory::new(turns).unwrap(),
            factors,
            metadata,
        )
        .unwrap()
    }

    fn weakened_config() -> GateConfig {
        let mut config = GateConfig::default();
        // Candidate drops the hard stop and raises the drift threshold
        config.candidate = config
            .candidate
            .clone()
            .with_hooks(["drift_monitor"]);
        config.candidate.threshold = 0.9;
        config
    }

    #[tokio::test]
    async fn test_identical_configs_are_ok() {
        let pipeline = IncidentPipeline::new(GateConfig::default(), Taxonomy::builtin()).unwrap();
        let inc = incident(vec![RootCauseFactor::new(
            "trajectory_monitoring_fn",
            0.9,
            "gradual erosion",
        )]);
        let assessment = pipeline.assess(&inc, &CancellationToken::new()).await.unwrap();
        assert_eq!(assessment.verdict.verdict, Verdict::Ok);
        assert_eq!(assessment.exit_code(), 0);
        assert_eq!(assessment.signals.erosion_delta, 0.0);
        assert_eq!(assessment.baseline.first_failure_turn, Some(7));
        assert_eq!(assessment.counterfactuals.len(), 4);
        assert!(assessment.blast_radius.is_none());
        // Both configs stop the erosion on turn 7, the first failure
        assert_eq!(assessment.near_misses.len(), 2);
        assert!(assessment
            .near_misses
            .iter()
            .all(|nm| nm.kind == NearMissKind::LateDetection && nm.turn == 7));
    }

    #[tokio::test]
    async fn test_weakened_candidate_is_flagged() {
        let pipeline = IncidentPipeline::new(weakened_config(), Taxonomy::builtin()).unwrap();
        let inc = incident(vec![RootCauseFactor::new(
            "trajectory_monitoring_fn",
            0.9,
            "gradual erosion",
        )]);
        let assessment = pipeline.assess(&inc, &CancellationToken::new()).await.unwrap();
        // Baseline stops at turn 7; candidate lets 7, 8 and 9 through
        assert_eq!(assessment.baseline.intervention_turn, Some(7));
        assert!(assessment.signals.erosion_delta > 0.2);
        assert_eq!(assessment.verdict.verdict, Verdict::Warn);
        assert!(!assessment.signals.regression_flag);
        // Only the baseline held
        assert_eq!(assessment.near_misses.len(), 1);
        assert_eq!(assessment.near_misses[0].config, "baseline@1");
        assert!((assessment.near_misses[0].catch_margin - 2.0 / 9.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_impact_maps_to_release_action_without_changing_verdict() {
        let pipeline = IncidentPipeline::new(GateConfig::default(), Taxonomy::builtin()).unwrap();
        let mut metadata = BTreeMap::new();
        metadata.insert(
            "impact".to_string(),
            serde_json::json!({"affected_users": 1247, "slo_breach": true}),
        );
        let inc = incident_with(
            vec![RootCauseFactor::new("trajectory_monitoring_fn", 0.9, "gradual erosion")],
            metadata,
        );
        let assessment = pipeline.assess(&inc, &CancellationToken::new()).await.unwrap();
        assert_eq!(assessment.impact.signals.affected_users, 1247);
        assert_eq!(assessment.impact.release_action, ReleaseAction::ImmediateBlock);
        assert!(assessment.impact.escalation_required);
        assert_eq!(assessment.verdict.verdict, Verdict::Ok);
        assert_eq!(assessment.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_impact_defaults_to_incident_severity() {
        let pipeline = IncidentPipeline::new(GateConfig::default(), Taxonomy::builtin()).unwrap();
        // No factors, so no taxonomy tier: SEV1 maps to high, no users
        let assessment = pipeline
            .assess(&incident(vec![]), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(assessment.impact.technical_severity, SeverityTier::High);
        assert_eq!(assessment.impact.release_action, ReleaseAction::NoAction);
    }

    #[tokio::test]
    async fn test_malformed_impact_metadata_is_an_error() {
        let pipeline = IncidentPipeline::new(GateConfig::default(), Taxonomy::builtin()).unwrap();
        let mut metadata = BTreeMap::new();
        metadata.insert("impact".to_string(), serde_json::json!({"affected_users": "many"}));
        let err = pipeline
            .assess(&incident_with(vec![], metadata), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "JSON_ERROR");
    }

    #[tokio::test]
    async fn test_regression_flag_escalates_to_block() {
        let lifecycle = Arc::new(LifecycleManager::new(Arc::new(InMemoryRegressionStore::new())));
        let pipeline = IncidentPipeline::new(weakened_config(), Taxonomy::builtin())
            .unwrap()
            .with_lifecycle(lifecycle.clone());
        let inc = incident(vec![RootCauseFactor::new(
            "trajectory_monitoring_fn",
            0.9,
            "gradual erosion",
        )]);
        let cancel = CancellationToken::new();

        let first = pipeline.assess(&inc, &cancel).await.unwrap();
        let case = pipeline.promote(&inc, &first, "ci", &cancel).await.unwrap();
        assert_eq!(case.record.expected.max_safe_turn, 6);

        let second = pipeline.assess(&inc, &cancel).await.unwrap();
        assert!(second.signals.regression_flag);
        assert_eq!(second.verdict.verdict, Verdict::Block);
        assert_eq!(second.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_assessment() {
        let pipeline = IncidentPipeline::new(GateConfig::default(), Taxonomy::builtin()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = pipeline.assess(&incident(vec![]), &cancel).await.unwrap_err();
        assert!(matches!(err, GateError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_unknown_category_is_fatal() {
        let pipeline = IncidentPipeline::new(GateConfig::default(), Taxonomy::builtin()).unwrap();
        let inc = incident(vec![RootCauseFactor::new("vibes", 0.5, "")]);
        let err = pipeline.assess(&inc, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, GateError::UnknownCategory { .. }));
    }
}
