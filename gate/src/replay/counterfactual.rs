//! Counterfactual mode — replay under a perturbed configuration and compare
//!
//! Pure re-evaluation: takes (trajectory, baseline configuration,
//! perturbation) and never touches a stored incident.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{GateError, GateResult};
use crate::trajectory::Trajectory;

use super::config::{RoutingPolicy, SafeguardConfig, KNOWN_HOOKS};
use super::engine::{ReplayEngine, ReplayTrace};

/// Threshold multiplier applied by `ConservativeModel`
pub const CONSERVATIVE_THRESHOLD_FACTOR: f64 = 0.75;

/// A what-if change applied to a baseline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Perturbation {
    /// Shift the drift threshold (negative = stricter)
    ThresholdDelta { delta: f64 },
    /// Disable one hook, or every hook when `hook` is absent
    RemoveSafeguard {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hook: Option<String>,
    },
    /// Swap the routing policy
    AlternateRouting { policy: RoutingPolicy },
    /// Every known hook enabled and the threshold tightened
    ConservativeModel,
}

impl Perturbation {
    /// Short stable name, used in reports and perturbed config names
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ThresholdDelta { .. } => "threshold_delta",
            Self::RemoveSafeguard { .. } => "remove_safeguard",
            Self::AlternateRouting { .. } => "alternate_routing",
            Self::ConservativeModel => "conservative_model",
        }
    }

    /// Produce the perturbed configuration, validated
    pub fn apply(&self, base: &SafeguardConfig) -> GateResult<SafeguardConfig> {
        let mut cfg = base.clone();
        match self {
            Self::ThresholdDelta { delta } => {
                if !delta.is_finite() {
                    return Err(GateError::invalid_config(format!(
                        "threshold delta {delta} is not finite"
                    )));
                }
                cfg.threshold = base.threshold + delta;
            }
            Self::RemoveSafeguard { hook: Some(hook) } => {
                if !KNOWN_HOOKS.contains(&hook.as_str()) {
                    return Err(GateError::invalid_config(format!(
                        "cannot remove unknown hook '{hook}'"
                    )));
                }
                cfg.hooks_enabled.remove(hook);
            }
            Self::RemoveSafeguard { hook: None } => cfg.hooks_enabled.clear(),
            Self::AlternateRouting { policy } => cfg.routing = *policy,
            Self::ConservativeModel => {
                cfg.hooks_enabled = KNOWN_HOOKS.iter().map(|h| h.to_string()).collect();
                cfg.threshold = base.threshold * CONSERVATIVE_THRESHOLD_FACTOR;
            }
        }
        cfg.name = format!("{}+{}", base.name, self.kind());
        cfg.validate()?;
        Ok(cfg)
    }
}

impl std::fmt::Display for Perturbation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ThresholdDelta { delta } => write!(f, "threshold_delta({delta:+})"),
            Self::RemoveSafeguard { hook: Some(h) } => write!(f, "remove_safeguard({h})"),
            Self::RemoveSafeguard { hook: None } => write!(f, "remove_safeguard(all)"),
            Self::AlternateRouting { policy } => write!(f, "alternate_routing({policy})"),
            Self::ConservativeModel => write!(f, "conservative_model"),
        }
    }
}

/// Direction the intervention moved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CounterfactualOutcome {
    /// Intervention would have happened earlier
    Prevented,
    Unchanged,
    /// Intervention later, or lost entirely
    Worsened,
}

impl std::fmt::Display for CounterfactualOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Prevented => write!(f, "PREVENTED"),
            Self::Unchanged => write!(f, "UNCHANGED"),
            Self::Worsened => write!(f, "WORSENED"),
        }
    }
}

/// Result of one counterfactual run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterfactualResult {
    pub incident_id: String,
    pub perturbation: Perturbation,
    pub perturbed_config: String,
    pub outcome: CounterfactualOutcome,
    pub first_failure_turn: Option<u32>,
    pub baseline_intervention_turn: Option<u32>,
    pub perturbed_intervention_turn: Option<u32>,
    /// Perturbed minus baseline effective intervention turn (negative = earlier)
    pub intervention_turn_delta: i64,
    pub confidence: f64,
    pub reasoning: String,
}

impl CounterfactualResult {
    pub fn would_have_helped(&self) -> bool {
        self.outcome == CounterfactualOutcome::Prevented
    }
}

/// Confidence grows with the shift relative to trajectory length.
///
/// `sqrt(|delta| / len)`: an off-by-one shift on a long trajectory scores
/// low, a shift across the whole trajectory scores 1. No shift is an
/// unambiguous `UNCHANGED` and scores 1.
pub fn shift_confidence(delta: i64, trajectory_len: usize) -> f64 {
    if delta == 0 || trajectory_len == 0 {
        return 1.0;
    }
    (delta.unsigned_abs() as f64 / trajectory_len as f64)
        .sqrt()
        .clamp(0.0, 1.0)
}

fn compare(
    baseline: &ReplayTrace,
    perturbed: &ReplayTrace,
    perturbation: &Perturbation,
) -> CounterfactualResult {
    let delta = perturbed.effective_intervention_turn() as i64
        - baseline.effective_intervention_turn() as i64;
    let outcome = match delta.signum() {
        -1 => CounterfactualOutcome::Prevented,
        0 => CounterfactualOutcome::Unchanged,
        _ => CounterfactualOutcome::Worsened,
    };
    let describe = |turn: Option<u32>| match turn {
        Some(t) => format!("turn {t}"),
        None => "never".to_string(),
    };
    let reasoning = format!(
        "{perturbation}: intervention {} -> {} (first failure {})",
        describe(baseline.intervention_turn),
        describe(perturbed.intervention_turn),
        describe(baseline.first_failure_turn),
    );

    CounterfactualResult {
        incident_id: baseline.incident_id.clone(),
        perturbation: perturbation.clone(),
        perturbed_config: perturbed.config.clone(),
        outcome,
        first_failure_turn: baseline.first_failure_turn,
        baseline_intervention_turn: baseline.intervention_turn,
        perturbed_intervention_turn: perturbed.intervention_turn,
        intervention_turn_delta: delta,
        confidence: shift_confidence(delta, baseline.len()),
        reasoning,
    }
}

impl ReplayEngine {
    /// Replay `trajectory` under `baseline` and under the perturbed
    /// configuration, and classify the shift in intervention turn.
    pub fn counterfactual(
        &self,
        incident_id: &str,
        trajectory: &Trajectory,
        baseline: &SafeguardConfig,
        perturbation: &Perturbation,
        cancel: &CancellationToken,
    ) -> GateResult<CounterfactualResult> {
        let base_trace = self.replay(incident_id, trajectory, baseline, cancel)?;
        self.counterfactual_against(&base_trace, trajectory, baseline, perturbation, cancel)
    }

    /// Same as [`ReplayEngine::counterfactual`] but reuses an existing
    /// baseline trace
    pub fn counterfactual_against(
        &self,
        base_trace: &ReplayTrace,
        trajectory: &Trajectory,
        baseline: &SafeguardConfig,
        perturbation: &Perturbation,
        cancel: &CancellationToken,
    ) -> GateResult<CounterfactualResult> {
        let perturbed = perturbation.apply(baseline)?;
        let trace = self.replay(&base_trace.incident_id, trajectory, &perturbed, cancel)?;
        let result = compare(base_trace, &trace, perturbation);
        info!(
            incident_id = %result.incident_id,
            perturbation = %perturbation,
            outcome = %result.outcome,
            delta = result.intervention_turn_delta,
            confidence = result.confidence,
            "Counterfactual evaluated"
        );
        Ok(result)
    }

    /// Run several perturbations against one baseline replay
    pub fn counterfactual_batch(
        &self,
        incident_id: &str,
        trajectory: &Trajectory,
        baseline: &SafeguardConfig,
        perturbations: &[Perturbation],
        cancel: &CancellationToken,
    ) -> GateResult<Vec<CounterfactualResult>> {
        let base_trace = self.replay(incident_id, trajectory, baseline, cancel)?;
        perturbations
            .iter()
            .map(|p| self.counterfactual_against(&base_trace, trajectory, baseline, p, cancel))
            .collect()
    }
}

/// One ranked mitigation in a summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MitigationEntry {
    pub perturbation: String,
    pub outcome: CounterfactualOutcome,
    pub confidence: f64,
    pub reasoning: String,
}

/// Helpful perturbations ranked by confidence, the rest listed after
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterfactualSummary {
    pub incident_id: Option<String>,
    pub evaluated: usize,
    pub would_have_helped: usize,
    pub prioritized_mitigations: Vec<MitigationEntry>,
    pub ineffective_mitigations: Vec<MitigationEntry>,
}

/// Rank counterfactual results: PREVENTED first, by descending confidence
pub fn summarize(results: &[CounterfactualResult]) -> CounterfactualSummary {
    let entry = |r: &CounterfactualResult| MitigationEntry {
        perturbation: r.perturbation.to_string(),
        outcome: r.outcome,
        confidence: r.confidence,
        reasoning: r.reasoning.clone(),
    };
    let (mut helpful, unhelpful): (Vec<_>, Vec<_>) =
        results.iter().partition(|r| r.would_have_helped());
    helpful.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    CounterfactualSummary {
        incident_id: results.first().map(|r| r.incident_id.clone()),
        evaluated: results.len(),
        would_have_helped: helpful.len(),
        prioritized_mitigations: helpful.into_iter().map(entry).collect(),
        ineffective_mitigations: unhelpful.into_iter().map(entry).collect(),
    }
}
