//! Replay Engine — re-derives where a safeguard configuration would intervene
//!
//! The walk is a pure function of (trajectory, configuration): turns are
//! visited in order, the drift accumulator is folded through the configured
//! scorer, and each turn is checked against the enabled detectors. The
//! cancellation token is polled between turns.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{GateError, GateResult};
use crate::trajectory::{Incident, SafetyLabel, Trajectory};

use super::config::{
    RoutingPolicy, SafeguardConfig, HOOK_DRIFT_MONITOR, HOOK_HARD_STOP, HOOK_HEDGE_REVIEW,
};
use super::scoring::DriftScorerRegistry;

/// Which detector fired on a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Detector {
    DriftMonitor,
    HardStop,
    HedgeReview,
    HumanReview,
}

impl std::fmt::Display for Detector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DriftMonitor => write!(f, "drift_monitor"),
            Self::HardStop => write!(f, "hard_stop"),
            Self::HedgeReview => write!(f, "hedge_review"),
            Self::HumanReview => write!(f, "human_review"),
        }
    }
}

/// One annotated turn of a replay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayStep {
    pub turn: u32,
    pub label: SafetyLabel,
    /// Drift accumulator after this turn
    pub cumulative_score: f64,
    pub intervention_fired: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detector: Option<Detector>,
}

/// Annotated replay of one trajectory under one configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayTrace {
    pub incident_id: String,
    /// `name@version` of the configuration replayed
    pub config: String,
    pub threshold: f64,
    pub scorer: String,
    pub steps: Vec<ReplayStep>,
    /// First UNSAFE turn in the recorded trajectory
    pub first_failure_turn: Option<u32>,
    /// First turn this configuration would have intervened
    pub intervention_turn: Option<u32>,
}

impl ReplayTrace {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Intervention turn, or `len + 1` when the configuration never intervenes
    pub fn effective_intervention_turn(&self) -> u32 {
        self.intervention_turn
            .unwrap_or(self.steps.len() as u32 + 1)
    }

    /// Intervention at or before the first actual failure
    pub fn intervened_before_failure(&self) -> bool {
        match (self.intervention_turn, self.first_failure_turn) {
            (Some(i), Some(f)) => i <= f,
            (Some(_), None) => true,
            (None, failure) => failure.is_none(),
        }
    }

    fn reached_unmitigated(&self) -> impl Iterator<Item = &ReplayStep> {
        let cutoff = self.effective_intervention_turn();
        self.steps.iter().filter(move |s| s.turn < cutoff)
    }

    /// Share of turns that drifted off policy (non-SAFE) before any
    /// intervention stopped the conversation
    pub fn policy_erosion_rate(&self) -> f64 {
        if self.steps.is_empty() {
            return 0.0;
        }
        let eroded = self
            .reached_unmitigated()
            .filter(|s| s.label != SafetyLabel::Safe)
            .count();
        eroded as f64 / self.steps.len() as f64
    }

    /// Share of turns that were UNSAFE after the opening turn and still
    /// unmitigated
    pub fn delayed_failure_rate(&self) -> f64 {
        if self.steps.is_empty() {
            return 0.0;
        }
        let delayed = self
            .reached_unmitigated()
            .filter(|s| s.turn > 1 && s.label == SafetyLabel::Unsafe)
            .count();
        delayed as f64 / self.steps.len() as f64
    }
}

/// Replays trajectories against safeguard configurations
#[derive(Debug, Clone, Default)]
pub struct ReplayEngine {
    scorers: DriftScorerRegistry,
}

impl ReplayEngine {
    pub fn new(scorers: DriftScorerRegistry) -> Self {
        Self { scorers }
    }

    pub fn scorers(&self) -> &DriftScorerRegistry {
        &self.scorers
    }

    /// Validate a configuration, including that its scorer id resolves
    pub fn check_config(&self, config: &SafeguardConfig) -> GateResult<()> {
        config.validate()?;
        self.scorers.get(&config.drift_scoring_fn_id).map(|_| ())
    }

    /// Replay an incident's trajectory
    pub fn replay_incident(
        &self,
        incident: &Incident,
        config: &SafeguardConfig,
        cancel: &CancellationToken,
    ) -> GateResult<ReplayTrace> {
        self.replay(incident.id(), incident.trajectory(), config, cancel)
    }

    /// Walk the trajectory under `config`.
    ///
    /// Fails with `EmptyTrajectory` for zero turns, `MalformedTrajectory`
    /// for an unlabeled turn, `InvalidConfiguration` for a bad config and
    /// `Cancelled` if the token fires mid-walk.
    pub fn replay(
        &self,
        incident_id: &str,
        trajectory: &Trajectory,
        config: &SafeguardConfig,
        cancel: &CancellationToken,
    ) -> GateResult<ReplayTrace> {
        config.validate()?;
        let scorer = self.scorers.get(&config.drift_scoring_fn_id)?;
        if trajectory.is_empty() {
            return Err(GateError::EmptyTrajectory {
                incident_id: incident_id.to_string(),
            });
        }

        let mut accumulator = 0.0;
        let mut steps = Vec::with_capacity(trajectory.len());
        let mut intervention_turn = None;

        for turn in trajectory {
            if cancel.is_cancelled() {
                return Err(GateError::cancelled(format!("replay of {incident_id}")));
            }
            let label = turn.label().ok_or_else(|| {
                GateError::malformed(format!(
                    "turn {} of {incident_id} has no safety label",
                    turn.position()
                ))
            })?;

            // Non-decreasing and bounded whatever the scorer returns
            accumulator = scorer
                .update(accumulator, label)
                .max(accumulator)
                .clamp(0.0, 1.0);
            let detector = detect(config, turn.position(), label, accumulator);
            if detector.is_some() && intervention_turn.is_none() {
                intervention_turn = Some(turn.position());
                debug!(
                    incident_id,
                    config = %config.label(),
                    turn = turn.position(),
                    cumulative_score = accumulator,
                    detector = ?detector,
                    "First intervention"
                );
            }

            steps.push(ReplayStep {
                turn: turn.position(),
                label,
                cumulative_score: accumulator,
                intervention_fired: detector.is_some(),
                detector,
            });
        }

        let trace = ReplayTrace {
            incident_id: incident_id.to_string(),
            config: config.label(),
            threshold: config.threshold,
            scorer: scorer.id().to_string(),
            steps,
            first_failure_turn: trajectory.first_unsafe_turn(),
            intervention_turn,
        };

        info!(
            incident_id,
            config = %trace.config,
            turns = trace.len(),
            first_failure_turn = ?trace.first_failure_turn,
            intervention_turn = ?trace.intervention_turn,
            "Replay complete"
        );
        Ok(trace)
    }
}

/// First detector (in priority order) that fires on this turn
fn detect(
    config: &SafeguardConfig,
    position: u32,
    label: SafetyLabel,
    accumulator: f64,
) -> Option<Detector> {
    if config.hook_enabled(HOOK_DRIFT_MONITOR) && accumulator > config.threshold {
        return Some(Detector::DriftMonitor);
    }
    if config.hook_enabled(HOOK_HARD_STOP) && label == SafetyLabel::Unsafe {
        return Some(Detector::HardStop);
    }
    if config.hook_enabled(HOOK_HEDGE_REVIEW) && label == SafetyLabel::Hedge {
        return Some(Detector::HedgeReview);
    }
    match config.routing {
        RoutingPolicy::HumanReview { from_turn } if position >= from_turn && !label.is_safe() => {
            Some(Detector::HumanReview)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::replay::scoring::DriftScorer;
    use crate::trajectory::{ActorRole, Turn};

    fn trajectory(labels: &[SafetyLabel]) -> Trajectory {
        Trajectory::new(
            labels
                .iter()
                .enumerate()
                .map(|(i, l)| Turn::new(i as u32 + 1, ActorRole::Assistant, "", Some(*l)))
                .collect(),
        )
        .unwrap()
    }

    fn erosion_nine() -> Trajectory {
        let mut labels = vec![SafetyLabel::Safe; 6];
        labels.extend([SafetyLabel::Unsafe; 3]);
        trajectory(&labels)
    }

    fn drift_only(threshold: f64) -> SafeguardConfig {
        SafeguardConfig::new("drift", threshold).with_hooks(["drift_monitor"])
    }

    /// Gives back score on SAFE turns and overshoots on UNSAFE
    struct LeakyScorer;

    impl DriftScorer for LeakyScorer {
        fn id(&self) -> &'static str {
            "leaky"
        }

        fn update(&self, accumulator: f64, label: SafetyLabel) -> f64 {
            match label {
                SafetyLabel::Safe => accumulator - 0.3,
                SafetyLabel::Hedge => accumulator + 0.4,
                SafetyLabel::Unsafe => accumulator + 0.9,
            }
        }
    }

    #[test]
    fn test_accumulator_never_decreases_with_leaky_scorer() {
        let mut registry = DriftScorerRegistry::with_builtins();
        registry.register(Arc::new(LeakyScorer));
        let engine = ReplayEngine::new(registry);
        let labels = [
            SafetyLabel::Hedge,
            SafetyLabel::Safe,
            SafetyLabel::Safe,
            SafetyLabel::Unsafe,
            SafetyLabel::Safe,
        ];
        let config = drift_only(0.95).with_scorer("leaky");
        let trace = engine
            .replay("INC", &trajectory(&labels), &config, &CancellationToken::new())
            .unwrap();

        let scores: Vec<f64> = trace.steps.iter().map(|s| s.cumulative_score).collect();
        assert!(scores.windows(2).all(|w| w[1] >= w[0]), "{scores:?}");
        assert!((scores[0] - 0.4).abs() < 1e-9);
        assert!((scores[2] - 0.4).abs() < 1e-9);
        assert_eq!(scores[3], 1.0);
        assert_eq!(scores[4], 1.0);
        assert_eq!(trace.intervention_turn, Some(4));
    }

    #[test]
    fn test_nine_turn_erosion_intervenes_at_seven() {
        let engine = ReplayEngine::default();
        let trace = engine
            .replay("INC", &erosion_nine(), &drift_only(0.5), &CancellationToken::new())
            .unwrap();
        assert_eq!(trace.intervention_turn, Some(7));
        assert_eq!(trace.first_failure_turn, Some(7));
        assert!(trace.steps[5].cumulative_score <= 0.5);
        assert!(trace.steps[6].cumulative_score > 0.5);
        assert_eq!(trace.steps[6].detector, Some(Detector::DriftMonitor));
    }

    #[test]
    fn test_lower_threshold_intervenes_at_five() {
        let engine = ReplayEngine::default();
        let trace = engine
            .replay("INC", &erosion_nine(), &drift_only(0.4), &CancellationToken::new())
            .unwrap();
        assert_eq!(trace.intervention_turn, Some(5));
        assert!(trace.intervened_before_failure());
    }

    #[test]
    fn test_empty_trajectory_rejected() {
        let err = ReplayEngine::default()
            .replay(
                "INC_EMPTY",
                &Trajectory::new(vec![]).unwrap(),
                &drift_only(0.5),
                &CancellationToken::new(),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            GateError::EmptyTrajectory { ref incident_id } if incident_id == "INC_EMPTY"
        ));
    }

    #[test]
    fn test_unlabeled_turn_is_malformed() {
        let t = Trajectory::new(vec![
            Turn::new(1, ActorRole::User, "", Some(SafetyLabel::Safe)),
            Turn::new(2, ActorRole::Assistant, "", None),
        ])
        .unwrap();
        let err = ReplayEngine::default()
            .replay("INC", &t, &drift_only(0.5), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, GateError::MalformedTrajectory { .. }));
    }

    #[test]
    fn test_cancelled_token_aborts() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = ReplayEngine::default()
            .replay("INC", &erosion_nine(), &drift_only(0.5), &cancel)
            .unwrap_err();
        assert!(matches!(err, GateError::Cancelled { .. }));
    }

    #[test]
    fn test_hard_stop_and_hedge_review() {
        let t = trajectory(&[SafetyLabel::Safe, SafetyLabel::Hedge, SafetyLabel::Unsafe]);
        let engine = ReplayEngine::default();
        let cancel = CancellationToken::new();

        let hard = SafeguardConfig::new("hard", 1.0).with_hooks(["hard_stop"]);
        assert_eq!(
            engine.replay("I", &t, &hard, &cancel).unwrap().intervention_turn,
            Some(3)
        );

        let hedge = SafeguardConfig::new("hedge", 1.0).with_hooks(["hedge_review"]);
        let trace = engine.replay("I", &t, &hedge, &cancel).unwrap();
        assert_eq!(trace.intervention_turn, Some(2));
        assert_eq!(trace.steps[1].detector, Some(Detector::HedgeReview));
    }

    #[test]
    fn test_human_review_routing() {
        let t = trajectory(&[SafetyLabel::Hedge, SafetyLabel::Safe, SafetyLabel::Hedge]);
        let cfg = SafeguardConfig::new("hr", 1.0)
            .with_hooks(Vec::<String>::new())
            .with_routing(RoutingPolicy::HumanReview { from_turn: 2 });
        let trace = ReplayEngine::default()
            .replay("I", &t, &cfg, &CancellationToken::new())
            .unwrap();
        assert_eq!(trace.intervention_turn, Some(3));
    }

    #[test]
    fn test_no_hooks_never_intervenes() {
        let cfg = SafeguardConfig::new("none", 0.0).with_hooks(Vec::<String>::new());
        let trace = ReplayEngine::default()
            .replay("I", &erosion_nine(), &cfg, &CancellationToken::new())
            .unwrap();
        assert_eq!(trace.intervention_turn, None);
        assert_eq!(trace.effective_intervention_turn(), 10);
        assert!(!trace.intervened_before_failure());
    }

    #[test]
    fn test_erosion_and_delayed_rates() {
        let t = trajectory(&[
            SafetyLabel::Safe,
            SafetyLabel::Hedge,
            SafetyLabel::Unsafe,
            SafetyLabel::Unsafe,
        ]);
        let engine = ReplayEngine::default();
        let cancel = CancellationToken::new();

        let none = SafeguardConfig::new("none", 1.0).with_hooks(Vec::<String>::new());
        let trace = engine.replay("I", &t, &none, &cancel).unwrap();
        assert!((trace.policy_erosion_rate() - 0.75).abs() < 1e-12);
        assert!((trace.delayed_failure_rate() - 0.5).abs() < 1e-12);

        let hard = SafeguardConfig::new("hard", 1.0).with_hooks(["hard_stop"]);
        let trace = engine.replay("I", &t, &hard, &cancel).unwrap();
        // Stopped at turn 3: only turn 2 eroded
        assert!((trace.policy_erosion_rate() - 0.25).abs() < 1e-12);
        assert_eq!(trace.delayed_failure_rate(), 0.0);
    }

    #[test]
    fn test_unknown_scorer_rejected() {
        let cfg = drift_only(0.5).with_scorer("tea_leaves");
        let err = ReplayEngine::default()
            .replay("I", &erosion_nine(), &cfg, &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, GateError::InvalidConfiguration { .. }));
    }
}
