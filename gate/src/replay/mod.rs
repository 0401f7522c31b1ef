//! Replay Engine and counterfactual re-simulation
//!
//! - [`config`]: safeguard configurations, hooks and routing policies
//! - [`scoring`]: drift scoring functions registered by id
//! - [`engine`]: the deterministic turn walk producing a [`ReplayTrace`]
//! - [`counterfactual`]: perturbed re-runs classified as
//!   PREVENTED / UNCHANGED / WORSENED
//! - [`near_miss`]: traces that were stopped, but only just

pub mod config;
pub mod counterfactual;
pub mod engine;
pub mod near_miss;
pub mod scoring;

pub use config::{
    RoutingPolicy, SafeguardConfig, DEFAULT_DRIFT_SCORER, HOOK_DRIFT_MONITOR, HOOK_HARD_STOP,
    HOOK_HEDGE_REVIEW, KNOWN_HOOKS,
};
pub use counterfactual::{
    shift_confidence, summarize, CounterfactualOutcome, CounterfactualResult,
    CounterfactualSummary, MitigationEntry, Perturbation,
};
pub use engine::{Detector, ReplayEngine, ReplayStep, ReplayTrace};
pub use near_miss::{
    detect_near_miss, near_miss_metrics, NearMiss, NearMissKind, NearMissMetrics, NearMissPolicy,
    Precursor,
};
pub use scoring::{DriftScorer, DriftScorerRegistry, LinearLabelScorer, SaturatingLabelScorer};
