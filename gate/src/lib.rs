//! Incident Gate — deterministic release gating for agent safety incidents
//!
//! Turns a recorded incident into an OK/WARN/BLOCK verdict with a stable exit
//! code, and into a durable regression case:
//!
//! - [`trajectory`]: turns, trajectories, incidents and fingerprints
//! - [`taxonomy`]: frozen weighted failure-category tree and severity scoring
//! - [`replay`]: threshold replay and counterfactual re-simulation
//! - [`blast_radius`]: cross-corpus prevalence and risk ladder
//! - [`grading`]: the decision table
//! - [`lifecycle`]: regression cases, audit ledger, decay
//! - [`causal`]: causal graph of an incident's failure chain
//! - [`debt`]: alignment debt ledger, clearing and aging
//! - [`pipeline`]: the stages above wired together for one incident

pub mod blast_radius;
pub mod causal;
pub mod config;
pub mod debt;
pub mod error;
pub mod grading;
pub mod lifecycle;
pub mod pipeline;
pub mod replay;
pub mod taxonomy;
pub mod trajectory;

pub use blast_radius::{
    BlastRadiusEstimator, BlastRadiusExport, BlastRadiusReport, BlastRadiusThresholds,
    CoverageConfidence, RiskLevel, ScenarioCorpus, StaticCorpus,
};
pub use causal::CausalGraph;
pub use config::{ConfigOverrides, GateConfig};
pub use debt::{DebtConfig, DebtEntry, DebtLedger, DebtLedgerStore, DebtRecord, DebtStatus};
pub use error::{GateError, GateResult, StructuredError};
pub use grading::{grade, GradingThresholds, RiskGrader, RiskVerdict, Signals, Verdict};
pub use lifecycle::{
    DecayPolicy, InMemoryRegressionStore, JsonlRegressionStore, LifecycleManager, LifecycleState,
    RegressionCase, RegressionStore,
};
pub use pipeline::{Assessment, IncidentPipeline};
pub use replay::{
    CounterfactualOutcome, CounterfactualResult, Perturbation, ReplayEngine, ReplayTrace,
    SafeguardConfig,
};
pub use taxonomy::Taxonomy;
pub use trajectory::{
    Fingerprint, Incident, RootCauseFactor, SafetyLabel, Severity, Trajectory, Turn,
};

/// Re-exported so callers do not need a direct `tokio-util` dependency
pub use tokio_util::sync::CancellationToken;
