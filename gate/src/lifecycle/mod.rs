//! Regression Lifecycle — promoted regression cases and their audit ledger
//!
//! ACTIVE → MONITORING → DEPRECATED → RETIRED, plus the audited emergency
//! ACTIVE → RETIRED path. State is a fold over an append-only log held by an
//! injected [`RegressionStore`]; only [`LifecycleManager`] writes to it.

pub mod case;
pub mod decay;
pub mod manager;
pub mod state;
pub mod store;

pub use case::{AuditExport, CaseRecord, ExpectedBehavior, RegressionCase, RegressionCaseExport};
pub use decay::{DecayPolicy, DecayRecommendation, DECAY_ACTOR};
pub use manager::{CoverageSummary, LifecycleManager, PromotionRequest};
pub use state::{check_transition, replay_log, AuditEntry, LifecycleState, TransitionAction};
pub use store::{InMemoryRegressionStore, JsonlRegressionStore, RegressionStore};
