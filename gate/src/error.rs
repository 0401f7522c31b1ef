//! Gate error types
//!
//! Every failure the decision pipeline can surface is a local, typed variant.
//! Replay, taxonomy scoring and grading are pure, so their failures are always
//! input-validation failures and are never retried.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::blast_radius::BlastRadiusReport;

/// Result type alias for gate operations
pub type GateResult<T> = Result<T, GateError>;

/// Errors that can occur anywhere in the decision pipeline
#[derive(Error, Debug)]
pub enum GateError {
    /// Turn ordering broken, or a label missing where replay needs one
    #[error("Malformed trajectory: {message}")]
    MalformedTrajectory { message: String },

    /// A factor references a category absent from the frozen taxonomy
    #[error("Unknown failure category '{category}' (taxonomy {taxonomy_version})")]
    UnknownCategory {
        category: String,
        taxonomy_version: String,
    },

    /// Safeguard, taxonomy or gate configuration outside its valid range
    #[error("Invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    /// Trajectory with zero turns
    #[error("Trajectory for incident '{incident_id}' has no turns")]
    EmptyTrajectory { incident_id: String },

    /// Out-of-range signal (negative rate, NaN, confidence above 1)
    #[error("Invalid signal '{signal}': {value} ({reason})")]
    InvalidSignal {
        signal: String,
        value: f64,
        reason: String,
    },

    /// An ACTIVE or MONITORING case already covers this fingerprint
    #[error(
        "Regression already tracked for fingerprint '{fingerprint}'{}",
        case_suffix(.existing_case)
    )]
    DuplicateRegression {
        fingerprint: String,
        existing_case: Option<String>,
    },

    /// Caller aborted a multi-step operation; nothing was recorded
    #[error("Operation cancelled during {operation}")]
    Cancelled { operation: String },

    /// One or more corpora failed; the report covers the ones that answered
    #[error("Corpus unavailable: {}", .corpora.join(", "))]
    CorpusUnavailable {
        corpora: Vec<String>,
        partial: Box<BlastRadiusReport>,
    },

    /// Regression case id not present in the store
    #[error("Regression case not found: {case_id}")]
    CaseNotFound { case_id: String },

    /// Lifecycle transition not permitted by the state machine
    #[error("Illegal transition for case {case_id}: {from} -> {to}")]
    IllegalTransition {
        case_id: String,
        from: String,
        to: String,
    },

    /// Transition requested without an actor or reason
    #[error("Audit entry for case {case_id} is missing {field}")]
    IncompleteAudit { case_id: String, field: String },

    /// Alignment debt id or incident not present in the ledger
    #[error("Alignment debt not found: {key}")]
    DebtNotFound { key: String },

    /// Regression store backend failure
    #[error("Store error: {message}")]
    Store { message: String },

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// TOML config parse error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

fn case_suffix(existing_case: &Option<String>) -> String {
    match existing_case {
        Some(case_id) => format!(" by case {case_id}"),
        None => String::new(),
    }
}

impl GateError {
    /// Create a malformed trajectory error
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedTrajectory {
            message: message.into(),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            message: message.into(),
        }
    }

    /// Create an invalid signal error
    pub fn invalid_signal(
        signal: impl Into<String>,
        value: f64,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidSignal {
            signal: signal.into(),
            value,
            reason: reason.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create a store error
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Machine-readable error code, stable across versions
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedTrajectory { .. } => "MALFORMED_TRAJECTORY",
            Self::UnknownCategory { .. } => "UNKNOWN_CATEGORY",
            Self::InvalidConfiguration { .. } => "INVALID_CONFIGURATION",
            Self::EmptyTrajectory { .. } => "EMPTY_TRAJECTORY",
            Self::InvalidSignal { .. } => "INVALID_SIGNAL",
            Self::DuplicateRegression { .. } => "DUPLICATE_REGRESSION",
            Self::Cancelled { .. } => "CANCELLED",
            Self::CorpusUnavailable { .. } => "CORPUS_UNAVAILABLE",
            Self::CaseNotFound { .. } => "CASE_NOT_FOUND",
            Self::IllegalTransition { .. } => "ILLEGAL_TRANSITION",
            Self::IncompleteAudit { .. } => "INCOMPLETE_AUDIT",
            Self::DebtNotFound { .. } => "DEBT_NOT_FOUND",
            Self::Store { .. } => "STORE_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::Yaml(_) => "YAML_ERROR",
            Self::Toml(_) => "TOML_ERROR",
        }
    }

    /// Whether the caller can act on this error without changing its inputs.
    ///
    /// `DuplicateRegression` means "inspect the existing case and decide";
    /// `CorpusUnavailable` still carries a usable partial report.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::DuplicateRegression { .. } | Self::CorpusUnavailable { .. }
        )
    }

    /// Structured view for JSON error output
    pub fn to_structured(&self) -> StructuredError {
        StructuredError {
            code: self.code().to_string(),
            message: self.to_string(),
            recoverable: self.is_recoverable(),
        }
    }
}

/// Serializable error body emitted by the CLI in `--json` mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredError {
    /// Machine-readable error code (e.g., "DUPLICATE_REGRESSION")
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Whether the caller can recover without new input
    pub recoverable: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(GateError::malformed("gap").code(), "MALFORMED_TRAJECTORY");
        assert_eq!(
            GateError::cancelled("replay").code(),
            "CANCELLED"
        );
        assert_eq!(
            GateError::invalid_signal("erosion_delta", -0.1, "negative").code(),
            "INVALID_SIGNAL"
        );
        let missing = GateError::DebtNotFound {
            key: "AD-20261019-INC_004".to_string(),
        };
        assert_eq!(missing.code(), "DEBT_NOT_FOUND");
        assert!(!missing.is_recoverable());
    }

    #[test]
    fn test_duplicate_regression_is_recoverable() {
        let err = GateError::DuplicateRegression {
            fingerprint: "trajectory_monitoring_fn::gradual".into(),
            existing_case: Some("REG-1".into()),
        };
        assert!(err.is_recoverable());
        assert!(err.to_string().contains("REG-1"));
        assert!(!GateError::malformed("x").is_recoverable());
    }

    #[test]
    fn test_structured_error_roundtrips_message() {
        let err = GateError::EmptyTrajectory {
            incident_id: "INC_001".into(),
        };
        let structured = err.to_structured();
        assert_eq!(structured.code, "EMPTY_TRAJECTORY");
        assert!(structured.message.contains("INC_001"));
        assert!(!structured.recoverable);
    }
}
