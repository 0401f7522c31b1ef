//! Regression Case — durable test derived from an incident and its verdict

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::GateResult;
use crate::grading::{RiskVerdict, Verdict};
use crate::replay::ReplayTrace;
use crate::trajectory::{Fingerprint, Severity};

use super::state::{replay_log, AuditEntry, LifecycleState};

/// What a future release must do when replaying the source incident
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ExpectedBehavior {
    /// Last turn that may be reached without intervention
    pub max_safe_turn: u32,
    pub required_verdict: Verdict,
    pub required_reason_substring: String,
}

impl ExpectedBehavior {
    /// `max_safe_turn` is the turn before the first actual failure, or the
    /// whole trajectory when the incident never reached UNSAFE
    pub fn derive(baseline: &ReplayTrace, verdict: &RiskVerdict) -> Self {
        let max_safe_turn = baseline
            .first_failure_turn
            .map(|t| t.saturating_sub(1))
            .unwrap_or(baseline.len() as u32);
        Self {
            max_safe_turn,
            required_verdict: verdict.verdict,
            required_reason_substring: verdict.primary_reason().to_string(),
        }
    }
}

/// Immutable header written once at promotion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseRecord {
    pub case_id: String,
    pub source_incident: String,
    pub incident_version: u32,
    pub severity: Severity,
    pub fingerprint: Fingerprint,
    pub expected: ExpectedBehavior,
    pub created_at: DateTime<Utc>,
}

/// Case header plus its audit log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionCase {
    pub record: CaseRecord,
    pub audit_log: Vec<AuditEntry>,
}

impl RegressionCase {
    pub fn id(&self) -> &str {
        &self.record.case_id
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.record.fingerprint
    }

    /// Fold of the audit log
    pub fn state(&self) -> GateResult<LifecycleState> {
        replay_log(&self.record.case_id, &self.audit_log)
    }

    /// Timestamp of the latest audited action
    pub fn last_reviewed_at(&self) -> DateTime<Utc> {
        self.audit_log
            .last()
            .map(|e| e.timestamp)
            .unwrap_or(self.record.created_at)
    }

    pub fn export(&self) -> GateResult<RegressionCaseExport> {
        Ok(RegressionCaseExport {
            test_id: self.record.case_id.clone(),
            source_incident: self.record.source_incident.clone(),
            incident_version: self.record.incident_version,
            fingerprint: self.record.fingerprint.clone(),
            expected: self.record.expected.clone(),
            state: self.state()?.to_string(),
            created_at: self.record.created_at,
            last_reviewed_at: self.last_reviewed_at(),
            audit_log: self.audit_log.iter().map(AuditExport::from).collect(),
        })
    }
}

/// Audit entry in the export shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AuditExport {
    pub sequence: u32,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub to: String,
    pub actor: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<String>,
}

impl From<&AuditEntry> for AuditExport {
    fn from(entry: &AuditEntry) -> Self {
        Self {
            sequence: entry.sequence,
            action: entry.action.to_string(),
            from: entry.from.map(|s| s.to_string()),
            to: entry.to.to_string(),
            actor: entry.actor.clone(),
            reason: entry.reason.clone(),
            timestamp: entry.timestamp,
            skipped: entry.skipped.iter().map(ToString::to_string).collect(),
        }
    }
}

/// Regression case as consumed by the external regression runner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RegressionCaseExport {
    pub test_id: String,
    pub source_incident: String,
    pub incident_version: u32,
    pub fingerprint: Fingerprint,
    pub expected: ExpectedBehavior,
    pub state: String,
    pub created_at: DateTime<Utc>,
    pub last_reviewed_at: DateTime<Utc>,
    pub audit_log: Vec<AuditExport>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grading::{grade, Signals};
    use crate::replay::{ReplayStep, ReplayTrace};
    use crate::trajectory::SafetyLabel;

    fn trace(first_failure: Option<u32>, len: u32) -> ReplayTrace {
        ReplayTrace {
            incident_id: "INC".into(),
            config: "baseline@1".into(),
            threshold: 0.5,
            scorer: "saturating_label".into(),
            steps: (1..=len)
                .map(|t| ReplayStep {
                    turn: t,
                    label: SafetyLabel::Safe,
                    cumulative_score: 0.0,
                    intervention_fired: false,
                    detector: None,
                })
                .collect(),
            first_failure_turn: first_failure,
            intervention_turn: None,
        }
    }

    #[test]
    fn test_expected_behavior_from_failure_turn() {
        let verdict = grade(&Signals::new(0.18, 0.05, 0.10, 1, true)).unwrap();
        let expected = ExpectedBehavior::derive(&trace(Some(7), 9), &verdict);
        assert_eq!(expected.max_safe_turn, 6);
        assert_eq!(expected.required_verdict, Verdict::Block);
        assert_eq!(expected.required_reason_substring, "policy_erosion_delta");
    }

    #[test]
    fn test_expected_behavior_without_failure() {
        let verdict = grade(&Signals::default()).unwrap();
        let expected = ExpectedBehavior::derive(&trace(None, 4), &verdict);
        assert_eq!(expected.max_safe_turn, 4);
        assert_eq!(expected.required_reason_substring, "within_thresholds");
        assert!(verdict.justification.contains(&expected.required_reason_substring));
    }
}
