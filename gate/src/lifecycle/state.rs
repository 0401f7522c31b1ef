//! Lifecycle State — regression case states and the append-only audit log
//!
//! The current state of a case is never stored on its own; it is a fold
//! over the audit entries. `replay_log` re-checks every entry against the
//! transition rules so a tampered ledger is detected on load.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GateError, GateResult};

/// Regression case lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    /// Initial: gates every release
    Active,
    /// Still run, failures reported but reviewed
    Monitoring,
    Deprecated,
    /// Terminal
    Retired,
}

impl LifecycleState {
    pub fn is_terminal(self) -> bool {
        self == Self::Retired
    }

    /// Counts toward the at-most-one-case-per-fingerprint rule
    pub fn is_live(self) -> bool {
        matches!(self, Self::Active | Self::Monitoring)
    }

    /// The single state a regular transition may move to
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Active => Some(Self::Monitoring),
            Self::Monitoring => Some(Self::Deprecated),
            Self::Deprecated => Some(Self::Retired),
            Self::Retired => None,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "ACTIVE" => Some(Self::Active),
            "MONITORING" => Some(Self::Monitoring),
            "DEPRECATED" => Some(Self::Deprecated),
            "RETIRED" => Some(Self::Retired),
            _ => None,
        }
    }

    pub const ALL: [Self; 4] = [Self::Active, Self::Monitoring, Self::Deprecated, Self::Retired];
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::Monitoring => write!(f, "MONITORING"),
            Self::Deprecated => write!(f, "DEPRECATED"),
            Self::Retired => write!(f, "RETIRED"),
        }
    }
}

/// Kind of audited action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionAction {
    /// Case created from an incident
    Promote,
    /// One step forward along the lifecycle
    Advance,
    /// ACTIVE → RETIRED, skipping the intermediate states
    EmergencyRetire,
}

impl std::fmt::Display for TransitionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Promote => write!(f, "promote"),
            Self::Advance => write!(f, "advance"),
            Self::EmergencyRetire => write!(f, "emergency_retire"),
        }
    }
}

/// One immutable ledger entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// 1-based position in the case's log
    pub sequence: u32,
    pub action: TransitionAction,
    /// `None` only for the promotion entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<LifecycleState>,
    pub to: LifecycleState,
    pub actor: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    /// States bypassed by an emergency retire
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<LifecycleState>,
}

impl AuditEntry {
    /// Build the entry for a transition from `from`, checking the rules.
    pub fn transition(
        case_id: &str,
        sequence: u32,
        from: LifecycleState,
        to: LifecycleState,
        action: TransitionAction,
        actor: &str,
        reason: &str,
    ) -> GateResult<Self> {
        require_field(case_id, "actor", actor)?;
        require_field(case_id, "reason", reason)?;
        let skipped = check_transition(case_id, from, to, action)?;
        Ok(Self {
            sequence,
            action,
            from: Some(from),
            to,
            actor: actor.trim().to_string(),
            reason: reason.trim().to_string(),
            timestamp: Utc::now(),
            skipped,
        })
    }

    /// First entry of every case
    pub fn promotion(case_id: &str, actor: &str, reason: &str) -> GateResult<Self> {
        require_field(case_id, "actor", actor)?;
        require_field(case_id, "reason", reason)?;
        Ok(Self {
            sequence: 1,
            action: TransitionAction::Promote,
            from: None,
            to: LifecycleState::Active,
            actor: actor.trim().to_string(),
            reason: reason.trim().to_string(),
            timestamp: Utc::now(),
            skipped: Vec::new(),
        })
    }
}

fn require_field(case_id: &str, field: &str, value: &str) -> GateResult<()> {
    if value.trim().is_empty() {
        return Err(GateError::IncompleteAudit {
            case_id: case_id.to_string(),
            field: field.to_string(),
        });
    }
    Ok(())
}

fn illegal(case_id: &str, from: LifecycleState, to: LifecycleState) -> GateError {
    GateError::IllegalTransition {
        case_id: case_id.to_string(),
        from: from.to_string(),
        to: to.to_string(),
    }
}

/// Validate a transition; returns the states skipped (emergency only)
pub fn check_transition(
    case_id: &str,
    from: LifecycleState,
    to: LifecycleState,
    action: TransitionAction,
) -> GateResult<Vec<LifecycleState>> {
    match action {
        TransitionAction::Advance if from.next() == Some(to) => Ok(Vec::new()),
        TransitionAction::EmergencyRetire
            if from == LifecycleState::Active && to == LifecycleState::Retired =>
        {
            Ok(vec![LifecycleState::Monitoring, LifecycleState::Deprecated])
        }
        _ => Err(illegal(case_id, from, to)),
    }
}

/// Fold the log into the current state, re-validating every entry
pub fn replay_log(case_id: &str, log: &[AuditEntry]) -> GateResult<LifecycleState> {
    let corrupt = |msg: String| GateError::store(format!("ledger of {case_id} is corrupt: {msg}"));

    let mut entries = log.iter();
    let first = entries
        .next()
        .ok_or_else(|| corrupt("empty audit log".to_string()))?;
    if first.action != TransitionAction::Promote || first.to != LifecycleState::Active {
        return Err(corrupt("first entry is not a promotion".to_string()));
    }

    let mut state = LifecycleState::Active;
    for (idx, entry) in log.iter().enumerate() {
        if entry.sequence as usize != idx + 1 {
            return Err(corrupt(format!(
                "entry {} carries sequence {}",
                idx + 1,
                entry.sequence
            )));
        }
    }
    for entry in entries {
        if entry.from != Some(state) {
            return Err(corrupt(format!(
                "entry {} starts from {:?}, case was {state}",
                entry.sequence, entry.from
            )));
        }
        check_transition(case_id, state, entry.to, entry.action)?;
        state = entry.to;
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_through(states: &[LifecycleState]) -> Vec<AuditEntry> {
        let mut log = vec![AuditEntry::promotion("REG-1", "alice", "incident INC_004").unwrap()];
        let mut from = LifecycleState::Active;
        for to in states {
            let entry = AuditEntry::transition(
                "REG-1",
                log.len() as u32 + 1,
                from,
                *to,
                TransitionAction::Advance,
                "alice",
                "scheduled review",
            )
            .unwrap();
            log.push(entry);
            from = *to;
        }
        log
    }

    #[test]
    fn test_forward_chain_folds() {
        let log = log_through(&[
            LifecycleState::Monitoring,
            LifecycleState::Deprecated,
            LifecycleState::Retired,
        ]);
        assert_eq!(replay_log("REG-1", &log).unwrap(), LifecycleState::Retired);
    }

    #[test]
    fn test_backward_transition_rejected() {
        let err = check_transition(
            "REG-1",
            LifecycleState::Monitoring,
            LifecycleState::Active,
            TransitionAction::Advance,
        )
        .unwrap_err();
        assert!(matches!(err, GateError::IllegalTransition { .. }));
    }

    #[test]
    fn test_skip_requires_emergency() {
        assert!(check_transition(
            "REG-1",
            LifecycleState::Active,
            LifecycleState::Retired,
            TransitionAction::Advance
        )
        .is_err());
        let skipped = check_transition(
            "REG-1",
            LifecycleState::Active,
            LifecycleState::Retired,
            TransitionAction::EmergencyRetire,
        )
        .unwrap();
        assert_eq!(
            skipped,
            vec![LifecycleState::Monitoring, LifecycleState::Deprecated]
        );
        // Emergency path only starts from ACTIVE
        assert!(check_transition(
            "REG-1",
            LifecycleState::Monitoring,
            LifecycleState::Retired,
            TransitionAction::EmergencyRetire
        )
        .is_err());
    }

    #[test]
    fn test_blank_actor_or_reason_rejected() {
        let err = AuditEntry::transition(
            "REG-1",
            2,
            LifecycleState::Active,
            LifecycleState::Monitoring,
            TransitionAction::Advance,
            "  ",
            "ok",
        )
        .unwrap_err();
        assert!(matches!(err, GateError::IncompleteAudit { ref field, .. } if field == "actor"));
        assert!(AuditEntry::promotion("REG-1", "bob", "").is_err());
    }

    #[test]
    fn test_tampered_log_detected() {
        let mut log = log_through(&[LifecycleState::Monitoring]);
        log[1].to = LifecycleState::Retired;
        assert!(replay_log("REG-1", &log).is_err());

        let mut log = log_through(&[LifecycleState::Monitoring]);
        log[1].sequence = 7;
        assert!(replay_log("REG-1", &log).is_err());

        assert!(replay_log("REG-1", &[]).is_err());
    }
}
