//! Business impact — operational severity and the release action it calls for
//!
//! Technical severity (taxonomy tier) is combined with user-facing impact
//! read from the incident's `impact` metadata. Rows are evaluated top to
//! bottom, first match wins:
//!
//! | Condition | Severity | Action |
//! |---|---|---|
//! | regulatory exposure | SEV0 | immediate_block |
//! | critical AND users > sev0_users | SEV0 | immediate_block |
//! | SLO breach | SEV1 | immediate_block |
//! | high AND users > sev1_users | SEV1 | warn_with_review |
//! | reputation risk high or critical | SEV1 | warn_with_review |
//! | medium OR users > sev2_users | SEV2 | track_for_next_release |
//! | otherwise | SEV3 | no_action |
//!
//! The action is advisory; it never changes the verdict or exit code.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{GateError, GateResult};
use crate::taxonomy::SeverityTier;
use crate::trajectory::{Incident, Severity};

/// Incident metadata key holding an [`ImpactSignals`] object
pub const IMPACT_METADATA_KEY: &str = "impact";

/// User-facing impact of one incident
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImpactSignals {
    pub affected_users: u64,
    pub affected_conversations: u64,
    pub slo_breach: bool,
    pub reputation_risk: SeverityTier,
    pub regulatory_exposure: bool,
}

impl Default for ImpactSignals {
    fn default() -> Self {
        Self {
            affected_users: 0,
            affected_conversations: 0,
            slo_breach: false,
            reputation_risk: SeverityTier::Low,
            regulatory_exposure: false,
        }
    }
}

impl ImpactSignals {
    /// Read from incident metadata; absent means no recorded impact
    pub fn from_incident(incident: &Incident) -> GateResult<Self> {
        match incident.metadata().get(IMPACT_METADATA_KEY) {
            Some(value) => Ok(serde_json::from_value(value.clone())?),
            None => Ok(Self::default()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseAction {
    ImmediateBlock,
    WarnWithReview,
    TrackForNextRelease,
    NoAction,
}

impl std::fmt::Display for ReleaseAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ImmediateBlock => write!(f, "immediate_block"),
            Self::WarnWithReview => write!(f, "warn_with_review"),
            Self::TrackForNextRelease => write!(f, "track_for_next_release"),
            Self::NoAction => write!(f, "no_action"),
        }
    }
}

/// User-count cutoffs (strictly greater than) for each escalation row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImpactThresholds {
    pub sev0_users: u64,
    pub sev1_users: u64,
    pub sev2_users: u64,
}

impl Default for ImpactThresholds {
    fn default() -> Self {
        Self {
            sev0_users: 1000,
            sev1_users: 100,
            sev2_users: 10,
        }
    }
}

impl ImpactThresholds {
    pub fn validate(&self) -> GateResult<()> {
        if !(self.sev2_users <= self.sev1_users && self.sev1_users <= self.sev0_users) {
            return Err(GateError::invalid_config(format!(
                "impact user cutoffs must satisfy sev2 <= sev1 <= sev0 (got {}, {}, {})",
                self.sev2_users, self.sev1_users, self.sev0_users
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpactAssessment {
    pub technical_severity: SeverityTier,
    pub signals: ImpactSignals,
    pub computed_severity: Severity,
    pub release_action: ReleaseAction,
    pub escalation_required: bool,
    pub rationale: String,
}

/// Tier used when no fingerprint tier is available
pub fn tier_for(severity: Severity) -> SeverityTier {
    match severity {
        Severity::Sev0 => SeverityTier::Critical,
        Severity::Sev1 => SeverityTier::High,
        Severity::Sev2 => SeverityTier::Medium,
        Severity::Sev3 => SeverityTier::Low,
    }
}

pub fn assess_impact(
    technical: SeverityTier,
    signals: &ImpactSignals,
    thresholds: &ImpactThresholds,
) -> ImpactAssessment {
    let users = signals.affected_users;
    let (severity, action, escalate, rationale) = if signals.regulatory_exposure {
        (
            Severity::Sev0,
            ReleaseAction::ImmediateBlock,
            true,
            "regulatory exposure requires immediate action".to_string(),
        )
    } else if technical == SeverityTier::Critical && users > thresholds.sev0_users {
        (
            Severity::Sev0,
            ReleaseAction::ImmediateBlock,
            true,
            format!("critical severity with {users} affected users"),
        )
    } else if signals.slo_breach {
        (
            Severity::Sev1,
            ReleaseAction::ImmediateBlock,
            true,
            "SLO breach requires same-day resolution".to_string(),
        )
    } else if technical == SeverityTier::High && users > thresholds.sev1_users {
        (
            Severity::Sev1,
            ReleaseAction::WarnWithReview,
            true,
            format!("high severity with {users} affected users"),
        )
    } else if matches!(
        signals.reputation_risk,
        SeverityTier::High | SeverityTier::Critical
    ) {
        (
            Severity::Sev1,
            ReleaseAction::WarnWithReview,
            true,
            format!("reputation risk {}", signals.reputation_risk),
        )
    } else if technical == SeverityTier::Medium || users > thresholds.sev2_users {
        (
            Severity::Sev2,
            ReleaseAction::TrackForNextRelease,
            false,
            "medium severity, track for next release cycle".to_string(),
        )
    } else {
        (
            Severity::Sev3,
            ReleaseAction::NoAction,
            false,
            "low severity, track in normal cycle".to_string(),
        )
    };
    ImpactAssessment {
        technical_severity: technical,
        signals: signals.clone(),
        computed_severity: severity,
        release_action: action,
        escalation_required: escalate,
        rationale,
    }
}

/// Distribution over a batch of impact assessments
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImpactSummary {
    pub total: usize,
    pub by_severity: BTreeMap<Severity, usize>,
    pub by_action: BTreeMap<ReleaseAction, usize>,
    pub escalations: usize,
    pub slo_breaches: usize,
}

pub fn summarize_impact<'a>(
    assessments: impl IntoIterator<Item = &'a ImpactAssessment>,
) -> ImpactSummary {
    let mut summary = ImpactSummary::default();
    for a in assessments {
        summary.total += 1;
        *summary.by_severity.entry(a.computed_severity).or_default() += 1;
        *summary.by_action.entry(a.release_action).or_default() += 1;
        summary.escalations += usize::from(a.escalation_required);
        summary.slo_breaches += usize::from(a.signals.slo_breach);
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signals(users: u64) -> ImpactSignals {
        ImpactSignals {
            affected_users: users,
            ..Default::default()
        }
    }

    #[test]
    fn test_regulatory_exposure_wins() {
        let s = ImpactSignals {
            regulatory_exposure: true,
            slo_breach: true,
            ..Default::default()
        };
        let a = assess_impact(SeverityTier::Low, &s, &ImpactThresholds::default());
        assert_eq!(a.computed_severity, Severity::Sev0);
        assert_eq!(a.release_action, ReleaseAction::ImmediateBlock);
        assert!(a.escalation_required);
    }

    #[test]
    fn test_matrix_rows() {
        let t = ImpactThresholds::default();
        let cases = [
            (SeverityTier::Critical, 1247, Severity::Sev0, ReleaseAction::ImmediateBlock),
            // 1000 is not above the cutoff
            (SeverityTier::Critical, 1000, Severity::Sev2, ReleaseAction::TrackForNextRelease),
            (SeverityTier::High, 523, Severity::Sev1, ReleaseAction::WarnWithReview),
            (SeverityTier::High, 47, Severity::Sev2, ReleaseAction::TrackForNextRelease),
            (SeverityTier::Medium, 0, Severity::Sev2, ReleaseAction::TrackForNextRelease),
            (SeverityTier::Low, 3, Severity::Sev3, ReleaseAction::NoAction),
        ];
        for (tier, users, severity, action) in cases {
            let a = assess_impact(tier, &signals(users), &t);
            assert_eq!(a.computed_severity, severity, "{tier} / {users}");
            assert_eq!(a.release_action, action, "{tier} / {users}");
        }
    }

    #[test]
    fn test_slo_breach_and_reputation() {
        let t = ImpactThresholds::default();
        let breach = ImpactSignals {
            slo_breach: true,
            ..Default::default()
        };
        let a = assess_impact(SeverityTier::Low, &breach, &t);
        assert_eq!(
            (a.computed_severity, a.release_action),
            (Severity::Sev1, ReleaseAction::ImmediateBlock)
        );

        let reputation = ImpactSignals {
            reputation_risk: SeverityTier::Critical,
            ..Default::default()
        };
        let a = assess_impact(SeverityTier::Low, &reputation, &t);
        assert_eq!(a.release_action, ReleaseAction::WarnWithReview);
        assert_eq!(a.rationale, "reputation risk critical");
    }

    #[test]
    fn test_thresholds_must_be_ordered() {
        assert!(ImpactThresholds::default().validate().is_ok());
        let inverted = ImpactThresholds {
            sev2_users: 500,
            ..Default::default()
        };
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn test_summary_counts() {
        let t = ImpactThresholds::default();
        let all = [
            assess_impact(SeverityTier::Critical, &signals(2000), &t),
            assess_impact(SeverityTier::Low, &signals(0), &t),
            assess_impact(
                SeverityTier::Low,
                &ImpactSignals {
                    slo_breach: true,
                    ..Default::default()
                },
                &t,
            ),
        ];
        let summary = summarize_impact(&all);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.by_action[&ReleaseAction::ImmediateBlock], 2);
        assert_eq!(summary.escalations, 2);
        assert_eq!(summary.slo_breaches, 1);
    }
}
