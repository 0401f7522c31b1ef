//! Regression decay — relevance of a case fades with time since review
//!
//! `relevance = min(1, 0.5^(days / half_life) × severity multiplier)`.
//! The policy only recommends; recommendations become real only through
//! audited transitions performed by the manager.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GateError, GateResult};

use super::case::RegressionCase;
use super::state::LifecycleState;

/// Actor recorded on transitions applied by the decay policy
pub const DECAY_ACTOR: &str = "decay-policy";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecayPolicy {
    /// Days after which relevance halves
    pub half_life_days: f64,
    /// ACTIVE cases below this relevance move to MONITORING
    pub monitor_below: f64,
    /// MONITORING cases below this relevance move to DEPRECATED
    pub deprecate_below: f64,
}

impl Default for DecayPolicy {
    fn default() -> Self {
        Self {
            half_life_days: 90.0,
            monitor_below: 0.5,
            deprecate_below: 0.25,
        }
    }
}

/// Suggested step for one case
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecayRecommendation {
    pub case_id: String,
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub relevance: f64,
    pub days_since_review: f64,
}

impl DecayRecommendation {
    /// Audit reason recorded when the recommendation is applied
    pub fn reason(&self, policy: &DecayPolicy) -> String {
        let floor = match self.to {
            LifecycleState::Monitoring => policy.monitor_below,
            _ => policy.deprecate_below,
        };
        format!(
            "relevance {:.3} below {floor} after {:.0} days without review",
            self.relevance, self.days_since_review
        )
    }
}

impl DecayPolicy {
    pub fn validate(&self) -> GateResult<()> {
        if !self.half_life_days.is_finite() || self.half_life_days <= 0.0 {
            return Err(GateError::invalid_config(format!(
                "decay.half_life_days = {} must be positive",
                self.half_life_days
            )));
        }
        for (name, value) in [
            ("monitor_below", self.monitor_below),
            ("deprecate_below", self.deprecate_below),
        ] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(GateError::invalid_config(format!(
                    "decay.{name} = {value} outside [0, 1]"
                )));
            }
        }
        if self.deprecate_below > self.monitor_below {
            return Err(GateError::invalid_config(
                "decay.deprecate_below exceeds decay.monitor_below",
            ));
        }
        Ok(())
    }

    pub fn relevance(&self, case: &RegressionCase, now: DateTime<Utc>) -> f64 {
        let days = days_since(case.last_reviewed_at(), now);
        let base = 0.5f64.powf(days / self.half_life_days);
        (base * case.record.severity.decay_multiplier()).min(1.0)
    }

    pub fn recommend(
        &self,
        case: &RegressionCase,
        now: DateTime<Utc>,
    ) -> GateResult<Option<DecayRecommendation>> {
        let state = case.state()?;
        let relevance = self.relevance(case, now);
        let to = match state {
            LifecycleState::Active if relevance < self.monitor_below => LifecycleState::Monitoring,
            LifecycleState::Monitoring if relevance < self.deprecate_below => {
                LifecycleState::Deprecated
            }
            _ => return Ok(None),
        };
        Ok(Some(DecayRecommendation {
            case_id: case.id().to_string(),
            from: state,
            to,
            relevance,
            days_since_review: days_since(case.last_reviewed_at(), now),
        }))
    }
}

fn days_since(then: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    ((now - then).num_seconds().max(0) as f64) / 86_400.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grading::Verdict;
    use crate::lifecycle::case::{CaseRecord, ExpectedBehavior};
    use crate::lifecycle::state::AuditEntry;
    use crate::trajectory::{Fingerprint, Severity};
    use chrono::Duration;

    fn case(severity: Severity, reviewed_days_ago: i64) -> RegressionCase {
        let mut promotion = AuditEntry::promotion("REG-d", "ci", "promoted").unwrap();
        promotion.timestamp = Utc::now() - Duration::days(reviewed_days_ago);
        RegressionCase {
            record: CaseRecord {
                case_id: "REG-d".into(),
                source_incident: "INC".into(),
                incident_version: 1,
                severity,
                fingerprint: Fingerprint::new("tool_hallucination", "unspecified"),
                expected: ExpectedBehavior {
                    max_safe_turn: 2,
                    required_verdict: Verdict::Warn,
                    required_reason_substring: "max_category_delta".into(),
                },
                created_at: promotion.timestamp,
            },
            audit_log: vec![promotion],
        }
    }

    #[test]
    fn test_relevance_halves_per_half_life() {
        let policy = DecayPolicy::default();
        let now = Utc::now();
        let r = policy.relevance(&case(Severity::Sev2, 90), now);
        assert!((r - 0.5).abs() < 0.01);
        let fresh = policy.relevance(&case(Severity::Sev2, 0), now);
        assert!((fresh - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_severe_cases_decay_slower() {
        let policy = DecayPolicy::default();
        let now = Utc::now();
        assert!(
            policy.relevance(&case(Severity::Sev0, 120), now)
                > policy.relevance(&case(Severity::Sev3, 120), now)
        );
    }

    #[test]
    fn test_recommendation_for_stale_active_case() {
        let policy = DecayPolicy::default();
        let rec = policy
            .recommend(&case(Severity::Sev3, 90), Utc::now())
            .unwrap()
            .unwrap();
        assert_eq!(rec.to, LifecycleState::Monitoring);
        assert!(rec.reason(&policy).contains("below 0.5"));
        assert!(policy
            .recommend(&case(Severity::Sev0, 90), Utc::now())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_policy_validation() {
        assert!(DecayPolicy::default().validate().is_ok());
        let bad = DecayPolicy {
            half_life_days: 0.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
