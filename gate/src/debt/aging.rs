//! Debt aging — SLO status of open entries and release blocking on breach

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{DebtEntry, DebtLedger};
use crate::error::{GateError, GateResult};
use crate::taxonomy::SeverityTier;

/// Age thresholds in days. Low-severity entries use the medium block limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgingPolicy {
    pub warning_days: i64,
    pub escalate_days: i64,
    pub block_days_critical: i64,
    pub block_days_high: i64,
    pub block_days_medium: i64,
}

impl Default for AgingPolicy {
    fn default() -> Self {
        Self {
            warning_days: 14,
            escalate_days: 30,
            block_days_critical: 45,
            block_days_high: 60,
            block_days_medium: 90,
        }
    }
}

impl AgingPolicy {
    pub fn validate(&self) -> GateResult<()> {
        for (name, value) in [
            ("warning_days", self.warning_days),
            ("escalate_days", self.escalate_days),
            ("block_days_critical", self.block_days_critical),
            ("block_days_high", self.block_days_high),
            ("block_days_medium", self.block_days_medium),
        ] {
            if value <= 0 {
                return Err(GateError::invalid_config(format!(
                    "debt.aging.{name} = {value} must be positive"
                )));
            }
        }
        if self.warning_days > self.escalate_days {
            return Err(GateError::invalid_config(format!(
                "debt.aging.warning_days = {} above escalate_days = {}",
                self.warning_days, self.escalate_days
            )));
        }
        Ok(())
    }

    pub fn block_days(&self, severity: SeverityTier) -> i64 {
        match severity {
            SeverityTier::Critical => self.block_days_critical,
            SeverityTier::High => self.block_days_high,
            SeverityTier::Medium | SeverityTier::Low => self.block_days_medium,
        }
    }

    pub fn status(&self, age_days: i64, severity: SeverityTier) -> SloStatus {
        if age_days >= self.block_days(severity) {
            SloStatus::Block
        } else if age_days >= self.escalate_days {
            SloStatus::Escalate
        } else if age_days >= self.warning_days {
            SloStatus::Warning
        } else {
            SloStatus::Ok
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SloStatus {
    Ok,
    Warning,
    Escalate,
    Block,
}

impl std::fmt::Display for SloStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Warning => write!(f, "warning"),
            Self::Escalate => write!(f, "escalate"),
            Self::Block => write!(f, "block"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebtAging {
    pub debt_id: String,
    pub source_incident: String,
    pub severity: SeverityTier,
    pub age_days: i64,
    pub slo_status: SloStatus,
    /// Zero once the block limit is reached
    pub days_until_block: i64,
}

impl DebtAging {
    fn of(entry: &DebtEntry, policy: &AgingPolicy, now: DateTime<Utc>) -> Self {
        let age_days = entry.age_days(now);
        Self {
            debt_id: entry.debt_id.clone(),
            source_incident: entry.source_incident.clone(),
            severity: entry.severity,
            age_days,
            slo_status: policy.status(age_days, entry.severity),
            days_until_block: (policy.block_days(entry.severity) - age_days).max(0),
        }
    }
}

/// Aging of every active entry, oldest first
pub fn analyze(ledger: &DebtLedger, policy: &AgingPolicy, now: DateTime<Utc>) -> Vec<DebtAging> {
    let mut aging: Vec<DebtAging> = ledger
        .entries
        .iter()
        .filter(|e| e.is_active(now))
        .map(|e| DebtAging::of(e, policy, now))
        .collect();
    aging.sort_by(|a, b| b.age_days.cmp(&a.age_days).then(a.debt_id.cmp(&b.debt_id)));
    aging
}

/// Sets `blocks_release` on active entries past their block limit.
/// Returns the ids that changed.
pub fn enforce(ledger: &mut DebtLedger, policy: &AgingPolicy, now: DateTime<Utc>) -> Vec<String> {
    let mut changed = Vec::new();
    for entry in ledger.entries.iter_mut().filter(|e| e.is_active(now)) {
        let age_days = entry.age_days(now);
        if entry.blocks_release || policy.status(age_days, entry.severity) != SloStatus::Block {
            continue;
        }
        warn!(
            debt_id = %entry.debt_id,
            severity = %entry.severity,
            age_days,
            "Alignment debt past its SLO, blocking releases"
        );
        entry.blocks_release = true;
        entry.block_reason = Some(format!("SLO exceeded: {age_days} days without resolution"));
        changed.push(entry.debt_id.clone());
    }
    changed
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgingReport {
    pub total_active: usize,
    pub average_age_days: f64,
    pub oldest_age_days: i64,
    pub by_status: BTreeMap<SloStatus, usize>,
    /// Entries at escalate or block, oldest first
    pub violations: Vec<DebtAging>,
}

pub fn aging_report(aging: &[DebtAging]) -> AgingReport {
    if aging.is_empty() {
        return AgingReport::default();
    }
    let mut by_status = BTreeMap::new();
    for a in aging {
        *by_status.entry(a.slo_status).or_insert(0) += 1;
    }
    let total_age: i64 = aging.iter().map(|a| a.age_days).sum();
    AgingReport {
        total_active: aging.len(),
        average_age_days: total_age as f64 / aging.len() as f64,
        oldest_age_days: aging.iter().map(|a| a.age_days).max().unwrap_or(0),
        by_status,
        violations: aging
            .iter()
            .filter(|a| a.slo_status >= SloStatus::Escalate)
            .cloned()
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debt::tests::{record, t0};
    use chrono::Duration;

    fn ledger_with(entries: &[(&str, SeverityTier, i64)]) -> DebtLedger {
        let mut ledger = DebtLedger::default();
        for (incident, severity, days_ago) in entries {
            ledger.record(record(incident, *severity), t0() - Duration::days(*days_ago));
        }
        ledger
    }

    #[test]
    fn test_status_boundaries() {
        let p = AgingPolicy::default();
        assert_eq!(p.status(13, SeverityTier::Critical), SloStatus::Ok);
        assert_eq!(p.status(14, SeverityTier::Critical), SloStatus::Warning);
        assert_eq!(p.status(30, SeverityTier::Critical), SloStatus::Escalate);
        assert_eq!(p.status(45, SeverityTier::Critical), SloStatus::Block);
        assert_eq!(p.status(45, SeverityTier::High), SloStatus::Escalate);
        assert_eq!(p.status(60, SeverityTier::High), SloStatus::Block);
        assert_eq!(p.status(89, SeverityTier::Low), SloStatus::Escalate);
        assert_eq!(p.status(90, SeverityTier::Low), SloStatus::Block);
    }

    #[test]
    fn test_analyze_skips_mitigated_and_sorts_oldest_first() {
        let mut ledger = ledger_with(&[
            ("INC_001", SeverityTier::High, 20),
            ("INC_002", SeverityTier::Critical, 50),
            ("INC_003", SeverityTier::Medium, 5),
        ]);
        ledger.mark_mitigated("INC_003", &[], "qa", t0());
        let aging = analyze(&ledger, &AgingPolicy::default(), t0());
        let ids: Vec<&str> = aging.iter().map(|a| a.source_incident.as_str()).collect();
        assert_eq!(ids, vec!["INC_002", "INC_001"]);
        assert_eq!(aging[0].slo_status, SloStatus::Block);
        assert_eq!(aging[0].days_until_block, 0);
        assert_eq!(aging[1].slo_status, SloStatus::Warning);
        assert_eq!(aging[1].days_until_block, 40);
    }

    #[test]
    fn test_enforce_blocks_only_breaches_once() {
        let mut ledger = ledger_with(&[
            ("INC_001", SeverityTier::Medium, 95),
            ("INC_002", SeverityTier::Low, 10),
        ]);
        let policy = AgingPolicy::default();
        let changed = enforce(&mut ledger, &policy, t0());
        assert_eq!(changed.len(), 1);
        let blocked = ledger.get(&changed[0]).unwrap();
        assert_eq!(blocked.source_incident, "INC_001");
        assert!(blocked.blocks_release);
        assert_eq!(
            blocked.block_reason.as_deref(),
            Some("SLO exceeded: 95 days without resolution")
        );
        assert!(enforce(&mut ledger, &policy, t0()).is_empty());
        assert_eq!(ledger.blocking(t0()).len(), 1);
    }

    #[test]
    fn test_report() {
        let ledger = ledger_with(&[
            ("INC_001", SeverityTier::High, 10),
            ("INC_002", SeverityTier::High, 35),
            ("INC_003", SeverityTier::Critical, 48),
        ]);
        let report = aging_report(&analyze(&ledger, &AgingPolicy::default(), t0()));
        assert_eq!(report.total_active, 3);
        assert_eq!(report.oldest_age_days, 48);
        assert!((report.average_age_days - 31.0).abs() < 1e-9);
        assert_eq!(report.by_status[&SloStatus::Escalate], 1);
        assert_eq!(report.violations.len(), 2);

        assert_eq!(aging_report(&[]), AgingReport::default());
    }

    #[test]
    fn test_policy_validation() {
        assert!(AgingPolicy::default().validate().is_ok());
        let inverted = AgingPolicy {
            warning_days: 40,
            ..Default::default()
        };
        assert!(inverted.validate().is_err());
        let zero = AgingPolicy {
            block_days_high: 0,
            ..Default::default()
        };
        assert!(zero.validate().is_err());
    }
}
