//! Alignment debt — unresolved safety gaps carried across releases
//!
//! Every incident that reaches a release leaves an entry in the debt ledger.
//! Entries are cleared by a regression case ([`DebtLedger::mark_mitigated`])
//! or by an explicit, time-limited risk acceptance. Open entries age against
//! a per-severity SLO ([`aging`]) and eventually block releases.
//!
//! - [`ledger`]: YAML ledger file guarded by an advisory lock
//! - [`aging`]: SLO status and enforcement over open entries

pub mod aging;
pub mod ledger;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GateError, GateResult};
use crate::grading::impact::tier_for;
use crate::pipeline::Assessment;
use crate::taxonomy::{SeverityTier, Taxonomy};
use crate::trajectory::{Fingerprint, Incident};

pub use aging::{aging_report, AgingPolicy, AgingReport, DebtAging, SloStatus};
pub use ledger::DebtLedgerStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebtStatus {
    Open,
    Mitigated,
    Accepted,
}

impl std::fmt::Display for DebtStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Mitigated => write!(f, "mitigated"),
            Self::Accepted => write!(f, "accepted"),
        }
    }
}

/// Overall ledger health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DebtLevel {
    Ok,
    Warn,
    Block,
}

impl std::fmt::Display for DebtLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::Warn => write!(f, "WARN"),
            Self::Block => write!(f, "BLOCK"),
        }
    }
}

/// Signed-off decision to ship with the gap still open
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAcceptance {
    pub approved_by: String,
    pub approved_at: DateTime<Utc>,
    pub expires: DateTime<Utc>,
    #[serde(default)]
    pub conditions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebtEntry {
    pub debt_id: String,
    pub source_incident: String,
    #[serde(default)]
    pub fingerprint: Option<Fingerprint>,
    /// What the safeguard stack failed to catch
    pub mechanism_gap: String,
    pub severity: SeverityTier,
    pub introduced_by_release: String,
    pub debt_amount: f64,
    pub blocks_release: bool,
    pub status: DebtStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub regression_cases: Vec<String>,
    #[serde(default)]
    pub mitigated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub mitigated_by: Option<String>,
    #[serde(default)]
    pub risk_acceptance: Option<RiskAcceptance>,
    #[serde(default)]
    pub block_reason: Option<String>,
}

impl DebtEntry {
    /// Contribution of one open entry to the ledger total
    pub fn amount_for(severity: SeverityTier) -> f64 {
        match severity {
            SeverityTier::Critical => 0.10,
            SeverityTier::High => 0.05,
            SeverityTier::Medium => 0.02,
            SeverityTier::Low => 0.01,
        }
    }

    /// Open, or accepted with an acceptance that has lapsed
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            DebtStatus::Open => true,
            DebtStatus::Mitigated => false,
            DebtStatus::Accepted => self
                .risk_acceptance
                .as_ref()
                .map_or(true, |a| a.expires <= now),
        }
    }

    pub fn blocks(&self, now: DateTime<Utc>) -> bool {
        self.blocks_release && self.is_active(now)
    }

    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_days().max(0)
    }
}

/// Input for a new ledger entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebtRecord {
    pub incident_id: String,
    pub fingerprint: Option<Fingerprint>,
    pub mechanism_gap: String,
    pub severity: SeverityTier,
    pub release: String,
    #[serde(default)]
    pub regression_cases: Vec<String>,
}

impl DebtRecord {
    /// Severity from the fingerprint tier, falling back to the incident's own
    pub fn from_assessment(
        incident: &Incident,
        assessment: &Assessment,
        taxonomy: &Taxonomy,
        release: impl Into<String>,
    ) -> Self {
        let mechanism_gap = assessment
            .fingerprint
            .as_ref()
            .and_then(|fp| taxonomy.get(&fp.category))
            .map(|c| c.detection_gap.clone())
            .filter(|gap| !gap.is_empty())
            .unwrap_or_else(|| "unclassified".to_string());
        Self {
            incident_id: incident.id().to_string(),
            fingerprint: assessment.fingerprint.clone(),
            mechanism_gap,
            severity: assessment
                .severity_tier
                .unwrap_or_else(|| tier_for(incident.severity())),
            release: release.into(),
            regression_cases: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebtSummary {
    pub total_active_debt: f64,
    pub status: DebtLevel,
    pub open: usize,
    pub mitigated: usize,
    pub accepted: usize,
    /// Active entries with `blocks_release` set
    pub blocking: usize,
    pub updated_at: DateTime<Utc>,
}

/// The whole ledger document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DebtLedger {
    /// Refreshed on every write for readers that only want the headline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<DebtSummary>,
    #[serde(default, rename = "ledger")]
    pub entries: Vec<DebtEntry>,
}

impl DebtLedger {
    pub fn get(&self, debt_id: &str) -> Option<&DebtEntry> {
        self.entries.iter().find(|e| e.debt_id == debt_id)
    }

    /// Active entry for an incident, if any
    pub fn active_for(&self, incident_id: &str, now: DateTime<Utc>) -> Option<&DebtEntry> {
        self.entries
            .iter()
            .find(|e| e.source_incident == incident_id && e.is_active(now))
    }

    /// Adds an entry unless the incident already has an active one.
    /// Returns the entry and whether it was created.
    pub fn record(&mut self, record: DebtRecord, now: DateTime<Utc>) -> (DebtEntry, bool) {
        if let Some(existing) = self.active_for(&record.incident_id, now) {
            return (existing.clone(), false);
        }
        let base = format!("AD-{}-{}", now.format("%Y%m%d"), record.incident_id);
        let mut debt_id = base.clone();
        let mut n = 2;
        while self.get(&debt_id).is_some() {
            debt_id = format!("{base}-{n}");
            n += 1;
        }
        let blocks = matches!(record.severity, SeverityTier::Critical | SeverityTier::High);
        let entry = DebtEntry {
            debt_id,
            source_incident: record.incident_id,
            fingerprint: record.fingerprint,
            mechanism_gap: record.mechanism_gap,
            severity: record.severity,
            introduced_by_release: record.release,
            debt_amount: DebtEntry::amount_for(record.severity),
            blocks_release: blocks,
            status: DebtStatus::Open,
            created_at: now,
            regression_cases: record.regression_cases,
            mitigated_at: None,
            mitigated_by: None,
            risk_acceptance: None,
            block_reason: blocks.then(|| format!("{} severity gap", record.severity)),
        };
        self.entries.push(entry.clone());
        (entry, true)
    }

    /// Clears the incident's active entry. `None` when nothing was open.
    pub fn mark_mitigated(
        &mut self,
        incident_id: &str,
        cases: &[String],
        mitigated_by: &str,
        now: DateTime<Utc>,
    ) -> Option<DebtEntry> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.source_incident == incident_id && e.is_active(now))?;
        entry.status = DebtStatus::Mitigated;
        entry.blocks_release = false;
        entry.block_reason = None;
        entry.mitigated_at = Some(now);
        entry.mitigated_by = Some(mitigated_by.to_string());
        for case in cases {
            if !entry.regression_cases.contains(case) {
                entry.regression_cases.push(case.clone());
            }
        }
        Some(entry.clone())
    }

    /// Accepts the risk until `acceptance.expires`; lapses back to active
    pub fn accept(&mut self, debt_id: &str, acceptance: RiskAcceptance) -> GateResult<DebtEntry> {
        if acceptance.approved_by.trim().is_empty() {
            return Err(GateError::IncompleteAudit {
                case_id: debt_id.to_string(),
                field: "approved_by".to_string(),
            });
        }
        if acceptance.expires <= acceptance.approved_at {
            return Err(GateError::invalid_config(format!(
                "risk acceptance for {debt_id} expires before it is approved"
            )));
        }
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.debt_id == debt_id)
            .ok_or_else(|| GateError::DebtNotFound {
                key: debt_id.to_string(),
            })?;
        if entry.status == DebtStatus::Mitigated {
            return Err(GateError::IllegalTransition {
                case_id: debt_id.to_string(),
                from: DebtStatus::Mitigated.to_string(),
                to: DebtStatus::Accepted.to_string(),
            });
        }
        entry.status = DebtStatus::Accepted;
        entry.risk_acceptance = Some(acceptance);
        Ok(entry.clone())
    }

    pub fn blocking(&self, now: DateTime<Utc>) -> Vec<&DebtEntry> {
        self.entries.iter().filter(|e| e.blocks(now)).collect()
    }

    pub fn summary(&self, config: &DebtConfig, now: DateTime<Utc>) -> DebtSummary {
        let active: Vec<&DebtEntry> = self.entries.iter().filter(|e| e.is_active(now)).collect();
        let total: f64 = active.iter().map(|e| e.debt_amount).sum();
        let total = (total * 1000.0).round() / 1000.0;
        let status = if total >= config.block_total {
            DebtLevel::Block
        } else if total >= config.warn_total {
            DebtLevel::Warn
        } else {
            DebtLevel::Ok
        };
        let count = |s: DebtStatus| self.entries.iter().filter(|e| e.status == s).count();
        DebtSummary {
            total_active_debt: total,
            status,
            open: count(DebtStatus::Open),
            mitigated: count(DebtStatus::Mitigated),
            accepted: count(DebtStatus::Accepted),
            blocking: active.iter().filter(|e| e.blocks_release).count(),
            updated_at: now,
        }
    }
}

/// Ledger location, total-debt levels and aging SLOs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebtConfig {
    pub ledger_path: PathBuf,
    /// Total active debt at which the ledger reports WARN
    pub warn_total: f64,
    /// Total active debt at which the ledger reports BLOCK
    pub block_total: f64,
    pub aging: AgingPolicy,
}

impl Default for DebtConfig {
    fn default() -> Self {
        Self {
            ledger_path: PathBuf::from(".incident-gate/alignment_debt.yaml"),
            warn_total: 0.10,
            block_total: 0.25,
            aging: AgingPolicy::default(),
        }
    }
}

impl DebtConfig {
    pub fn validate(&self) -> GateResult<()> {
        for (name, value) in [("warn_total", self.warn_total), ("block_total", self.block_total)] {
            if !value.is_finite() || value <= 0.0 {
                return Err(GateError::invalid_config(format!(
                    "debt.{name} = {value} must be positive"
                )));
            }
        }
        if self.warn_total > self.block_total {
            return Err(GateError::invalid_config(format!(
                "debt.warn_total = {} above debt.block_total = {}",
                self.warn_total, self.block_total
            )));
        }
        self.aging.validate()
    }
}
