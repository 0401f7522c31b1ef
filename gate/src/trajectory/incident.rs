//! Incident — captured safety failure with its trajectory and root causes

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{GateError, GateResult};
use crate::taxonomy::Taxonomy;

use super::types::{ActorRole, SafetyLabel, Trajectory, Turn};

/// Metadata key holding the triggering condition of the failure
pub const TRIGGER_METADATA_KEY: &str = "trigger";

/// Ordinal incident severity, SEV0 being the most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    #[serde(rename = "SEV0", alias = "critical")]
    Sev0,
    #[serde(rename = "SEV1", alias = "high")]
    Sev1,
    #[serde(rename = "SEV2", alias = "medium")]
    Sev2,
    #[serde(rename = "SEV3", alias = "low")]
    Sev3,
}

impl Severity {
    /// Relevance multiplier used by regression decay (SEV0 decays slowest)
    pub fn decay_multiplier(self) -> f64 {
        match self {
            Self::Sev0 => 1.5,
            Self::Sev1 => 1.2,
            Self::Sev2 => 1.0,
            Self::Sev3 => 0.8,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sev0 => write!(f, "SEV0"),
            Self::Sev1 => write!(f, "SEV1"),
            Self::Sev2 => write!(f, "SEV2"),
            Self::Sev3 => write!(f, "SEV3"),
        }
    }
}

/// A contributing cause, referencing a taxonomy category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootCauseFactor {
    /// Leaf or group name in the taxonomy
    pub category: String,
    /// Analyst confidence in [0, 1]
    pub confidence: f64,
    #[serde(default)]
    pub description: String,
}

impl RootCauseFactor {
    pub fn new(
        category: impl Into<String>,
        confidence: f64,
        description: impl Into<String>,
    ) -> Self {
        Self {
            category: category.into(),
            confidence,
            description: description.into(),
        }
    }

    fn validate(&self) -> GateResult<()> {
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(GateError::invalid_signal(
                format!("confidence[{}]", self.category),
                self.confidence,
                "factor confidence must lie in [0, 1]",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Raw input records
// ---------------------------------------------------------------------------

/// Turn as it appears in a captured incident file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub turn: u32,
    pub role: ActorRole,
    #[serde(default, alias = "content")]
    pub content_summary: String,
    #[serde(default, alias = "status", skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Legacy flag: true maps to UNSAFE, false to SAFE when `label` is absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub violation: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_safeguard: Option<String>,
}

impl TurnRecord {
    fn into_turn(self) -> GateResult<Turn> {
        let label = match (&self.label, self.violation) {
            (Some(raw), _) => Some(SafetyLabel::parse(raw).ok_or_else(|| {
                GateError::malformed(format!("turn {} has unknown label '{raw}'", self.turn))
            })?),
            (None, Some(true)) => Some(SafetyLabel::Unsafe),
            (None, Some(false)) => Some(SafetyLabel::Safe),
            (None, None) => None,
        };
        let turn = Turn::new(self.turn, self.role, self.content_summary, label);
        Ok(match self.triggered_safeguard {
            Some(sg) => turn.with_triggered_safeguard(sg),
            None => turn,
        })
    }
}

/// Incident record as captured upstream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentRecord {
    #[serde(alias = "incident_id")]
    pub id: String,
    pub severity: Severity,
    pub trajectory: Vec<TurnRecord>,
    #[serde(default)]
    pub root_cause_factors: Vec<RootCauseFactor>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Incident
// ---------------------------------------------------------------------------

/// Validated incident. Read-only for every consumer; amendments produce a
/// new version instead of mutating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    id: String,
    version: u32,
    severity: Severity,
    trajectory: Trajectory,
    factors: Vec<RootCauseFactor>,
    metadata: BTreeMap<String, serde_json::Value>,
}

impl Incident {
    /// Validate a captured record into an incident (version 1)
    pub fn from_record(record: IncidentRecord) -> GateResult<Self> {
        let turns = record
            .trajectory
            .into_iter()
            .map(TurnRecord::into_turn)
            .collect::<GateResult<Vec<_>>>()?;
        let trajectory = Trajectory::new(turns)?;
        Self::new(
            record.id,
            record.severity,
            trajectory,
            record.root_cause_factors,
            record.metadata,
        )
    }

    pub fn new(
        id: impl Into<String>,
        severity: Severity,
        trajectory: Trajectory,
        factors: Vec<RootCauseFactor>,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> GateResult<Self> {
        Ok(Self {
            id: id.into(),
            version: 1,
            severity,
            trajectory,
            factors: dedup_factors(factors)?,
            metadata,
        })
    }

    /// Parse and validate an incident from JSON text
    pub fn from_json(text: &str) -> GateResult<Self> {
        let record: IncidentRecord = serde_json::from_str(text)?;
        Self::from_record(record)
    }

    /// Produce the next version with replaced root-cause factors
    pub fn amend(&self, factors: Vec<RootCauseFactor>) -> GateResult<Self> {
        Ok(Self {
            version: self.version + 1,
            factors: dedup_factors(factors)?,
            ..self.clone()
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn trajectory(&self) -> &Trajectory {
        &self.trajectory
    }

    pub fn factors(&self) -> &[RootCauseFactor] {
        &self.factors
    }

    pub fn metadata(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.metadata
    }

    /// Derive the vulnerability pattern used for blast radius and dedup.
    ///
    /// The category is the factor with the highest `confidence × weight`
    /// (first wins on ties). The trigger comes from metadata, else the first
    /// safeguard that fired in production, else `unspecified`.
    pub fn fingerprint(&self, taxonomy: &Taxonomy) -> GateResult<Fingerprint> {
        let mut best: Option<(&RootCauseFactor, f64)> = None;
        for factor in &self.factors {
            let score = factor.confidence * taxonomy.classify(factor)?;
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((factor, score));
            }
        }
        let category = best
            .map(|(f, _)| f.category.clone())
            .ok_or_else(|| {
                GateError::malformed(format!(
                    "incident {} has no root-cause factors to fingerprint",
                    self.id
                ))
            })?;

        let trigger = self
            .metadata
            .get(TRIGGER_METADATA_KEY)
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| {
                self.trajectory
                    .iter()
                    .find_map(|t| t.triggered_safeguard().map(str::to_string))
            })
            .unwrap_or_else(|| "unspecified".to_string());

        Ok(Fingerprint { category, trigger })
    }
}

/// Ordered-set semantics: drop repeated (category, description) pairs
fn dedup_factors(factors: Vec<RootCauseFactor>) -> GateResult<Vec<RootCauseFactor>> {
    let mut out: Vec<RootCauseFactor> = Vec::with_capacity(factors.len());
    for factor in factors {
        factor.validate()?;
        let duplicate = out
            .iter()
            .any(|f| f.category == factor.category && f.description == factor.description);
        if !duplicate {
            out.push(factor);
        }
    }
    Ok(out)
}

/// Structured vulnerability pattern: failure category plus triggering condition
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    schemars::JsonSchema,
)]
pub struct Fingerprint {
    pub category: String,
    pub trigger: String,
}

impl Fingerprint {
    pub fn new(category: impl Into<String>, trigger: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            trigger: trigger.into(),
        }
    }

    /// Stable key used by the regression registry
    pub fn key(&self) -> String {
        format!("{}::{}", self.category, self.trigger)
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}", self.category, self.trigger)
    }
}
