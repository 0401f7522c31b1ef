//! Gate configuration — TOML file, `INCIDENT_GATE_*` environment, then flags
//!
//! Every section has usable defaults so the gate runs without a file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::blast_radius::BlastRadiusThresholds;
use crate::debt::DebtConfig;
use crate::error::{GateError, GateResult};
use crate::grading::{GradingThresholds, ImpactThresholds};
use crate::lifecycle::DecayPolicy;
use crate::replay::{
    NearMissPolicy, Perturbation, RoutingPolicy, SafeguardConfig, HOOK_DRIFT_MONITOR,
};
use crate::taxonomy::{Taxonomy, TaxonomyDefinition};

pub const ENV_STORE_PATH: &str = "INCIDENT_GATE_STORE_PATH";
pub const ENV_LOG_FILTER: &str = "INCIDENT_GATE_LOG_FILTER";
pub const ENV_BASELINE_THRESHOLD: &str = "INCIDENT_GATE_BASELINE_THRESHOLD";
pub const ENV_DEBT_LEDGER: &str = "INCIDENT_GATE_DEBT_LEDGER";

/// Top-level gate configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Safeguards currently in production
    pub baseline: SafeguardConfig,
    /// Safeguards proposed for release
    pub candidate: SafeguardConfig,
    pub grading: GradingThresholds,
    pub blast_radius: BlastRadiusThresholds,
    pub decay: DecayPolicy,
    pub near_miss: NearMissPolicy,
    /// User-count cutoffs of the business impact matrix
    pub impact: ImpactThresholds,
    /// Alignment debt ledger and its aging SLOs
    pub debt: DebtConfig,
    /// Perturbations evaluated against the baseline for every incident
    pub counterfactuals: Vec<Perturbation>,
    /// Scenario catalogues (JSON or YAML) scanned for blast radius
    pub corpora: Vec<PathBuf>,
    /// Versioned taxonomy file replacing the built-in tree
    pub taxonomy_path: Option<PathBuf>,
    /// Directory of the regression ledger
    pub store_path: PathBuf,
    pub log_filter: String,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            baseline: SafeguardConfig::new("baseline", 0.5),
            candidate: SafeguardConfig::new("candidate", 0.5),
            grading: GradingThresholds::default(),
            blast_radius: BlastRadiusThresholds::default(),
            decay: DecayPolicy::default(),
            near_miss: NearMissPolicy::default(),
            impact: ImpactThresholds::default(),
            debt: DebtConfig::default(),
            counterfactuals: default_counterfactuals(),
            corpora: Vec::new(),
            taxonomy_path: None,
            store_path: PathBuf::from(".incident-gate/regressions"),
            log_filter: "info".to_string(),
        }
    }
}

fn default_counterfactuals() -> Vec<Perturbation> {
    vec![
        Perturbation::ThresholdDelta { delta: -0.1 },
        Perturbation::RemoveSafeguard {
            hook: Some(HOOK_DRIFT_MONITOR.to_string()),
        },
        Perturbation::AlternateRouting {
            policy: RoutingPolicy::HumanReview { from_turn: 1 },
        },
        Perturbation::ConservativeModel,
    ]
}

/// Per-invocation overrides. Only `Some` values are applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigOverrides {
    pub store_path: Option<PathBuf>,
    pub log_filter: Option<String>,
    pub baseline_threshold: Option<f64>,
    pub debt_ledger: Option<PathBuf>,
}

impl ConfigOverrides {
    /// Read `INCIDENT_GATE_*` variables. An unparsable threshold is an error
    /// rather than silently ignored.
    pub fn from_env() -> GateResult<Self> {
        let baseline_threshold = match std::env::var(ENV_BASELINE_THRESHOLD) {
            Ok(raw) => Some(raw.trim().parse::<f64>().map_err(|_| {
                GateError::invalid_config(format!(
                    "{ENV_BASELINE_THRESHOLD}='{raw}' is not a number"
                ))
            })?),
            Err(_) => None,
        };
        Ok(Self {
            store_path: std::env::var(ENV_STORE_PATH).ok().map(PathBuf::from),
            log_filter: std::env::var(ENV_LOG_FILTER).ok(),
            baseline_threshold,
            debt_ledger: std::env::var(ENV_DEBT_LEDGER).ok().map(PathBuf::from),
        })
    }
}

impl GateConfig {
    pub fn from_toml(text: &str) -> GateResult<Self> {
        let config: Self = toml::from_str(text)?;
        Ok(config)
    }

    /// Load a TOML file, or defaults when `path` is `None`
    pub fn load(path: Option<&Path>) -> GateResult<Self> {
        match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                debug!(path = %path.display(), "Loaded gate configuration");
                Self::from_toml(&text)
            }
            None => Ok(Self::default()),
        }
    }

    /// File (or defaults), then environment, then validation
    pub fn resolve(path: Option<&Path>) -> GateResult<Self> {
        let mut config = Self::load(path)?;
        config.apply_overrides(&ConfigOverrides::from_env()?);
        config.validate()?;
        Ok(config)
    }

    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref v) = overrides.store_path {
            self.store_path = v.clone();
        }
        if let Some(ref v) = overrides.log_filter {
            self.log_filter = v.clone();
        }
        if let Some(v) = overrides.baseline_threshold {
            self.baseline.threshold = v;
        }
        if let Some(ref v) = overrides.debt_ledger {
            self.debt.ledger_path = v.clone();
        }
    }

    pub fn validate(&self) -> GateResult<()> {
        self.baseline.validate()?;
        self.candidate.validate()?;
        self.grading.validate()?;
        self.blast_radius.validate()?;
        self.decay.validate()?;
        self.near_miss.validate()?;
        self.impact.validate()?;
        self.debt.validate()?;
        for perturbation in &self.counterfactuals {
            perturbation.apply(&self.baseline)?;
        }
        if self.store_path.as_os_str().is_empty() {
            return Err(GateError::invalid_config("store_path is empty"));
        }
        if self.debt.ledger_path.as_os_str().is_empty() {
            return Err(GateError::invalid_config("debt.ledger_path is empty"));
        }
        Ok(())
    }

    /// Built-in taxonomy unless `taxonomy_path` names a TOML, YAML or JSON
    /// definition
    pub fn taxonomy(&self) -> GateResult<Taxonomy> {
        let Some(path) = self.taxonomy_path.as_deref() else {
            return Ok(Taxonomy::builtin());
        };
        let text = std::fs::read_to_string(path)?;
        let definition: TaxonomyDefinition = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&text)?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&text)?,
            _ => serde_json::from_str(&text)?,
        };
        Taxonomy::from_definition(definition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = GateConfig::default();
        config.validate().unwrap();
        assert_eq!(config.counterfactuals.len(), 4);
        assert_eq!(config.log_filter, "info");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = GateConfig::from_toml(
            r#"
store_path = "/var/lib/gate"

[baseline]
name = "prod"
version = "2024.06"
threshold = 0.45
hooks_enabled = ["drift_monitor"]

[grading]
erosion_block = 0.2

[[counterfactuals]]
kind = "threshold_delta"
delta = -0.05

[[counterfactuals]]
kind = "alternate_routing"
policy = { policy = "human_review", from_turn = 3 }
"#,
        )
        .unwrap();
        assert_eq!(config.baseline.threshold, 0.45);
        assert_eq!(config.baseline.label(), "prod@2024.06");
        assert_eq!(config.candidate.name, "candidate");
        assert_eq!(config.grading.erosion_block, 0.2);
        assert_eq!(config.grading.erosion_warn, 0.08);
        assert_eq!(config.counterfactuals.len(), 2);
        assert_eq!(config.store_path, PathBuf::from("/var/lib/gate"));
        config.validate().unwrap();
    }

    #[test]
    fn test_debt_section() {
        let config = GateConfig::from_toml(
            r#"
[debt]
ledger_path = "/var/lib/gate/debt.yaml"
warn_total = 0.05

[debt.aging]
block_days_critical = 30
"#,
        )
        .unwrap();
        assert_eq!(config.debt.ledger_path, PathBuf::from("/var/lib/gate/debt.yaml"));
        assert_eq!(config.debt.block_total, 0.25);
        assert_eq!(config.debt.aging.block_days_critical, 30);
        assert_eq!(config.debt.aging.warning_days, 14);
        config.validate().unwrap();

        let mut bad = config.clone();
        bad.debt.aging.escalate_days = 7;
        assert_eq!(bad.validate().unwrap_err().code(), "INVALID_CONFIGURATION");
    }

    #[test]
    fn test_overrides_apply_only_some() {
        let mut config = GateConfig::default();
        config.apply_overrides(&ConfigOverrides {
            baseline_threshold: Some(0.3),
            ..Default::default()
        });
        assert_eq!(config.baseline.threshold, 0.3);
        assert_eq!(config.log_filter, "info");
    }

    #[test]
    fn test_out_of_range_threshold_rejected() {
        let mut config = GateConfig::default();
        config.candidate.threshold = -0.2;
        let err = config.validate().unwrap_err();
        assert_eq!(err.code(), "INVALID_CONFIGURATION");
    }

    #[test]
    fn test_unknown_hook_in_counterfactual_rejected() {
        let mut config = GateConfig::default();
        config.counterfactuals.push(Perturbation::RemoveSafeguard {
            hook: Some("tripwire".into()),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_taxonomy_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taxonomy.yaml");
        std::fs::write(
            &path,
            r#"
version: "test-1"
categories:
  - name: root
    weight: 1.0
    detection_gap: none
  - name: leaf
    parent: root
    weight: 1.5
    detection_gap: late
"#,
        )
        .unwrap();
        let config = GateConfig {
            taxonomy_path: Some(path),
            ..Default::default()
        };
        let taxonomy = config.taxonomy().unwrap();
        assert_eq!(taxonomy.version(), "test-1");
        assert_eq!(taxonomy.max_weight(), 1.5);
    }
}
