//! Safeguard configuration — named, versioned threshold and hook set

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{GateError, GateResult};

/// Accumulator check against the configured threshold
pub const HOOK_DRIFT_MONITOR: &str = "drift_monitor";
/// Intervene on any UNSAFE-labelled turn
pub const HOOK_HARD_STOP: &str = "hard_stop";
/// Intervene on any HEDGE-labelled turn
pub const HOOK_HEDGE_REVIEW: &str = "hedge_review";

/// Every hook the replay engine knows how to evaluate
pub const KNOWN_HOOKS: &[&str] = &[HOOK_DRIFT_MONITOR, HOOK_HARD_STOP, HOOK_HEDGE_REVIEW];

/// Default drift scoring function id
pub const DEFAULT_DRIFT_SCORER: &str = "saturating_label";

/// How turns are routed for review during replay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum RoutingPolicy {
    /// Only enabled hooks intervene
    #[default]
    Standard,
    /// Forced human review intervenes on the first non-SAFE turn at or
    /// after `from_turn`
    HumanReview { from_turn: u32 },
}

impl std::fmt::Display for RoutingPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Standard => write!(f, "standard"),
            Self::HumanReview { from_turn } => write!(f, "human_review(from_turn={from_turn})"),
        }
    }
}

/// A named, versioned set of safeguard thresholds and enabled hooks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafeguardConfig {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    /// Drift accumulator threshold in [0, 1]; intervention when exceeded
    pub threshold: f64,
    #[serde(default = "default_hooks")]
    pub hooks_enabled: BTreeSet<String>,
    #[serde(default = "default_scorer")]
    pub drift_scoring_fn_id: String,
    #[serde(default)]
    pub routing: RoutingPolicy,
}

fn default_version() -> String {
    "1".to_string()
}

fn default_hooks() -> BTreeSet<String> {
    [HOOK_DRIFT_MONITOR, HOOK_HARD_STOP]
        .into_iter()
        .map(str::to_string)
        .collect()
}

fn default_scorer() -> String {
    DEFAULT_DRIFT_SCORER.to_string()
}

impl SafeguardConfig {
    /// Config with the default hooks (`drift_monitor`, `hard_stop`) and scorer
    pub fn new(name: impl Into<String>, threshold: f64) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            threshold,
            hooks_enabled: default_hooks(),
            drift_scoring_fn_id: default_scorer(),
            routing: RoutingPolicy::Standard,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Replace the enabled hook set
    pub fn with_hooks<I, S>(mut self, hooks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hooks_enabled = hooks.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_scorer(mut self, scorer_id: impl Into<String>) -> Self {
        self.drift_scoring_fn_id = scorer_id.into();
        self
    }

    pub fn with_routing(mut self, routing: RoutingPolicy) -> Self {
        self.routing = routing;
        self
    }

    pub fn hook_enabled(&self, hook: &str) -> bool {
        self.hooks_enabled.contains(hook)
    }

    /// `name@version`
    pub fn label(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }

    /// Range and vocabulary checks. Scorer ids are resolved by the registry.
    pub fn validate(&self) -> GateResult<()> {
        if self.name.trim().is_empty() {
            return Err(GateError::invalid_config("safeguard config name is empty"));
        }
        if !self.threshold.is_finite() || !(0.0..=1.0).contains(&self.threshold) {
            return Err(GateError::invalid_config(format!(
                "threshold {} of '{}' outside [0, 1]",
                self.threshold,
                self.label()
            )));
        }
        if let Some(unknown) = self
            .hooks_enabled
            .iter()
            .find(|h| !KNOWN_HOOKS.contains(&h.as_str()))
        {
            return Err(GateError::invalid_config(format!(
                "unknown hook '{unknown}' in '{}' (known: {})",
                self.label(),
                KNOWN_HOOKS.join(", ")
            )));
        }
        if let RoutingPolicy::HumanReview { from_turn: 0 } = self.routing {
            return Err(GateError::invalid_config(
                "human_review routing from_turn must be >= 1",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let cfg = SafeguardConfig::new("baseline", 0.5);
        assert!(cfg.validate().is_ok());
        assert!(cfg.hook_enabled(HOOK_DRIFT_MONITOR));
        assert_eq!(cfg.label(), "baseline@1");
    }

    #[test]
    fn test_negative_threshold_rejected() {
        let err = SafeguardConfig::new("b", -0.1).validate().unwrap_err();
        assert!(matches!(err, GateError::InvalidConfiguration { .. }));
        assert!(SafeguardConfig::new("b", f64::NAN).validate().is_err());
        assert!(SafeguardConfig::new("b", 1.01).validate().is_err());
    }

    #[test]
    fn test_unknown_hook_rejected() {
        let err = SafeguardConfig::new("b", 0.5)
            .with_hooks(["drift_monitor", "psychic_filter"])
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("psychic_filter"));
    }

    #[test]
    fn test_toml_shape() {
        let cfg: SafeguardConfig = toml::from_str(
            r#"
            name = "candidate"
            version = "2.3"
            threshold = 0.4
            hooks_enabled = ["drift_monitor"]
            routing = { policy = "human_review", from_turn = 3 }
            "#,
        )
        .unwrap();
        assert_eq!(cfg.routing, RoutingPolicy::HumanReview { from_turn: 3 });
        assert_eq!(cfg.drift_scoring_fn_id, DEFAULT_DRIFT_SCORER);
        assert!(!cfg.hook_enabled(HOOK_HARD_STOP));
    }
}
