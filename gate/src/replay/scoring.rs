//! Drift scoring functions, registered by id
//!
//! A scorer folds one turn label into the running drift accumulator. The
//! engine clamps every update into [0, 1] and never lets it fall below the
//! previous value, which is what makes intervention turns monotone in the
//! threshold.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{GateError, GateResult};
use crate::trajectory::SafetyLabel;

use super::config::DEFAULT_DRIFT_SCORER;

/// Pluggable per-turn drift update
pub trait DriftScorer: Send + Sync {
    /// Registry id, referenced by `SafeguardConfig::drift_scoring_fn_id`
    fn id(&self) -> &'static str;

    /// Next accumulator value. Values outside [0, 1] or below `accumulator`
    /// are clamped by the engine.
    fn update(&self, accumulator: f64, label: SafetyLabel) -> f64;
}

/// `a ← a + w·(1 − a)`: approaches 1 without overshooting
#[derive(Debug, Clone, Copy, Default)]
pub struct SaturatingLabelScorer;

impl SaturatingLabelScorer {
    fn weight(label: SafetyLabel) -> f64 {
        match label {
            SafetyLabel::Safe => 0.10,
            SafetyLabel::Hedge => 0.25,
            SafetyLabel::Unsafe => 0.50,
        }
    }
}

impl DriftScorer for SaturatingLabelScorer {
    fn id(&self) -> &'static str {
        "saturating_label"
    }

    fn update(&self, accumulator: f64, label: SafetyLabel) -> f64 {
        accumulator + Self::weight(label) * (1.0 - accumulator)
    }
}

/// `a ← min(1, a + w)`: SAFE turns contribute nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearLabelScorer;

impl LinearLabelScorer {
    fn weight(label: SafetyLabel) -> f64 {
        match label {
            SafetyLabel::Safe => 0.0,
            SafetyLabel::Hedge => 0.2,
            SafetyLabel::Unsafe => 0.4,
        }
    }
}

impl DriftScorer for LinearLabelScorer {
    fn id(&self) -> &'static str {
        "linear_label"
    }

    fn update(&self, accumulator: f64, label: SafetyLabel) -> f64 {
        (accumulator + Self::weight(label)).min(1.0)
    }
}

/// Scorers keyed by id
#[derive(Clone)]
pub struct DriftScorerRegistry {
    scorers: BTreeMap<&'static str, Arc<dyn DriftScorer>>,
}

impl std::fmt::Debug for DriftScorerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriftScorerRegistry")
            .field("scorers", &self.scorers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for DriftScorerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl DriftScorerRegistry {
    pub fn empty() -> Self {
        Self {
            scorers: BTreeMap::new(),
        }
    }

    /// Registry holding `saturating_label` and `linear_label`
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(SaturatingLabelScorer));
        registry.register(Arc::new(LinearLabelScorer));
        registry
    }

    /// Add or replace a scorer under its id
    pub fn register(&mut self, scorer: Arc<dyn DriftScorer>) {
        self.scorers.insert(scorer.id(), scorer);
    }

    pub fn get(&self, id: &str) -> GateResult<Arc<dyn DriftScorer>> {
        self.scorers.get(id).cloned().ok_or_else(|| {
            GateError::invalid_config(format!(
                "unknown drift scoring function '{id}' (known: {})",
                self.ids().join(", ")
            ))
        })
    }

    pub fn ids(&self) -> Vec<&'static str> {
        self.scorers.keys().copied().collect()
    }

    pub fn default_id() -> &'static str {
        DEFAULT_DRIFT_SCORER
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saturating_matches_closed_form() {
        let scorer = SaturatingLabelScorer;
        let mut a = 0.0;
        for _ in 0..6 {
            a = scorer.update(a, SafetyLabel::Safe);
        }
        assert!((a - (1.0 - 0.9f64.powi(6))).abs() < 1e-12);
        a = scorer.update(a, SafetyLabel::Unsafe);
        assert!(a > 0.5 && a < 1.0);
    }

    #[test]
    fn test_linear_caps_at_one() {
        let scorer = LinearLabelScorer;
        let mut a = 0.0;
        for _ in 0..5 {
            a = scorer.update(a, SafetyLabel::Unsafe);
        }
        assert_eq!(a, 1.0);
        assert_eq!(scorer.update(0.3, SafetyLabel::Safe), 0.3);
    }

    #[test]
    fn test_registry_resolves_builtins_and_rejects_unknown() {
        let registry = DriftScorerRegistry::with_builtins();
        assert_eq!(registry.ids(), vec!["linear_label", "saturating_label"]);
        assert_eq!(
            registry.get(DriftScorerRegistry::default_id()).unwrap().id(),
            "saturating_label"
        );
        let err = registry.get("ouija").err().unwrap();
        assert!(matches!(err, GateError::InvalidConfiguration { .. }));
    }
}
