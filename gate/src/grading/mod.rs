//! Risk Grading Engine — OK / WARN / BLOCK release verdicts
//!
//! A pure, total decision table over five signals. Evaluated top to bottom,
//! first match wins:
//!
//! | Condition | Verdict |
//! |---|---|
//! | regression_flag AND (erosion > block OR delayed > block OR max_category > block) | BLOCK |
//! | erosion > warn OR delayed > warn OR max_category > warn OR affected_categories >= N | WARN |
//! | otherwise | OK |
//!
//! Exit codes are a wire contract with CI: OK=0, BLOCK=1, WARN=2.
//!
//! [`impact`] maps the same incident onto an operational severity and an
//! advisory release action.

pub mod impact;

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{GateError, GateResult};

pub use impact::{
    assess_impact, summarize_impact, ImpactAssessment, ImpactSignals, ImpactSummary,
    ImpactThresholds, ReleaseAction,
};

/// Stable rule keys, surfaced in justifications and regression assertions
pub const RULE_POLICY_EROSION: &str = "policy_erosion_delta";
pub const RULE_DELAYED_FAILURE: &str = "delayed_failure_delta";
pub const RULE_MAX_CATEGORY: &str = "max_category_delta";
pub const RULE_AFFECTED_CATEGORIES: &str = "affected_categories";
/// Reason key when nothing tripped
pub const RULE_WITHIN_THRESHOLDS: &str = "within_thresholds";

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

/// Release gating verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Ok,
    Warn,
    Block,
}

impl Verdict {
    /// CI exit code. Changing these is a breaking change.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::Block => 1,
            Self::Warn => 2,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "OK" => Some(Self::Ok),
            "WARN" => Some(Self::Warn),
            "BLOCK" => Some(Self::Block),
            _ => None,
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::Warn => write!(f, "WARN"),
            Self::Block => write!(f, "BLOCK"),
        }
    }
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// Numeric inputs of the decision table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Signals {
    /// Candidate minus baseline policy-erosion rate
    #[serde(alias = "erosion")]
    pub erosion_delta: f64,
    /// Candidate minus baseline delayed-failure rate
    #[serde(alias = "delayed")]
    pub delayed_failure_delta: f64,
    #[serde(alias = "max_category")]
    pub max_category_delta: f64,
    pub affected_categories: u32,
    /// This exact pattern failed before
    pub regression_flag: bool,
    /// Per-category deltas the maxima were taken from, when known
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub category_deltas: BTreeMap<String, f64>,
}

impl Signals {
    pub fn new(
        erosion_delta: f64,
        delayed_failure_delta: f64,
        max_category_delta: f64,
        affected_categories: u32,
        regression_flag: bool,
    ) -> Self {
        Self {
            erosion_delta,
            delayed_failure_delta,
            max_category_delta,
            affected_categories,
            regression_flag,
            category_deltas: BTreeMap::new(),
        }
    }

    /// Build signals from a per-category delta map.
    ///
    /// `max_category_delta` is the largest delta; `affected_categories`
    /// counts deltas strictly above `significance_floor`.
    pub fn from_category_deltas(
        erosion_delta: f64,
        delayed_failure_delta: f64,
        category_deltas: BTreeMap<String, f64>,
        regression_flag: bool,
        significance_floor: f64,
    ) -> Self {
        let max_category_delta = category_deltas.values().copied().fold(0.0, f64::max);
        let affected_categories = category_deltas
            .values()
            .filter(|d| **d > significance_floor)
            .count() as u32;
        Self {
            erosion_delta,
            delayed_failure_delta,
            max_category_delta,
            affected_categories,
            regression_flag,
            category_deltas,
        }
    }

    /// Rates must be finite and within [0, 1]
    pub fn validate(&self) -> GateResult<()> {
        let rates = [
            (RULE_POLICY_EROSION, self.erosion_delta),
            (RULE_DELAYED_FAILURE, self.delayed_failure_delta),
            (RULE_MAX_CATEGORY, self.max_category_delta),
        ];
        for (name, value) in rates
            .into_iter()
            .chain(self.category_deltas.iter().map(|(k, v)| (k.as_str(), *v)))
        {
            check_rate(name, value)?;
        }
        Ok(())
    }
}

fn check_rate(name: &str, value: f64) -> GateResult<()> {
    if value.is_nan() {
        return Err(GateError::invalid_signal(name, value, "not a number"));
    }
    if value < 0.0 {
        return Err(GateError::invalid_signal(name, value, "negative rate"));
    }
    if value > 1.0 {
        return Err(GateError::invalid_signal(name, value, "rate above 1"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

/// Decision-table thresholds. Defaults are the calibrated release policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct GradingThresholds {
    pub erosion_block: f64,
    pub delayed_block: f64,
    pub category_block: f64,
    pub erosion_warn: f64,
    pub delayed_warn: f64,
    pub category_warn: f64,
    /// WARN once this many categories moved
    pub affected_categories_warn: u32,
    /// A category counts as affected above this delta
    pub significance_floor: f64,
}

impl Default for GradingThresholds {
    fn default() -> Self {
        Self {
            erosion_block: 0.15,
            delayed_block: 0.15,
            category_block: 0.20,
            erosion_warn: 0.08,
            delayed_warn: 0.08,
            category_warn: 0.10,
            affected_categories_warn: 3,
            significance_floor: 0.05,
        }
    }
}

impl GradingThresholds {
    pub fn validate(&self) -> GateResult<()> {
        let all = [
            ("erosion_block", self.erosion_block),
            ("delayed_block", self.delayed_block),
            ("category_block", self.category_block),
            ("erosion_warn", self.erosion_warn),
            ("delayed_warn", self.delayed_warn),
            ("category_warn", self.category_warn),
            ("significance_floor", self.significance_floor),
        ];
        for (name, value) in all {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(GateError::invalid_config(format!(
                    "grading.{name} = {value} outside [0, 1]"
                )));
            }
        }
        let pairs = [
            ("erosion", self.erosion_warn, self.erosion_block),
            ("delayed", self.delayed_warn, self.delayed_block),
            ("category", self.category_warn, self.category_block),
        ];
        for (name, warn, block) in pairs {
            if warn > block {
                return Err(GateError::invalid_config(format!(
                    "grading.{name}_warn ({warn}) exceeds {name}_block ({block})"
                )));
            }
        }
        if self.affected_categories_warn == 0 {
            return Err(GateError::invalid_config(
                "grading.affected_categories_warn must be >= 1",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Grading
// ---------------------------------------------------------------------------

/// Verdict plus the signals and rules that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RiskVerdict {
    pub verdict: Verdict,
    pub exit_code: i32,
    pub signals: Signals,
    pub justification: String,
    /// Rule keys that tripped at the verdict's level, in table order
    #[serde(default)]
    pub tripped_rules: Vec<String>,
}

impl RiskVerdict {
    /// First tripped rule key, or `within_thresholds`
    pub fn primary_reason(&self) -> &str {
        self.tripped_rules
            .first()
            .map(String::as_str)
            .unwrap_or(RULE_WITHIN_THRESHOLDS)
    }
}

/// Decision table bound to a threshold set
#[derive(Debug, Clone, Default)]
pub struct RiskGrader {
    thresholds: GradingThresholds,
}

impl RiskGrader {
    pub fn new(thresholds: GradingThresholds) -> GateResult<Self> {
        thresholds.validate()?;
        Ok(Self { thresholds })
    }

    pub fn thresholds(&self) -> &GradingThresholds {
        &self.thresholds
    }

    /// Grade a signal tuple. Total over valid signals; `InvalidSignal` only
    /// for out-of-range rates.
    pub fn grade(&self, signals: &Signals) -> GateResult<RiskVerdict> {
        signals.validate()?;
        let t = &self.thresholds;

        let block_rules = if signals.regression_flag {
            tripped(&[
                (
                    RULE_POLICY_EROSION,
                    signals.erosion_delta > t.erosion_block,
                    signals.erosion_delta,
                    t.erosion_block,
                ),
                (
                    RULE_DELAYED_FAILURE,
                    signals.delayed_failure_delta > t.delayed_block,
                    signals.delayed_failure_delta,
                    t.delayed_block,
                ),
                (
                    RULE_MAX_CATEGORY,
                    signals.max_category_delta > t.category_block,
                    signals.max_category_delta,
                    t.category_block,
                ),
            ])
        } else {
            Vec::new()
        };

        let (verdict, rules) = if !block_rules.is_empty() {
            (Verdict::Block, block_rules)
        } else {
            let mut warn_rules = tripped(&[
                (
                    RULE_POLICY_EROSION,
                    signals.erosion_delta > t.erosion_warn,
                    signals.erosion_delta,
                    t.erosion_warn,
                ),
                (
                    RULE_DELAYED_FAILURE,
                    signals.delayed_failure_delta > t.delayed_warn,
                    signals.delayed_failure_delta,
                    t.delayed_warn,
                ),
                (
                    RULE_MAX_CATEGORY,
                    signals.max_category_delta > t.category_warn,
                    signals.max_category_delta,
                    t.category_warn,
                ),
            ]);
            if signals.affected_categories >= t.affected_categories_warn {
                warn_rules.push((
                    RULE_AFFECTED_CATEGORIES,
                    format!(
                        "{RULE_AFFECTED_CATEGORIES} {} >= {}",
                        signals.affected_categories, t.affected_categories_warn
                    ),
                ));
            }
            if warn_rules.is_empty() {
                (Verdict::Ok, Vec::new())
            } else {
                (Verdict::Warn, warn_rules)
            }
        };

        let justification = match verdict {
            Verdict::Ok => format!("{verdict}: {RULE_WITHIN_THRESHOLDS}"),
            Verdict::Block => format!(
                "{verdict}: regression_flag with {}",
                rules.iter().map(|(_, d)| d.as_str()).collect::<Vec<_>>().join("; ")
            ),
            Verdict::Warn => format!(
                "{verdict}: {}",
                rules.iter().map(|(_, d)| d.as_str()).collect::<Vec<_>>().join("; ")
            ),
        };

        info!(
            verdict = %verdict,
            exit_code = verdict.exit_code(),
            erosion_delta = signals.erosion_delta,
            delayed_failure_delta = signals.delayed_failure_delta,
            max_category_delta = signals.max_category_delta,
            affected_categories = signals.affected_categories,
            regression_flag = signals.regression_flag,
            "Risk graded"
        );

        Ok(RiskVerdict {
            verdict,
            exit_code: verdict.exit_code(),
            signals: signals.clone(),
            justification,
            tripped_rules: rules.into_iter().map(|(k, _)| k.to_string()).collect(),
        })
    }
}

fn tripped(rules: &[(&'static str, bool, f64, f64)]) -> Vec<(&'static str, String)> {
    rules
        .iter()
        .filter(|(_, hit, _, _)| *hit)
        .map(|(key, _, value, limit)| (*key, format!("{key} {value:.3} > {limit:.2}")))
        .collect()
}

/// Grade with the default thresholds
pub fn grade(signals: &Signals) -> GateResult<RiskVerdict> {
    RiskGrader::default().grade(signals)
}
