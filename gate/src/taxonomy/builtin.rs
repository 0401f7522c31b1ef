//! Built-in calibrated taxonomy and the legacy failure-type mapping

use super::{FailureCategory, Taxonomy};

/// Version tag of the built-in taxonomy
pub const BUILTIN_TAXONOMY_VERSION: &str = "2024.1";

/// (name, parent, weight, detection gap)
const CATEGORIES: &[(&str, Option<&str>, f64, &str)] = &[
    ("detection", None, 1.3, "Safeguards failed to detect the failure in time"),
    ("policy", None, 1.5, "Policy or escalation rules allowed the failure"),
    ("analysis", None, 1.2, "Signal aggregation misjudged accumulated risk"),
    ("tool", None, 1.35, "Tool use was not verified or constrained"),
    ("coordination", None, 1.6, "State across sessions or capabilities was not tracked"),
    (
        "pre_action_detection_fn",
        Some("detection"),
        1.2,
        "Unsafe request not flagged before the agent acted",
    ),
    (
        "trajectory_monitoring_fn",
        Some("detection"),
        1.5,
        "Gradual multi-turn drift never crossed the monitor threshold",
    ),
    (
        "tool_verification_fn",
        Some("detection"),
        1.3,
        "Tool output accepted without verification",
    ),
    (
        "escalation_policy_fn",
        Some("policy"),
        1.6,
        "Escalation rule did not route the conversation for review",
    ),
    (
        "human_review_protocol_fn",
        Some("policy"),
        1.8,
        "Human review was asynchronous or skipped, giving false confidence",
    ),
    (
        "policy_schema_mismatch",
        Some("policy"),
        1.1,
        "Policy schema did not express the violated rule",
    ),
    (
        "intent_aggregation_fn",
        Some("analysis"),
        1.4,
        "Benign-looking steps were not aggregated into the harmful intent",
    ),
    (
        "threshold_misconfig",
        Some("analysis"),
        1.0,
        "Detector threshold set too permissively",
    ),
    (
        "tool_hallucination",
        Some("tool"),
        1.4,
        "Agent invoked or reported a tool result that never happened",
    ),
    (
        "tool_chain_abuse",
        Some("tool"),
        1.3,
        "Individually allowed tool calls composed into a disallowed action",
    ),
    (
        "cross_session_blind",
        Some("coordination"),
        1.7,
        "Misuse split across sessions evaded per-session checks",
    ),
    (
        "capability_accumulation",
        Some("coordination"),
        1.5,
        "Agent accumulated capabilities beyond the task scope",
    ),
];

/// Legacy free-form failure types mapped onto taxonomy leaves
const FAILURE_TYPE_MAPPING: &[(&str, &[&str])] = &[
    (
        "prompt_injection",
        &["pre_action_detection_fn", "tool_verification_fn"],
    ),
    (
        "policy_erosion",
        &[
            "trajectory_monitoring_fn",
            "threshold_misconfig",
            "escalation_policy_fn",
        ],
    ),
    (
        "tool_hallucination",
        &["tool_hallucination", "tool_verification_fn"],
    ),
    (
        "coordinated_misuse",
        &["intent_aggregation_fn", "capability_accumulation"],
    ),
    (
        "escalation_delay",
        &["human_review_protocol_fn", "escalation_policy_fn"],
    ),
    (
        "cross_session",
        &["cross_session_blind", "intent_aggregation_fn"],
    ),
];

/// Categories a legacy failure type maps to; empty when unmapped
pub fn map_failure_type(failure_type: &str) -> &'static [&'static str] {
    let key = failure_type.trim().to_ascii_lowercase();
    FAILURE_TYPE_MAPPING
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, cats)| *cats)
        .unwrap_or(&[])
}

pub(super) fn taxonomy() -> Taxonomy {
    let categories = CATEGORIES
        .iter()
        .map(|(name, parent, weight, gap)| FailureCategory::new(*name, *parent, *weight, *gap))
        .collect();
    match Taxonomy::new(BUILTIN_TAXONOMY_VERSION, categories) {
        Ok(tax) => tax,
        // The table above is a compile-time constant checked by tests
        Err(err) => unreachable!("built-in taxonomy is invalid: {err}"),
    }
}
