//! Plain-text reports for terminal output

use std::fmt::Write;

use incident_gate::debt::{AgingReport, DebtEntry, DebtSummary};
use incident_gate::lifecycle::{CoverageSummary, DecayRecommendation};
use incident_gate::replay::{CounterfactualResult, CounterfactualSummary};
use incident_gate::{Assessment, BlastRadiusReport, RegressionCase, ReplayTrace, RiskVerdict};

fn turn_or_never(turn: Option<u32>) -> String {
    turn.map_or_else(|| "never".to_string(), |t| format!("turn {t}"))
}

pub fn trace(trace: &ReplayTrace) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Replay of {} under {} (threshold {:.2}, scorer {})",
        trace.incident_id, trace.config, trace.threshold, trace.scorer
    );
    let _ = writeln!(out, "  {:>4}  {:<7} {:>7}  intervention", "turn", "label", "score");
    for step in &trace.steps {
        let fired = match (step.intervention_fired, step.detector) {
            (true, Some(d)) => format!("yes ({d})"),
            (true, None) => "yes".to_string(),
            (false, _) => String::new(),
        };
        let _ = writeln!(
            out,
            "  {:>4}  {:<7} {:>7.3}  {}",
            step.turn, step.label, step.cumulative_score, fired
        );
    }
    let _ = writeln!(out, "First failure:      {}", turn_or_never(trace.first_failure_turn));
    let _ = writeln!(out, "First intervention: {}", turn_or_never(trace.intervention_turn));
    let _ = writeln!(
        out,
        "Policy erosion {:.3}, delayed failure {:.3}",
        trace.policy_erosion_rate(),
        trace.delayed_failure_rate()
    );
    out
}

pub fn counterfactuals(
    results: &[CounterfactualResult],
    summary: &CounterfactualSummary,
) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Counterfactuals: {} evaluated, {} would have helped",
        summary.evaluated, summary.would_have_helped
    );
    for r in results {
        let _ = writeln!(
            out,
            "  {:<10} {:<40} delta {:>+3}  confidence {:.2}",
            r.outcome.to_string(),
            r.perturbation.to_string(),
            r.intervention_turn_delta,
            r.confidence
        );
    }
    if let Some(best) = summary.prioritized_mitigations.first() {
        let _ = writeln!(out, "Top mitigation: {}", best.reasoning);
    }
    out
}

pub fn blast_radius(report: &BlastRadiusReport) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Blast radius of {} [{}]",
        report.incident_id, report.fingerprint
    );
    for c in &report.corpora {
        if c.not_applicable {
            let _ = writeln!(out, "  {:<24} not applicable", c.corpus);
        } else {
            let _ = writeln!(
                out,
                "  {:<24} {:>5} / {:<5} ({:.1}%)",
                c.corpus,
                c.affected,
                c.total,
                c.rate * 100.0
            );
        }
    }
    for name in &report.unavailable {
        let _ = writeln!(out, "  {name:<24} UNAVAILABLE");
    }
    let _ = writeln!(
        out,
        "Prevalence {:.1}% ({} / {}), risk {}, confidence {}",
        report.prevalence * 100.0,
        report.total_affected,
        report.total_sampled,
        report.risk_level,
        report.confidence
    );
    let _ = writeln!(out, "Recommendation: {}", report.recommendation);
    out
}

pub fn verdict(verdict: &RiskVerdict) -> String {
    let s = &verdict.signals;
    let mut out = String::new();
    let _ = writeln!(out, "Verdict: {} (exit {})", verdict.verdict, verdict.exit_code);
    let _ = writeln!(
        out,
        "  erosion {:.3}  delayed {:.3}  max category {:.3}  affected {}  regression {}",
        s.erosion_delta,
        s.delayed_failure_delta,
        s.max_category_delta,
        s.affected_categories,
        s.regression_flag
    );
    let _ = writeln!(out, "  {}", verdict.justification);
    out
}

pub fn assessment(a: &Assessment) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Incident {} v{} (taxonomy {})",
        a.incident_id, a.incident_version, a.taxonomy_version
    );
    let _ = writeln!(
        out,
        "Severity score {:.3}{}",
        a.severity_score,
        a.severity_tier.map(|t| format!(", tier {t}")).unwrap_or_default()
    );
    if let Some(fp) = &a.fingerprint {
        let _ = writeln!(out, "Fingerprint {fp}");
    }
    let _ = writeln!(
        out,
        "Baseline {} intervenes at {}; candidate {} at {}",
        a.baseline.config,
        turn_or_never(a.baseline.intervention_turn),
        a.candidate.config,
        turn_or_never(a.candidate.intervention_turn)
    );
    for m in &a.near_misses {
        let _ = writeln!(
            out,
            "Near miss: {} {} at turn {} (margin {:.2}, harm {}){}",
            m.config,
            m.kind,
            m.turn,
            m.catch_margin,
            m.harm_severity,
            if m.is_high_risk() { " HIGH RISK" } else { "" }
        );
    }
    out.push('\n');
    out.push_str(&counterfactuals(&a.counterfactuals, &a.counterfactual_summary));
    if let Some(report) = &a.blast_radius {
        out.push('\n');
        out.push_str(&blast_radius(report));
    }
    out.push('\n');
    out.push_str(&verdict(&a.verdict));
    let _ = writeln!(
        out,
        "Impact: {} -> {} ({})",
        a.impact.computed_severity, a.impact.release_action, a.impact.rationale
    );
    out
}

pub fn case(case: &RegressionCase) -> String {
    let mut out = String::new();
    let state = case
        .state()
        .map(|s| s.to_string())
        .unwrap_or_else(|e| format!("CORRUPT ({e})"));
    let _ = writeln!(out, "{} [{}] {}", case.id(), state, case.fingerprint());
    let e = &case.record.expected;
    let _ = writeln!(
        out,
        "  from {} v{}; expect safe through turn {}, verdict {} citing '{}'",
        case.record.source_incident,
        case.record.incident_version,
        e.max_safe_turn,
        e.required_verdict,
        e.required_reason_substring
    );
    for entry in &case.audit_log {
        let _ = writeln!(
            out,
            "  #{} {} {} -> {} by {}: {}{}",
            entry.sequence,
            entry.timestamp.format("%Y-%m-%d %H:%M"),
            entry.from.map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
            entry.to,
            entry.actor,
            entry.reason,
            if entry.skipped.is_empty() {
                String::new()
            } else {
                format!(
                    " (skipped {})",
                    entry.skipped.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
                )
            }
        );
    }
    out
}

pub fn coverage(summary: &CoverageSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Regression cases: {}", summary.total);
    for (state, count) in &summary.by_state {
        let _ = writeln!(out, "  {state:<11} {count}");
    }
    if !summary.by_category.is_empty() {
        let _ = writeln!(out, "By failure category (live / total):");
        for (category, total) in &summary.by_category {
            let live = summary.live_by_category.get(category).copied().unwrap_or(0);
            let _ = writeln!(out, "  {category:<28} {live} / {total}");
        }
    }
    out
}

pub fn decay(recommendations: &[DecayRecommendation], applied: bool) -> String {
    let mut out = String::new();
    if recommendations.is_empty() {
        let _ = writeln!(out, "No case has decayed below its review threshold");
        return out;
    }
    let verb = if applied { "Applied" } else { "Recommended" };
    for r in recommendations {
        let _ = writeln!(
            out,
            "{verb}: {} {} -> {} (relevance {:.3}, {:.0} days since review)",
            r.case_id, r.from, r.to, r.relevance, r.days_since_review
        );
    }
    out
}

pub fn debt_entry(entry: &DebtEntry) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} [{}] {} from {} (release {})",
        entry.debt_id,
        entry.status,
        entry.severity,
        entry.source_incident,
        entry.introduced_by_release
    );
    let _ = writeln!(out, "  gap: {}", entry.mechanism_gap);
    if let Some(reason) = entry.block_reason.as_deref().filter(|_| entry.blocks_release) {
        let _ = writeln!(out, "  blocks release: {reason}");
    }
    if !entry.regression_cases.is_empty() {
        let _ = writeln!(out, "  cleared by {}", entry.regression_cases.join(", "));
    }
    if let Some(a) = &entry.risk_acceptance {
        let _ = writeln!(
            out,
            "  accepted by {} until {}",
            a.approved_by,
            a.expires.format("%Y-%m-%d")
        );
    }
    out
}

pub fn debt_status(summary: &DebtSummary, aging: &AgingReport, blocking: &[&DebtEntry]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Alignment debt: {} (total {:.3}; {} open, {} accepted, {} mitigated)",
        summary.status, summary.total_active_debt, summary.open, summary.accepted, summary.mitigated
    );
    if aging.total_active > 0 {
        let _ = writeln!(
            out,
            "Aging: average {:.1} days, oldest {} days",
            aging.average_age_days, aging.oldest_age_days
        );
    }
    for v in &aging.violations {
        let _ = writeln!(
            out,
            "  {} {} at {} days ({})",
            v.debt_id, v.slo_status, v.age_days, v.severity
        );
    }
    for entry in blocking {
        let _ = writeln!(
            out,
            "  BLOCKING {}: {}",
            entry.debt_id,
            entry.block_reason.as_deref().unwrap_or("release blocked")
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use incident_gate::{grade, Signals};

    #[test]
    fn test_verdict_report_mentions_exit_code() {
        let v = grade(&Signals::new(0.09, 0.0, 0.05, 1, false)).unwrap();
        let text = verdict(&v);
        assert!(text.starts_with("Verdict: WARN (exit 2)"));
        assert!(text.contains("policy_erosion_delta"));
    }

    #[test]
    fn test_empty_decay_report() {
        assert!(decay(&[], false).contains("No case"));
    }
}
