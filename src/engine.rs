//! Learning Engine: turns aggregated pattern effectiveness into scored
//! recommendations, and rule-based improvement suggestions.
//!
//! All functions here are pure and side-effect free — the component holds
//! no state of its own. Substring matching for failure clustering uses
//! `str::contains` directly rather than a hand-rolled scan.

use std::collections::HashMap;

use serde::Serialize;

use crate::types::{
    DeploymentMetric, ExpectedDetails, Impact, Improvement, ImprovementType, PatternEffectivenessRow,
    PatternMetric, Recommendation,
};

const CONFIDENCE_K: f64 = 0.1;
const CONFIDENCE_X0: f64 = 25.0;

/// Sigmoid of sample size. `C(0) = 0`; clamped to <= 0.3 for `n < 3`.
pub fn confidence(n: u64) -> f64 {
    if n == 0 {
        return 0.0;
    }
    let raw = 1.0 / (1.0 + (-CONFIDENCE_K * (n as f64 - CONFIDENCE_X0)).exp());
    if n < 3 {
        raw.min(0.3)
    } else {
        raw
    }
}

/// Pure function of `(success_rate, confidence)`, deterministic at the
/// boundaries 0.3, 0.5, 0.7, 0.9.
pub fn recommend(success_rate: f64, confidence: f64) -> Recommendation {
    if confidence < 0.3 {
        return Recommendation::Investigate;
    }
    if success_rate >= 0.9 {
        Recommendation::Promote
    } else if success_rate >= 0.7 {
        Recommendation::Keep
    } else if success_rate >= 0.5 {
        Recommendation::Demote
    } else {
        Recommendation::Remove
    }
}

/// Build a `PatternMetric` snapshot from one durable row.
pub fn pattern_metric(row: &PatternEffectivenessRow) -> PatternMetric {
    let c = confidence(row.total_usages);
    PatternMetric {
        pattern_name: row.pattern_name.clone(),
        variant: row.variant.clone(),
        domain: row.domain.clone(),
        agent_id: row.agent_id.clone(),
        window_start: row.window_start,
        total_usages: row.total_usages,
        success_rate: row.success_rate,
        avg_cost_usd: row.avg_cost_usd,
        avg_latency_ms: row.avg_latency_ms,
        judge_pass_rate: row.judge_pass_rate,
        judge_avg_score: row.judge_avg_score,
        judge_criterion_scores: row.judge_criterion_scores.clone(),
        recommendation: recommend(row.success_rate, c),
        confidence: c,
    }
}

/// Summary returned alongside the per-pattern rollup.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AnalysisSummary {
    pub total_patterns: usize,
    pub overall_success_rate: f64,
    pub total_cost: f64,
    pub to_promote: usize,
    pub to_deprecate: usize,
    pub window_hours: u32,
}

pub fn analyze(rows: &[PatternEffectivenessRow], window_hours: u32) -> (Vec<PatternMetric>, AnalysisSummary) {
    let metrics: Vec<PatternMetric> = rows.iter().map(pattern_metric).collect();
    let total_usages: u64 = rows.iter().map(|r| r.total_usages).sum();
    let total_successes: u64 = rows.iter().map(|r| r.success_count).sum();
    let total_cost: f64 = rows.iter().map(|r| r.avg_cost_usd * r.total_usages as f64).sum();
    let summary = AnalysisSummary {
        total_patterns: metrics.len(),
        overall_success_rate: if total_usages == 0 { 0.0 } else { total_successes as f64 / total_usages as f64 },
        total_cost,
        to_promote: metrics.iter().filter(|m| m.recommendation == Recommendation::Promote).count(),
        to_deprecate: metrics
            .iter()
            .filter(|m| matches!(m.recommendation, Recommendation::Remove | Recommendation::Demote))
            .count(),
        window_hours,
    };
    (metrics, summary)
}

/// Traditional per-pattern rule: one improvement per pattern whose
/// recommendation is not KEEP (and not INVESTIGATE — too little signal to
/// act on).
pub fn traditional_improvements(rows: &[PatternEffectivenessRow]) -> Vec<Improvement> {
    rows.iter()
        .filter_map(|row| {
            let metric = pattern_metric(row);
            let (improvement_type, impact, description) = match metric.recommendation {
                Recommendation::Promote => (
                    ImprovementType::PatternAdd,
                    Impact::High,
                    format!("promote pattern '{}' (success_rate={:.2})", row.pattern_name, row.success_rate),
                ),
                Recommendation::Remove => (
                    ImprovementType::PatternRemove,
                    Impact::Medium,
                    format!("remove underperforming pattern '{}' (success_rate={:.2})", row.pattern_name, row.success_rate),
                ),
                Recommendation::Demote => (
                    ImprovementType::ParameterTune,
                    Impact::Medium,
                    format!("demote pattern '{}' (success_rate={:.2})", row.pattern_name, row.success_rate),
                ),
                Recommendation::Keep | Recommendation::Investigate => return None,
            };
            Some(
                Improvement::new(
                    improvement_type,
                    description,
                    metric.confidence,
                    impact,
                    row.domain.clone(),
                    ExpectedDetails {
                        success_rate_delta: 0.0,
                        cost_delta_usd: 0.0,
                        latency_delta_ms: 0.0,
                        rationale: format!("recommendation={}", metric.recommendation.as_str()),
                    },
                )
                .with_target_pattern(row.pattern_name.clone()),
            )
        })
        .collect()
}

struct JudgeThreshold {
    criteria: &'static [&'static str],
    threshold: f64,
    impact: Impact,
    improvement_type: ImprovementType,
    label: &'static str,
}

const JUDGE_THRESHOLDS: &[JudgeThreshold] = &[
    JudgeThreshold {
        criteria: &["safety"],
        threshold: 0.70,
        impact: Impact::Critical,
        improvement_type: ImprovementType::ParameterTune,
        label: "safety",
    },
    JudgeThreshold {
        criteria: &["cost"],
        threshold: 0.75,
        impact: Impact::Medium,
        improvement_type: ImprovementType::ParameterTune,
        label: "cost",
    },
    JudgeThreshold {
        criteria: &["quality", "correctness"],
        threshold: 0.80,
        impact: Impact::High,
        improvement_type: ImprovementType::TemplateAdjust,
        label: "quality",
    },
    JudgeThreshold {
        criteria: &["domain", "domain_compliance"],
        threshold: 0.75,
        impact: Impact::High,
        improvement_type: ImprovementType::TemplateAdjust,
        label: "domain",
    },
];

/// Severity-scaled expected deltas, capped per criterion.
fn judge_expected_details(label: &str, severity: f64) -> ExpectedDetails {
    let cap = match label {
        "safety" => 0.25,
        "cost" => 0.05,
        "quality" => 0.15,
        _ => 0.10,
    };
    let scaled = severity.min(cap);
    ExpectedDetails {
        success_rate_delta: scaled,
        cost_delta_usd: if label == "cost" { -scaled * 0.1 } else { 0.0 },
        latency_delta_ms: 0.0,
        rationale: format!("judge criterion '{label}' below threshold by {severity:.2}"),
    }
}

/// Judge-driven improvements: one per pattern/criterion combination below
/// threshold, plus a systemic-review proposal when `judge_pass_rate < 0.70`.
pub fn judge_driven_improvements(rows: &[PatternEffectivenessRow]) -> Vec<Improvement> {
    let mut improvements = Vec::new();
    for row in rows {
        let Some(scores) = &row.judge_criterion_scores else { continue };
        for check in JUDGE_THRESHOLDS {
            let Some((&criterion, &score)) = check
                .criteria
                .iter()
                .find_map(|c| scores.get(*c).map(|s| (c, s)))
            else {
                continue;
            };
            if score < check.threshold {
                let severity = check.threshold - score;
                improvements.push(
                    Improvement::new(
                        check.improvement_type,
                        format!(
                            "pattern '{}' judge criterion '{}' ({:.2}) below threshold ({:.2}) for {}",
                            row.pattern_name, criterion, score, check.threshold, check.label
                        ),
                        confidence(row.total_usages),
                        check.impact,
                        row.domain.clone(),
                        judge_expected_details(check.label, severity),
                    )
                    .with_target_pattern(row.pattern_name.clone())
                    .with_target_agent(row.agent_id.clone()),
                );
            }
        }

        if let Some(pass_rate) = row.judge_pass_rate {
            if pass_rate < 0.70 {
                improvements.push(
                    Improvement::new(
                        ImprovementType::ParameterTune,
                        format!(
                            "pattern '{}' judge pass rate ({:.2}) below 0.70 — systemic review",
                            row.pattern_name, pass_rate
                        ),
                        confidence(row.total_usages),
                        Impact::Critical,
                        row.domain.clone(),
                        ExpectedDetails {
                            success_rate_delta: 0.70 - pass_rate,
                            cost_delta_usd: 0.0,
                            latency_delta_ms: 0.0,
                            rationale: "judge pass rate below systemic review floor".into(),
                        },
                    )
                    .with_target_pattern(row.pattern_name.clone())
                    .with_target_agent(row.agent_id.clone()),
                );
            }
        }
    }
    improvements
}

/// Remove/add/template-adjust suggestions derived from raw usage/success-rate
/// thresholds (independent of the Recommendation-based traditional rule —
/// operates on usage count directly, matching the documented thresholds).
pub fn threshold_improvements(rows: &[PatternEffectivenessRow]) -> Vec<Improvement> {
    let mut improvements = Vec::new();
    for row in rows {
        let c = confidence(row.total_usages);
        if row.total_usages >= 5 && row.success_rate < 0.5 && c >= 0.3 {
            improvements.push(
                Improvement::new(
                    ImprovementType::PatternRemove,
                    format!("pattern '{}' success_rate {:.2} below 0.5 over {} usages", row.pattern_name, row.success_rate, row.total_usages),
                    c,
                    Impact::Medium,
                    row.domain.clone(),
                    ExpectedDetails::default(),
                )
                .with_target_pattern(row.pattern_name.clone()),
            );
        }
        if row.total_usages >= 3 && row.success_rate >= 0.9 && c >= 0.3 {
            improvements.push(
                Improvement::new(
                    ImprovementType::PatternAdd,
                    format!("pattern '{}' success_rate {:.2} over {} usages — promote", row.pattern_name, row.success_rate, row.total_usages),
                    c,
                    Impact::High,
                    row.domain.clone(),
                    ExpectedDetails::default(),
                )
                .with_target_pattern(row.pattern_name.clone()),
            );
        }
        if row.total_usages >= 3 {
            if row.success_rate < 0.6 {
                improvements.push(
                    Improvement::new(
                        ImprovementType::TemplateAdjust,
                        format!("pattern '{}' success_rate {:.2} below 0.6", row.pattern_name, row.success_rate),
                        c,
                        Impact::High,
                        row.domain.clone(),
                        ExpectedDetails::default(),
                    )
                    .with_target_pattern(row.pattern_name.clone()),
                );
            } else if row.avg_cost_usd > 0.10 {
                improvements.push(
                    Improvement::new(
                        ImprovementType::TemplateAdjust,
                        format!("pattern '{}' avg_cost_usd {:.3} above $0.10", row.pattern_name, row.avg_cost_usd),
                        c,
                        Impact::Medium,
                        row.domain.clone(),
                        ExpectedDetails::default(),
                    )
                    .with_target_pattern(row.pattern_name.clone()),
                );
            }
        }
    }
    improvements
}

fn classify_error(message: &str) -> &'static str {
    let lower = message.to_lowercase();
    if lower.contains("validation") {
        "validation"
    } else if lower.contains("pattern") {
        "pattern"
    } else if lower.contains("template") {
        "template"
    } else {
        "other"
    }
}

/// Partition recent failures by error-message bucket and by selected
/// template; any bucket past its threshold becomes a suggestion.
pub fn failure_clustering_improvements(domain: &str, failures: &[DeploymentMetric]) -> Vec<Improvement> {
    if failures.is_empty() {
        return Vec::new();
    }
    let total = failures.len() as f64;
    let mut improvements = Vec::new();

    let mut by_error: HashMap<&'static str, u64> = HashMap::new();
    for failure in failures {
        let bucket = failure.error_message.as_deref().map(classify_error).unwrap_or("other");
        *by_error.entry(bucket).or_insert(0) += 1;
    }
    for (bucket, count) in &by_error {
        if *count >= 3 {
            improvements.push(Improvement::new(
                ImprovementType::ParameterTune,
                format!("{count} of {} recent failures classified as '{bucket}'", failures.len()),
                *count as f64 / total,
                Impact::Medium,
                domain.to_string(),
                ExpectedDetails::default(),
            ));
        }
    }

    let mut by_template: HashMap<&str, u64> = HashMap::new();
    for failure in failures {
        *by_template.entry(failure.selected_template.as_str()).or_insert(0) += 1;
    }
    for (template, count) in &by_template {
        if *count >= 2 {
            improvements.push(Improvement::new(
                ImprovementType::TemplateAdjust,
                format!("{count} of {} recent failures used template '{template}'", failures.len()),
                *count as f64 / total,
                Impact::Medium,
                domain.to_string(),
                ExpectedDetails::default(),
            ));
        }
    }

    improvements
}

/// Sort by (impact HIGH > MEDIUM > LOW, then confidence descending).
pub fn sort_by_impact_then_confidence(improvements: &mut [Improvement]) {
    improvements.sort_by(|a, b| {
        b.impact
            .cmp(&a.impact)
            .then(b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_zero_at_zero_usages() {
        assert_eq!(confidence(0), 0.0);
    }

    #[test]
    fn confidence_clamped_below_three() {
        assert!(confidence(1) <= 0.3);
        assert!(confidence(2) <= 0.3);
    }

    #[test]
    fn confidence_monotone_in_usage() {
        let samples = [0, 1, 5, 10, 25, 50, 100, 500];
        for pair in samples.windows(2) {
            assert!(confidence(pair[0]) <= confidence(pair[1]));
        }
    }

    #[test]
    fn recommendation_boundaries() {
        assert_eq!(recommend(0.95, 0.5), Recommendation::Promote);
        assert_eq!(recommend(0.75, 0.5), Recommendation::Keep);
        assert_eq!(recommend(0.55, 0.5), Recommendation::Demote);
        assert_eq!(recommend(0.2, 0.5), Recommendation::Remove);
        assert_eq!(recommend(0.99, 0.1), Recommendation::Investigate);
    }

    fn row(pattern: &str, total: u64, success: u64) -> PatternEffectivenessRow {
        PatternEffectivenessRow {
            pattern_name: pattern.into(),
            variant: "default".into(),
            domain: "sql".into(),
            agent_id: "agent-1".into(),
            window_start: 0,
            window_end: 3600,
            total_usages: total,
            success_count: success,
            failure_count: total - success,
            success_rate: success as f64 / total as f64,
            avg_cost_usd: 0.01,
            avg_latency_ms: 100,
            error_types: HashMap::new(),
            judge_pass_rate: None,
            judge_avg_score: None,
            judge_criterion_scores: None,
            llm_provider: "anthropic".into(),
            llm_model: "claude".into(),
            created_at: 0,
        }
    }

    #[test]
    fn bad_pattern_yields_pattern_remove_suggestion() {
        let rows = vec![row("bad_pattern", 20, 4)];
        let improvements = threshold_improvements(&rows);
        assert!(improvements
            .iter()
            .any(|i| i.improvement_type == ImprovementType::PatternRemove && i.target_pattern.as_deref() == Some("bad_pattern")));
    }

    #[test]
    fn judge_criterion_below_threshold_emits_critical_safety_improvement() {
        let mut scores = HashMap::new();
        scores.insert("safety".to_string(), 0.60);
        scores.insert("quality".to_string(), 0.85);
        scores.insert("cost".to_string(), 0.80);
        let mut r = row("risky_pattern", 10, 8);
        r.judge_criterion_scores = Some(scores);
        r.judge_pass_rate = Some(0.9);

        let improvements = judge_driven_improvements(&[r]);
        let safety = improvements.iter().find(|i| i.description.contains("safety")).unwrap();
        assert_eq!(safety.impact, Impact::Critical);
    }

    #[test]
    fn all_criteria_passing_emits_no_judge_improvement() {
        let mut scores = HashMap::new();
        scores.insert("safety".to_string(), 0.95);
        scores.insert("quality".to_string(), 0.95);
        scores.insert("cost".to_string(), 0.95);
        scores.insert("domain".to_string(), 0.95);
        let mut r = row("clean_pattern", 10, 10);
        r.judge_criterion_scores = Some(scores);
        r.judge_pass_rate = Some(0.95);

        assert!(judge_driven_improvements(&[r]).is_empty());
    }

    #[test]
    fn sort_orders_by_impact_then_confidence() {
        let mut improvements = vec![
            Improvement::new(ImprovementType::ParameterTune, "a".into(), 0.5, Impact::Low, "sql".into(), ExpectedDetails::default()),
            Improvement::new(ImprovementType::ParameterTune, "b".into(), 0.9, Impact::High, "sql".into(), ExpectedDetails::default()),
            Improvement::new(ImprovementType::ParameterTune, "c".into(), 0.6, Impact::High, "sql".into(), ExpectedDetails::default()),
        ];
        sort_by_impact_then_confidence(&mut improvements);
        assert_eq!(improvements[0].description, "b");
        assert_eq!(improvements[1].description, "c");
        assert_eq!(improvements[2].description, "a");
    }

    #[test]
    fn failure_clustering_requires_bucket_threshold() {
        let mut with_errors = vec![
            DeploymentMetric::new("a", "sql", "t1"),
            DeploymentMetric::new("a", "sql", "t2"),
            DeploymentMetric::new("a", "sql", "t3"),
        ];
        for f in &mut with_errors {
            f.error_message = Some("validation failed".into());
        }
        assert!(failure_clustering_improvements("sql", &with_errors).iter().any(|i| i.description.contains("validation")));
    }

    #[test]
    fn failure_clustering_below_threshold_is_silent() {
        let mut with_errors = vec![
            DeploymentMetric::new("a", "sql", "t1"),
            DeploymentMetric::new("a", "sql", "t2"),
        ];
        for f in &mut with_errors {
            f.error_message = Some("validation failed".into());
        }
        assert!(!failure_clustering_improvements("sql", &with_errors).iter().any(|i| i.description.contains("validation")));
    }
}
