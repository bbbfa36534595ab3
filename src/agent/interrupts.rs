//! Interrupt-driven control plane: parses JSON payloads for the seven
//! documented signals and carries out the simplified logic that doesn't
//! belong in the engine (A/B comparison, sync bookkeeping).

use serde::Deserialize;
use uuid::Uuid;

use crate::error::{LearningError, Result};

pub const SIGNALS: &[&str] = &["ANALYZE", "OPTIMIZE", "ABTEST", "PROPOSAL", "VALIDATE", "EXPORT", "SYNC"];

pub fn is_known_signal(signal: &str) -> bool {
    SIGNALS.contains(&signal)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalyzePayload {
    pub domain: Option<String>,
    pub agent: Option<String>,
    pub window_hours: u32,
}

impl Default for AnalyzePayload {
    fn default() -> Self {
        Self { domain: None, agent: None, window_hours: 24 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OptimizePayload {
    pub domain: Option<String>,
    pub max_proposals: u32,
    pub auto_apply: bool,
}

impl Default for OptimizePayload {
    fn default() -> Self {
        Self { domain: None, max_proposals: 10, auto_apply: false }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AbTestPayload {
    pub pattern_name: String,
    pub variant_a: String,
    pub variant_b: String,
    #[serde(default = "default_min_sample_size")]
    pub min_sample_size: u64,
    #[serde(default)]
    pub domain: Option<String>,
}

fn default_min_sample_size() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncPayload {
    pub mode: SyncMode,
    pub domain: Option<String>,
    pub agent: Option<String>,
    pub patterns: Vec<String>,
}

impl Default for SyncPayload {
    fn default() -> Self {
        Self { mode: SyncMode::Bidirectional, domain: None, agent: None, patterns: Vec::new() }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Push,
    Pull,
    Bidirectional,
}

pub fn parse_payload<T: for<'de> Deserialize<'de>>(signal: &str, payload: serde_json::Value) -> Result<T> {
    if !is_known_signal(signal) {
        return Err(LearningError::Validation(format!("unknown interrupt signal '{signal}'")));
    }
    serde_json::from_value(payload).map_err(|e| LearningError::Validation(format!("bad payload for {signal}: {e}")))
}

#[derive(Debug, Clone, PartialEq)]
pub enum AbTestOutcome {
    Winner { variant: String, margin: f64 },
    NoSignificantDifference,
    InsufficientSamples,
}

/// Two-group comparison per variant `(success, total)`.
pub fn compare_ab_test(payload: &AbTestPayload, a: (u64, u64), b: (u64, u64)) -> AbTestOutcome {
    if a.1 < payload.min_sample_size || b.1 < payload.min_sample_size {
        return AbTestOutcome::InsufficientSamples;
    }
    let rate_a = a.0 as f64 / a.1 as f64;
    let rate_b = b.0 as f64 / b.1 as f64;
    let margin = (rate_a - rate_b).abs();
    if margin > 0.05 {
        let variant = if rate_a > rate_b { payload.variant_a.clone() } else { payload.variant_b.clone() };
        AbTestOutcome::Winner { variant, margin }
    } else {
        AbTestOutcome::NoSignificantDifference
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProposalPayload {
    pub domain: Option<String>,
    pub agent: Option<String>,
    pub max_proposals: u32,
}

impl Default for ProposalPayload {
    fn default() -> Self {
        Self { domain: None, agent: None, max_proposals: 10 }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidatePayload {
    pub improvement_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExportPayload {
    pub domain: Option<String>,
    pub limit: u32,
}

impl Default for ExportPayload {
    fn default() -> Self {
        Self { domain: None, limit: 50 }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncCounts {
    pub pushed: u64,
    pub pulled: u64,
    pub skipped: u64,
}

/// Classify each requested pattern against the set known locally:
/// `PUSH` counts a match as pushed, a miss as skipped; `PULL` counts a
/// miss as pulled (nothing local to skip over), a match as skipped;
/// `BIDIRECTIONAL` pushes matches and pulls misses.
pub fn apply_sync(payload: &SyncPayload, known_patterns: &[String]) -> SyncCounts {
    let mut counts = SyncCounts::default();
    for pattern in &payload.patterns {
        let known = known_patterns.iter().any(|p| p == pattern);
        match (payload.mode, known) {
            (SyncMode::Push, true) => counts.pushed += 1,
            (SyncMode::Push, false) => counts.skipped += 1,
            (SyncMode::Pull, false) => counts.pulled += 1,
            (SyncMode::Pull, true) => counts.skipped += 1,
            (SyncMode::Bidirectional, true) => counts.pushed += 1,
            (SyncMode::Bidirectional, false) => counts.pulled += 1,
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_signal() {
        let err = parse_payload::<AnalyzePayload>("BOGUS", serde_json::json!({})).unwrap_err();
        assert!(matches!(err, LearningError::Validation(_)));
    }

    #[test]
    fn analyze_payload_defaults_window_hours() {
        let payload: AnalyzePayload = parse_payload("ANALYZE", serde_json::json!({"domain": "sql"})).unwrap();
        assert_eq!(payload.window_hours, 24);
        assert_eq!(payload.domain.as_deref(), Some("sql"));
    }

    #[test]
    fn ab_test_declares_winner_past_margin() {
        let payload = AbTestPayload {
            pattern_name: "p".into(),
            variant_a: "a".into(),
            variant_b: "b".into(),
            min_sample_size: 30,
            domain: None,
        };
        let outcome = compare_ab_test(&payload, (27, 30), (15, 30));
        assert_eq!(outcome, AbTestOutcome::Winner { variant: "a".into(), margin: 0.4 });
    }

    #[test]
    fn ab_test_reports_insufficient_samples() {
        let payload = AbTestPayload {
            pattern_name: "p".into(),
            variant_a: "a".into(),
            variant_b: "b".into(),
            min_sample_size: 30,
            domain: None,
        };
        let outcome = compare_ab_test(&payload, (10, 15), (20, 30));
        assert_eq!(outcome, AbTestOutcome::InsufficientSamples);
    }

    #[test]
    fn sync_counts_push_pull_and_skip() {
        let known = vec!["join_hint".to_string()];

        let push = SyncPayload { mode: SyncMode::Push, domain: None, agent: None, patterns: vec!["join_hint".into(), "unknown".into()] };
        let counts = apply_sync(&push, &known);
        assert_eq!((counts.pushed, counts.pulled, counts.skipped), (1, 0, 1));

        let pull = SyncPayload { mode: SyncMode::Pull, domain: None, agent: None, patterns: vec!["join_hint".into(), "new_pattern".into()] };
        let counts = apply_sync(&pull, &known);
        assert_eq!((counts.pushed, counts.pulled, counts.skipped), (0, 1, 1));

        let both = SyncPayload { mode: SyncMode::Bidirectional, domain: None, agent: None, patterns: vec!["join_hint".into(), "new_pattern".into()] };
        let counts = apply_sync(&both, &known);
        assert_eq!((counts.pushed, counts.pulled, counts.skipped), (1, 1, 0));
    }

    #[test]
    fn ab_test_reports_no_significant_difference_within_margin() {
        let payload = AbTestPayload {
            pattern_name: "p".into(),
            variant_a: "a".into(),
            variant_b: "b".into(),
            min_sample_size: 30,
            domain: None,
        };
        let outcome = compare_ab_test(&payload, (16, 30), (15, 30));
        assert_eq!(outcome, AbTestOutcome::NoSignificantDifference);
    }
}
