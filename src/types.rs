//! Core data model: usage events, in-memory aggregates, durable rows, and
//! the improvement lifecycle.
//!
//! Grounded on the donor backend's `models.rs` style: plain enums with an
//! `as_str()` accessor and `#[serde(rename_all = "snake_case")]`, structs
//! with a `new()` constructor and `with_*` builders for optional fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Per-criterion judge scores supplied by the (external) judge pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JudgeResult {
    pub passed: bool,
    pub dimension_scores: HashMap<String, f64>,
}

/// Ephemeral input to `RecordUsage`. Never stored raw — only aggregated.
#[derive(Debug, Clone)]
pub struct UsageEvent {
    pub pattern_name: String,
    pub variant: String,
    pub domain: String,
    pub agent_id: String,
    pub success: bool,
    pub cost: f64,
    pub latency_ms: u64,
    pub error_type: Option<String>,
    pub llm_provider: String,
    pub llm_model: String,
    pub judge_result: Option<JudgeResult>,
}

impl UsageEvent {
    /// `variant` defaults to `"default"` when empty, per the data model invariant.
    pub fn normalized_variant(&self) -> &str {
        if self.variant.is_empty() {
            "default"
        } else {
            &self.variant
        }
    }
}

/// Key identifying one in-memory aggregate bucket and one durable row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PatternKey {
    pub pattern_name: String,
    pub variant: String,
    pub agent_id: String,
    pub window_start: i64,
}

/// Judge aggregate accumulated within one window bucket.
#[derive(Debug, Clone, Default)]
pub struct JudgeAggregate {
    pub evaluations: u64,
    pub pass_count: u64,
    pub score_sum: f64,
    /// criterion -> (score_sum, count)
    pub criteria: HashMap<String, (f64, u64)>,
}

impl JudgeAggregate {
    pub fn record(&mut self, judge: &JudgeResult) {
        self.evaluations += 1;
        if judge.passed {
            self.pass_count += 1;
        }
        let total: f64 = judge.dimension_scores.values().sum();
        let avg = if judge.dimension_scores.is_empty() {
            0.0
        } else {
            total / judge.dimension_scores.len() as f64
        };
        self.score_sum += avg;
        for (criterion, score) in &judge.dimension_scores {
            let entry = self.criteria.entry(criterion.clone()).or_insert((0.0, 0));
            entry.0 += score;
            entry.1 += 1;
        }
    }

    /// Invariant: every criterion count must be <= evaluations.
    pub fn is_consistent(&self) -> bool {
        self.criteria.values().all(|(_, count)| *count <= self.evaluations)
    }
}

/// In-memory aggregate for one `PatternKey`. Owned exclusively by the
/// tracker's buffer; updates are commutative and associative so
/// concurrent writers landing in the same bucket never need to order.
#[derive(Debug, Clone, Default)]
pub struct PatternStats {
    pub total: u64,
    pub success: u64,
    pub failure: u64,
    pub cost_sum: f64,
    pub latency_sum_ms: u64,
    pub error_types: HashMap<String, u64>,
    pub judge: JudgeAggregate,
    pub llm_provider: String,
    pub llm_model: String,
}

impl PatternStats {
    pub fn record(&mut self, event: &UsageEvent) {
        self.total += 1;
        if event.success {
            self.success += 1;
        } else {
            self.failure += 1;
        }
        self.cost_sum += event.cost;
        self.latency_sum_ms += event.latency_ms;
        if let Some(error_type) = &event.error_type {
            *self.error_types.entry(error_type.clone()).or_insert(0) += 1;
        }
        if let Some(judge) = &event.judge_result {
            self.judge.record(judge);
        }
        self.llm_provider = event.llm_provider.clone();
        self.llm_model = event.llm_model.clone();
    }

    /// Invariant: success + failure == total.
    pub fn is_consistent(&self) -> bool {
        self.success + self.failure == self.total && self.judge.is_consistent()
    }
}

/// One durable row: `PatternStats` plus derived fields, ready to persist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternEffectivenessRow {
    pub pattern_name: String,
    pub variant: String,
    pub domain: String,
    pub agent_id: String,
    pub window_start: i64,
    pub window_end: i64,
    pub total_usages: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub success_rate: f64,
    pub avg_cost_usd: f64,
    pub avg_latency_ms: u64,
    pub error_types: HashMap<String, u64>,
    pub judge_pass_rate: Option<f64>,
    pub judge_avg_score: Option<f64>,
    pub judge_criterion_scores: Option<HashMap<String, f64>>,
    pub llm_provider: String,
    pub llm_model: String,
    pub created_at: i64,
}

impl PatternEffectivenessRow {
    pub fn from_bucket(key: &PatternKey, domain: &str, window_size_secs: i64, stats: &PatternStats, now: i64) -> Self {
        let total = stats.total.max(1) as f64;
        let judge_pass_rate = (stats.judge.evaluations > 0)
            .then(|| stats.judge.pass_count as f64 / stats.judge.evaluations as f64);
        let judge_avg_score = (stats.judge.evaluations > 0)
            .then(|| stats.judge.score_sum / stats.judge.evaluations as f64);
        let judge_criterion_scores = (stats.judge.evaluations > 0).then(|| {
            stats
                .judge
                .criteria
                .iter()
                .map(|(criterion, (sum, count))| (criterion.clone(), sum / (*count).max(1) as f64))
                .collect()
        });

        Self {
            pattern_name: key.pattern_name.clone(),
            variant: key.variant.clone(),
            domain: domain.to_string(),
            agent_id: key.agent_id.clone(),
            window_start: key.window_start,
            window_end: key.window_start + window_size_secs,
            total_usages: stats.total,
            success_count: stats.success,
            failure_count: stats.failure,
            success_rate: stats.success as f64 / total,
            avg_cost_usd: stats.cost_sum / total,
            avg_latency_ms: (stats.latency_sum_ms as f64 / total) as u64,
            error_types: stats.error_types.clone(),
            judge_pass_rate,
            judge_avg_score,
            judge_criterion_scores,
            llm_provider: stats.llm_provider.clone(),
            llm_model: stats.llm_model.clone(),
            created_at: now,
        }
    }
}

/// A recommendation derived from success rate and confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Promote,
    Keep,
    Demote,
    Remove,
    Investigate,
}

impl Recommendation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Promote => "promote",
            Self::Keep => "keep",
            Self::Demote => "demote",
            Self::Remove => "remove",
            Self::Investigate => "investigate",
        }
    }
}

/// Derived, transient result of querying pattern effectiveness over a window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternMetric {
    pub pattern_name: String,
    pub variant: String,
    pub domain: String,
    pub agent_id: String,
    pub window_start: i64,
    pub total_usages: u64,
    pub success_rate: f64,
    pub avg_cost_usd: f64,
    pub avg_latency_ms: u64,
    pub judge_pass_rate: Option<f64>,
    pub judge_avg_score: Option<f64>,
    pub judge_criterion_scores: Option<HashMap<String, f64>>,
    pub recommendation: Recommendation,
    pub confidence: f64,
}

/// Expected-impact estimate carried by an `Improvement`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExpectedDetails {
    pub success_rate_delta: f64,
    pub cost_delta_usd: f64,
    pub latency_delta_ms: f64,
    pub rationale: String,
}

/// Severity/impact of an improvement, also used as an autonomy cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Impact {
    Low,
    Medium,
    High,
    Critical,
}

impl Impact {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "LOW" => Some(Self::Low),
            "MEDIUM" => Some(Self::Medium),
            "HIGH" => Some(Self::High),
            "CRITICAL" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// Kind of mutation an improvement proposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImprovementType {
    PatternAdd,
    PatternRemove,
    ParameterTune,
    TemplateAdjust,
}

impl ImprovementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PatternAdd => "pattern_add",
            Self::PatternRemove => "pattern_remove",
            Self::ParameterTune => "parameter_tune",
            Self::TemplateAdjust => "template_adjust",
        }
    }
}

/// Lifecycle state of an `Improvement`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImprovementStatus {
    Pending,
    Applied,
    RolledBack,
    Rejected,
}

impl ImprovementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Applied => "applied",
            Self::RolledBack => "rolled_back",
            Self::Rejected => "rejected",
        }
    }
}

/// A proposed mutation to patterns or templates with a lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Improvement {
    pub id: Uuid,
    pub improvement_type: ImprovementType,
    pub description: String,
    pub confidence: f64,
    pub impact: Impact,
    pub target_agent_id: Option<String>,
    pub target_pattern: Option<String>,
    pub domain: String,
    pub status: ImprovementStatus,
    pub created_at: DateTime<Utc>,
    pub applied_at: Option<DateTime<Utc>>,
    pub applied_by: Option<String>,
    pub details: ExpectedDetails,
}

impl Improvement {
    pub fn new(
        improvement_type: ImprovementType,
        description: String,
        confidence: f64,
        impact: Impact,
        domain: String,
        details: ExpectedDetails,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            improvement_type,
            description,
            confidence,
            impact,
            target_agent_id: None,
            target_pattern: None,
            domain,
            status: ImprovementStatus::Pending,
            created_at: Utc::now(),
            applied_at: None,
            applied_by: None,
            details,
        }
    }

    pub fn with_target_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.target_pattern = Some(pattern.into());
        self
    }

    pub fn with_target_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.target_agent_id = Some(agent_id.into());
        self
    }

    /// Invariant: applied_at is set iff status in {Applied, RolledBack}.
    pub fn is_consistent(&self) -> bool {
        matches!(self.status, ImprovementStatus::Applied | ImprovementStatus::RolledBack)
            == self.applied_at.is_some()
    }
}

/// Deployment-outcome record logged by the Metrics Collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentMetric {
    pub id: Option<i64>,
    pub agent_id: String,
    pub domain: String,
    pub templates_considered: Vec<String>,
    pub selected_template: String,
    pub patterns_used: Vec<String>,
    pub success: bool,
    pub error_message: Option<String>,
    pub cost_usd: f64,
    pub turns_used: u32,
    pub created_at: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
    pub session_count: u32,
    pub user_rating: Option<f64>,
    pub feedback_comments: Option<String>,
}

impl DeploymentMetric {
    pub fn new(agent_id: impl Into<String>, domain: impl Into<String>, selected_template: impl Into<String>) -> Self {
        Self {
            id: None,
            agent_id: agent_id.into(),
            domain: domain.into(),
            templates_considered: Vec::new(),
            selected_template: selected_template.into(),
            patterns_used: Vec::new(),
            success: false,
            error_message: None,
            cost_usd: 0.0,
            turns_used: 0,
            created_at: Utc::now(),
            metadata: HashMap::new(),
            session_count: 0,
            user_rating: None,
            feedback_comments: None,
        }
    }
}

/// Explicit feedback update applied to one deployment row.
///
/// Replaces the reflection-based extraction the donor subsystem used to
/// carry (REDESIGN FLAG — see DESIGN.md); every field is named here.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Feedback {
    pub success: Option<bool>,
    pub error: Option<String>,
    pub turns: Option<u32>,
    pub session_count: Option<u32>,
    pub rating: Option<f64>,
    pub comments: Option<String>,
}

/// Before/after YAML blobs, keyed by improvement id, for rollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub improvement_id: Uuid,
    pub previous_config: String,
    pub new_config: String,
    pub created_at: DateTime<Utc>,
}
