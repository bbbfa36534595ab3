//! Learning Agent: the control surface combining the tracker, the engine,
//! policy enforcement, and the interrupt-driven control plane.

pub mod circuit_breaker;
pub mod interrupts;
pub mod tuning;

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::collaborators::{Bus, InterruptChannel, InterruptHandler, PatternReloader, Tracer};
use crate::config::{AutonomyLevel, LearningAgentConfig};
use crate::engine;
use crate::error::{LearningError, Result};
use crate::metrics_collector::MetricsCollector;
use crate::storage::Store;
use crate::tracker;
use crate::types::{Improvement, ImprovementStatus, PatternEffectivenessRow, PatternMetric};

use circuit_breaker::CircuitBreaker;
use interrupts::{
    AbTestOutcome, AbTestPayload, AnalyzePayload, ExportPayload, OptimizePayload, ProposalPayload, SyncPayload, ValidatePayload,
};

/// Last N recent failures considered by failure-clustering improvement mining.
const RECENT_FAILURES_WINDOW: u32 = 50;

/// Outcome of `ApplyImprovement`/`RollbackImprovement` when policy denies
/// the mutation — deliberately not a `Result` error (§7: policy deny is
/// not an error).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyResult {
    pub success: bool,
    pub message: String,
}

impl ApplyResult {
    fn ok(message: impl Into<String>) -> Self {
        Self { success: true, message: message.into() }
    }
    fn denied(message: impl Into<String>) -> Self {
        Self { success: false, message: message.into() }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct OptimizationGoal {
    pub cost: f64,
    pub quality: f64,
    pub latency: f64,
}

impl OptimizationGoal {
    pub fn equal_thirds() -> Self {
        Self { cost: 1.0 / 3.0, quality: 1.0 / 3.0, latency: 1.0 / 3.0 }
    }

    /// The weights `pattern_tuning_score` used before `optimization_goal`
    /// was threaded through `TunePatterns`; kept as the default so existing
    /// tuning behavior doesn't shift for callers that don't pass a goal.
    fn legacy_tuning_default() -> Self {
        Self { cost: 0.2, quality: 0.6, latency: 0.2 }
    }

    fn renormalized(&self) -> Self {
        let sum = self.cost + self.quality + self.latency;
        if sum <= 0.0 {
            return Self::equal_thirds();
        }
        Self { cost: self.cost / sum, quality: self.quality / sum, latency: self.latency / sum }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternMetricEvent {
    pub timestamp: i64,
    pub metric: PatternMetric,
    pub event_type: &'static str,
}

/// Filter a raw bus payload for `StreamPatternMetrics`; `None` means the
/// message doesn't match the subscriber's domain/agent filter.
pub fn filter_pattern_metric_event(
    payload: &serde_json::Value,
    domain: Option<&str>,
    agent: Option<&str>,
    now: i64,
) -> Option<PatternMetricEvent> {
    let row: PatternEffectivenessRow = serde_json::from_value(payload.clone()).ok()?;
    if let Some(domain) = domain {
        if row.domain != domain {
            return None;
        }
    }
    if let Some(agent) = agent {
        if row.agent_id != agent {
            return None;
        }
    }
    Some(PatternMetricEvent { timestamp: now, metric: engine::pattern_metric(&row), event_type: "METRIC_UPDATE" })
}

pub struct LearningAgent {
    pub agent_id: String,
    config: LearningAgentConfig,
    store: Arc<Store>,
    metrics: MetricsCollector,
    tracer: Arc<dyn Tracer>,
    bus: Arc<dyn Bus>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    interrupt_channel: RwLock<Option<Arc<dyn InterruptChannel>>>,
    pattern_reloader: RwLock<Option<Arc<dyn PatternReloader>>>,
    execution_count: AtomicU64,
}

impl LearningAgent {
    pub fn new(agent_id: impl Into<String>, config: LearningAgentConfig, store: Arc<Store>, tracer: Arc<dyn Tracer>, bus: Arc<dyn Bus>) -> Self {
        Self {
            agent_id: agent_id.into(),
            config,
            metrics: MetricsCollector::new(store.clone()),
            store,
            tracer,
            bus,
            breakers: RwLock::new(HashMap::new()),
            interrupt_channel: RwLock::new(None),
            pattern_reloader: RwLock::new(None),
            execution_count: AtomicU64::new(0),
        }
    }

    /// One-shot; a second call replaces the previous channel (not
    /// thread-safe with concurrent interrupt dispatch, per the spec).
    pub fn set_interrupt_channel(&self, channel: Arc<dyn InterruptChannel>) {
        *self.interrupt_channel.write() = Some(channel);
    }

    pub fn set_pattern_reloader(&self, reloader: Arc<dyn PatternReloader>) {
        *self.pattern_reloader.write() = Some(reloader);
    }

    fn breaker_for(&self, target_agent: Option<&str>) -> Arc<CircuitBreaker> {
        let key = target_agent.unwrap_or("default").to_string();
        if let Some(existing) = self.breakers.read().get(&key) {
            return existing.clone();
        }
        let mut breakers = self.breakers.write();
        breakers
            .entry(key)
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    self.config.spec.circuit_breaker.failure_threshold,
                    self.config.spec.circuit_breaker.cooldown(),
                    self.config.spec.circuit_breaker.success_threshold,
                ))
            })
            .clone()
    }

    /// Resolve a signal/call-supplied domain against the configured domain
    /// list when the caller didn't name one explicitly.
    fn resolve_domain(&self, domain: Option<&str>) -> Result<String> {
        domain
            .map(str::to_string)
            .or_else(|| self.config.spec.domains.first().cloned())
            .ok_or_else(|| LearningError::Validation("domain required: none supplied and none configured".into()))
    }

    pub fn analyze_pattern_effectiveness(
        &self,
        cancel: &CancellationToken,
        domain: &str,
        agent: Option<&str>,
        window_hours: u32,
        now: i64,
    ) -> Result<(Vec<PatternMetric>, engine::AnalysisSummary)> {
        if cancel.is_cancelled() {
            return Err(LearningError::Cancelled);
        }
        let since = now - window_hours as i64 * 3600;
        let rows = self.store.query_pattern_effectiveness(domain, agent, since)?;
        Ok(engine::analyze(&rows, window_hours))
    }

    /// Mines traditional, threshold, judge-driven, and failure-clustering
    /// proposals, sorts them per the engine's documented
    /// impact-then-confidence postcondition, scores/truncates against
    /// `optimization_goal`, and persists every final proposal so it can
    /// later be looked up by `ApplyImprovement`.
    pub fn generate_improvements(
        &self,
        cancel: &CancellationToken,
        domain: &str,
        agent: Option<&str>,
        max_proposals: usize,
        optimization_goal: Option<OptimizationGoal>,
        now: i64,
    ) -> Result<Vec<Improvement>> {
        if cancel.is_cancelled() {
            return Err(LearningError::Cancelled);
        }
        let since = now - 24 * 3600;
        let rows = self.store.query_pattern_effectiveness(domain, agent, since)?;

        let mut proposals = engine::traditional_improvements(&rows);
        proposals.extend(engine::judge_driven_improvements(&rows));
        proposals.extend(engine::threshold_improvements(&rows));

        let failures = self.metrics.recent_failures(domain, RECENT_FAILURES_WINDOW)?;
        proposals.extend(engine::failure_clustering_improvements(domain, &failures));

        engine::sort_by_impact_then_confidence(&mut proposals);

        if cancel.is_cancelled() {
            return Err(LearningError::Cancelled);
        }

        let goal = optimization_goal.unwrap_or_else(OptimizationGoal::equal_thirds).renormalized();
        score_and_truncate(&mut proposals, goal, max_proposals);

        for improvement in &proposals {
            self.store.insert_improvement(improvement)?;
        }
        Ok(proposals)
    }

    /// `autonomy=FULL`; target agent not protected; confidence past floor;
    /// impact at or below cap.
    pub fn should_auto_apply(&self, improvement: &Improvement) -> bool {
        if self.config.spec.autonomy_level != AutonomyLevel::Full {
            return false;
        }
        if let Some(target) = &improvement.target_agent_id {
            if self.config.spec.improvement_policy.protected_agents.iter().any(|p| p == target) {
                return false;
            }
        }
        if improvement.confidence < self.config.spec.improvement_policy.auto_apply_min_confidence {
            return false;
        }
        improvement.impact <= self.config.spec.improvement_policy.max_auto_apply_impact
    }

    pub async fn apply_improvement(&self, cancel: &CancellationToken, id: Uuid, force: bool) -> Result<ApplyResult> {
        if cancel.is_cancelled() {
            return Err(LearningError::Cancelled);
        }
        let improvement = match self.store.get_improvement(id) {
            Ok(improvement) => improvement,
            Err(e) => {
                if self.config.spec.circuit_breaker.enabled {
                    self.breaker_for(None).record_failure();
                }
                return Err(e);
            }
        };
        let breaker = self.breaker_for(improvement.target_agent_id.as_deref());

        if self.config.spec.autonomy_level == AutonomyLevel::Manual && !force {
            return Ok(ApplyResult::denied("Manual approval required"));
        }
        if self.config.spec.circuit_breaker.enabled && !breaker.can_proceed() {
            return Ok(ApplyResult::denied("circuit open, apply refused"));
        }

        let result = self.store.update_improvement_status(id, ImprovementStatus::Applied, Some(&self.agent_id));
        match result {
            Ok(()) => {
                if self.config.spec.circuit_breaker.enabled {
                    breaker.record_success();
                }
                self.tracer.record_metric("learning_agent.improvement_applied", 1.0);
                if let Some(pattern) = &improvement.target_pattern {
                    let reloader = self.pattern_reloader.read().clone();
                    if let Some(reloader) = reloader {
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            res = reloader.manual_reload(pattern) => {
                                if let Err(e) = res {
                                    warn!(error = %e, pattern, "hot-reload after apply failed, non-fatal");
                                }
                            }
                        }
                    }
                }
                Ok(ApplyResult::ok("applied"))
            }
            Err(e) => {
                if self.config.spec.circuit_breaker.enabled {
                    breaker.record_failure();
                }
                Err(e)
            }
        }
    }

    pub async fn rollback_improvement(&self, cancel: &CancellationToken, id: Uuid, reason: &str) -> Result<ApplyResult> {
        if cancel.is_cancelled() {
            return Err(LearningError::Cancelled);
        }
        let improvement = self.store.get_improvement(id)?;
        self.store.update_improvement_status(id, ImprovementStatus::RolledBack, Some(&self.agent_id))?;
        info!(improvement_id = %id, reason, "improvement rolled back");
        if let Some(pattern) = &improvement.target_pattern {
            let reloader = self.pattern_reloader.read().clone();
            if let Some(reloader) = reloader {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    res = reloader.manual_reload(pattern) => {
                        if let Err(e) = res {
                            warn!(error = %e, pattern, "hot-reload after rollback failed, non-fatal");
                        }
                    }
                }
            }
        }
        Ok(ApplyResult::ok("rolled back"))
    }

    pub fn get_improvement_history(
        &self,
        cancel: &CancellationToken,
        agent: Option<&str>,
        domain: Option<&str>,
        status: Option<ImprovementStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<(Vec<Improvement>, u64)> {
        if cancel.is_cancelled() {
            return Err(LearningError::Cancelled);
        }
        self.store.list_improvements(agent, domain, status, limit, offset)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn tune_patterns(
        &self,
        cancel: &CancellationToken,
        domain: &str,
        strategy: tuning::TuningStrategy,
        optimization_goal: Option<OptimizationGoal>,
        library_path: &Path,
        dimension_weights: Option<&HashMap<String, f64>>,
        target_dimensions: Option<&[String]>,
        dry_run: bool,
        now: i64,
    ) -> Result<Vec<TuneOutcome>> {
        if cancel.is_cancelled() {
            return Err(LearningError::Cancelled);
        }
        let since = now - 24 * 3600;
        let rows = self.store.query_pattern_effectiveness(domain, None, since)?;
        let mut outcomes = Vec::new();
        let empty_weights = HashMap::new();
        let weights = dimension_weights.unwrap_or(&empty_weights);

        for row in &rows {
            if cancel.is_cancelled() {
                return Err(LearningError::Cancelled);
            }
            let score = pattern_tuning_score(row, optimization_goal, weights, target_dimensions);
            let (delta, confidence) = tuning::priority_delta(score, strategy, row.total_usages);
            if delta == 0 {
                continue;
            }

            let file = match tuning::find_pattern_yaml_file(library_path, &row.pattern_name) {
                Ok(path) => path,
                Err(e) => {
                    warn!(error = %e, pattern = %row.pattern_name, "skipping tune: no library file");
                    continue;
                }
            };
            let current = tuning::get_current_priority(&file, &row.pattern_name).unwrap_or(50);
            let new_priority = tuning::clamp_priority(current, delta);
            if new_priority == current {
                continue;
            }

            if !dry_run {
                tuning::update_pattern_priority(&file, &row.pattern_name, new_priority)?;
                let reloader = self.pattern_reloader.read().clone();
                if let Some(reloader) = reloader {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        res = reloader.manual_reload(&row.pattern_name) => {
                            if let Err(e) = res {
                                self.tracer.record_metric("learning_agent.reload_failure", 1.0);
                                warn!(error = %e, pattern = %row.pattern_name, "tune reload failed, continuing batch");
                            }
                        }
                    }
                }
            }

            outcomes.push(TuneOutcome {
                pattern_name: row.pattern_name.clone(),
                previous_priority: current,
                new_priority,
                confidence,
                applied: !dry_run,
            });
        }
        Ok(outcomes)
    }

    /// Increments the self-trigger counter; at a configured multiple,
    /// sends `LEARNING_ANALYZE` to this agent's own interrupt channel.
    pub async fn record_execution(&self, cancel: &CancellationToken) {
        let count = self.execution_count.fetch_add(1, Ordering::SeqCst) + 1;
        let trigger = self.config.spec.execution_trigger;
        if trigger > 0 && count.is_multiple_of(trigger) {
            let channel = self.interrupt_channel.read().clone();
            if let Some(channel) = channel {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    res = channel.send("ANALYZE", serde_json::json!({ "agent": self.agent_id })) => { let _ = res; }
                }
            }
        }
    }

    /// Registers handlers for all seven interrupt signals on the attached
    /// channel, then spawns the periodic analysis-loop worker. Mirrors
    /// `PatternEffectivenessTracker::start`'s background-worker shape: one
    /// task, one `CancellationToken` the caller uses to stop it.
    pub async fn start(self: Arc<Self>) -> (CancellationToken, JoinHandle<()>) {
        self.register_interrupt_handlers().await;
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_analysis_loop(self.clone(), cancel.clone()));
        (cancel, handle)
    }

    async fn register_interrupt_handlers(self: &Arc<Self>) {
        let channel = self.interrupt_channel.read().clone();
        let Some(channel) = channel else { return };
        for &signal in interrupts::SIGNALS {
            let agent = self.clone();
            let signal_owned = signal.to_string();
            let handler: InterruptHandler = Arc::new(move |payload| {
                let agent = agent.clone();
                let signal = signal_owned.clone();
                Box::pin(async move {
                    let cancel = CancellationToken::new();
                    agent.dispatch_interrupt(&cancel, &signal, payload).await.map_err(|e| anyhow::anyhow!(e.to_string()))
                })
            });
            channel.register_handler(signal, handler).await;
        }
    }

    /// Dispatch one of the seven documented interrupt signals. Unknown
    /// signals are rejected by `interrupts::parse_payload` before this
    /// match is reached in the common case, but a direct unknown `signal`
    /// also falls through to the same typed error.
    pub async fn dispatch_interrupt(&self, cancel: &CancellationToken, signal: &str, payload: Value) -> Result<Value> {
        if cancel.is_cancelled() {
            return Err(LearningError::Cancelled);
        }
        let now = crate::now_unix();
        match signal {
            "ANALYZE" => {
                let payload: AnalyzePayload = interrupts::parse_payload(signal, payload)?;
                let domain = self.resolve_domain(payload.domain.as_deref())?;
                let (metrics, summary) =
                    self.analyze_pattern_effectiveness(cancel, &domain, payload.agent.as_deref(), payload.window_hours, now)?;
                Ok(serde_json::json!({ "metrics": metrics, "summary": summary }))
            }
            "OPTIMIZE" => {
                let payload: OptimizePayload = interrupts::parse_payload(signal, payload)?;
                let domain = self.resolve_domain(payload.domain.as_deref())?;
                let improvements = self.generate_improvements(cancel, &domain, None, payload.max_proposals as usize, None, now)?;
                let mut applied = 0u32;
                if payload.auto_apply {
                    for improvement in &improvements {
                        if self.should_auto_apply(improvement) && self.apply_improvement(cancel, improvement.id, false).await?.success {
                            applied += 1;
                        }
                    }
                }
                Ok(serde_json::json!({ "improvements": improvements, "applied": applied }))
            }
            "ABTEST" => {
                let payload: AbTestPayload = interrupts::parse_payload(signal, payload)?;
                let domain = self.resolve_domain(payload.domain.as_deref())?;
                let rows = self.store.query_pattern_effectiveness(&domain, None, 0)?;
                let (a, b) = ab_test_samples(&rows, &payload);
                let outcome = interrupts::compare_ab_test(&payload, a, b);
                Ok(ab_test_outcome_value(&outcome))
            }
            "PROPOSAL" => {
                let payload: ProposalPayload = interrupts::parse_payload(signal, payload)?;
                let domain = self.resolve_domain(payload.domain.as_deref())?;
                let improvements =
                    self.generate_improvements(cancel, &domain, payload.agent.as_deref(), payload.max_proposals as usize, None, now)?;
                Ok(serde_json::json!({ "improvements": improvements }))
            }
            "VALIDATE" => {
                let payload: ValidatePayload = interrupts::parse_payload(signal, payload)?;
                let improvement = self.store.get_improvement(payload.improvement_id)?;
                Ok(serde_json::to_value(&improvement).unwrap_or_default())
            }
            "EXPORT" => {
                let payload: ExportPayload = interrupts::parse_payload(signal, payload)?;
                let (improvements, total) = self.get_improvement_history(cancel, None, payload.domain.as_deref(), None, payload.limit, 0)?;
                Ok(serde_json::json!({ "improvements": improvements, "total": total }))
            }
            "SYNC" => {
                let payload: SyncPayload = interrupts::parse_payload(signal, payload)?;
                let domain = self.resolve_domain(payload.domain.as_deref())?;
                let rows = self.store.query_pattern_effectiveness(&domain, payload.agent.as_deref(), 0)?;
                let known: Vec<String> = rows.into_iter().map(|r| r.pattern_name).collect();
                let counts = interrupts::apply_sync(&payload, &known);
                Ok(serde_json::json!({ "pushed": counts.pushed, "pulled": counts.pulled, "skipped": counts.skipped }))
            }
            _ => Err(LearningError::Validation(format!("unknown interrupt signal '{signal}'"))),
        }
    }

    /// Subscribes to the pattern-effectiveness topic and forwards
    /// `filter_pattern_metric_event` matches on a fresh channel until the
    /// caller cancels or the bus closes the subscription.
    pub async fn stream_pattern_metrics(
        &self,
        cancel: &CancellationToken,
        domain: Option<&str>,
        agent: Option<&str>,
    ) -> Result<mpsc::Receiver<PatternMetricEvent>> {
        if cancel.is_cancelled() {
            return Err(LearningError::Cancelled);
        }
        let subscription = self
            .bus
            .subscribe(tracker::PATTERN_EFFECTIVENESS_TOPIC)
            .await
            .map_err(|e| LearningError::Validation(e.to_string()))?;

        let (tx, rx) = mpsc::channel(256);
        let domain = domain.map(str::to_string);
        let agent = agent.map(str::to_string);
        let cancel = cancel.clone();
        let mut receiver = subscription.receiver;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    maybe_payload = receiver.recv() => {
                        let Some(payload) = maybe_payload else { return };
                        let now = crate::now_unix();
                        if let Some(event) = filter_pattern_metric_event(&payload, domain.as_deref(), agent.as_deref(), now) {
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn bus(&self) -> &Arc<dyn Bus> {
        &self.bus
    }

    pub fn config(&self) -> &LearningAgentConfig {
        &self.config
    }
}

/// Free function (not a method) so `run_analysis_loop` can hold only an
/// `Arc<LearningAgent>`, matching `tracker::run_writer`'s shape.
async fn run_analysis_loop(agent: Arc<LearningAgent>, cancel: CancellationToken) {
    if !agent.config.spec.enabled {
        return;
    }
    let mut ticker = tokio::time::interval(Duration::from_secs(agent.config.spec.analysis_interval_secs.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => run_analysis_tick(&agent, &cancel).await,
        }
    }
}

async fn run_analysis_tick(agent: &Arc<LearningAgent>, cancel: &CancellationToken) {
    let domains = agent.config.spec.domains.clone();
    for domain in domains {
        if cancel.is_cancelled() {
            return;
        }
        let breaker = agent.breaker_for(None);
        if agent.config.spec.circuit_breaker.enabled && !breaker.can_proceed() {
            continue;
        }

        let now = crate::now_unix();
        if let Err(e) = agent.analyze_pattern_effectiveness(cancel, &domain, None, 24, now) {
            warn!(error = %e, domain, "analysis tick: analyze failed");
            continue;
        }

        let improvements = match agent.generate_improvements(cancel, &domain, None, 10, None, now) {
            Ok(improvements) => improvements,
            Err(e) => {
                warn!(error = %e, domain, "analysis tick: generate_improvements failed");
                continue;
            }
        };

        for improvement in improvements {
            if !agent.should_auto_apply(&improvement) {
                continue;
            }
            match agent.apply_improvement(cancel, improvement.id, false).await {
                Ok(result) if result.success => info!(improvement_id = %improvement.id, domain, "analysis tick auto-applied improvement"),
                Ok(result) => warn!(improvement_id = %improvement.id, domain, message = %result.message, "analysis tick auto-apply denied"),
                Err(e) => warn!(error = %e, improvement_id = %improvement.id, domain, "analysis tick auto-apply failed"),
            }
        }
    }
}

fn ab_test_samples(rows: &[PatternEffectivenessRow], payload: &AbTestPayload) -> ((u64, u64), (u64, u64)) {
    let mut a = (0u64, 0u64);
    let mut b = (0u64, 0u64);
    for row in rows.iter().filter(|r| r.pattern_name == payload.pattern_name) {
        if row.variant == payload.variant_a {
            a.0 += row.success_count;
            a.1 += row.total_usages;
        } else if row.variant == payload.variant_b {
            b.0 += row.success_count;
            b.1 += row.total_usages;
        }
    }
    (a, b)
}

fn ab_test_outcome_value(outcome: &AbTestOutcome) -> Value {
    match outcome {
        AbTestOutcome::Winner { variant, margin } => serde_json::json!({ "outcome": "winner", "variant": variant, "margin": margin }),
        AbTestOutcome::NoSignificantDifference => serde_json::json!({ "outcome": "no_significant_difference" }),
        AbTestOutcome::InsufficientSamples => serde_json::json!({ "outcome": "insufficient_samples" }),
    }
}

/// Mean of judge criterion scores: weighted by `dimension_weights` (default
/// weight 1.0 for an unlisted dimension), restricted to `target_dimensions`
/// when given, and renormalized over only the dimensions actually present —
/// a configured weight for a dimension absent from `scores` is logged and
/// otherwise has no effect.
fn weighted_dimension_mean(scores: &HashMap<String, f64>, dimension_weights: &HashMap<String, f64>, target_dimensions: Option<&[String]>) -> f64 {
    let relevant: Vec<(&String, &f64)> = scores
        .iter()
        .filter(|(dim, _)| target_dimensions.map(|dims| dims.iter().any(|d| d == *dim)).unwrap_or(true))
        .collect();
    if relevant.is_empty() {
        return 0.0;
    }

    for dim in dimension_weights.keys() {
        if !relevant.iter().any(|(d, _)| *d == dim) {
            warn!(dimension = %dim, "configured dimension weight has no matching scored criterion, ignored");
        }
    }

    let weight_sum: f64 = relevant.iter().map(|(dim, _)| dimension_weights.get(*dim).copied().unwrap_or(1.0)).sum();
    if weight_sum <= 0.0 {
        return relevant.iter().map(|(_, score)| **score).sum::<f64>() / relevant.len() as f64;
    }
    relevant.iter().map(|(dim, score)| dimension_weights.get(*dim).copied().unwrap_or(1.0) * **score).sum::<f64>() / weight_sum
}

/// Judge-driven patterns score by the (possibly dimension-weighted) mean of
/// their judge criteria; patterns without judge scores fall back to the
/// cost/quality/latency blend, weighted by `optimization_goal` (default:
/// the historical hardcoded 0.2/0.6/0.2 split).
fn pattern_tuning_score(
    row: &PatternEffectivenessRow,
    optimization_goal: Option<OptimizationGoal>,
    dimension_weights: &HashMap<String, f64>,
    target_dimensions: Option<&[String]>,
) -> f64 {
    if let Some(scores) = &row.judge_criterion_scores {
        if !scores.is_empty() {
            return weighted_dimension_mean(scores, dimension_weights, target_dimensions);
        }
    }
    let goal = optimization_goal.unwrap_or_else(OptimizationGoal::legacy_tuning_default).renormalized();
    let cost_component = (1.0 - (row.avg_cost_usd / 0.20).min(1.0)).max(0.0);
    let latency_component = (1.0 - (row.avg_latency_ms as f64 / 5000.0).min(1.0)).max(0.0);
    row.success_rate * goal.quality + cost_component * goal.cost + latency_component * goal.latency
}

#[derive(Debug, Clone)]
pub struct TuneOutcome {
    pub pattern_name: String,
    pub previous_priority: i32,
    pub new_priority: i32,
    pub confidence: tuning::TuningConfidence,
    pub applied: bool,
}

fn score_and_truncate(proposals: &mut Vec<Improvement>, goal: OptimizationGoal, max_proposals: usize) {
    let scored: Vec<(f64, Improvement)> = proposals
        .drain(..)
        .map(|improvement| {
            let quality = improvement.details.success_rate_delta.clamp(-1.0, 1.0);
            let cost = (-improvement.details.cost_delta_usd / 0.10).clamp(-1.0, 1.0);
            let latency = (-improvement.details.latency_delta_ms / 1000.0).clamp(-1.0, 1.0);
            let score = (cost * goal.cost + quality * goal.quality + latency * goal.latency) * improvement.confidence;
            (score, improvement)
        })
        .collect();

    let mut scored = scored;
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    proposals.extend(scored.into_iter().take(max_proposals).map(|(_, improvement)| improvement));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{InMemoryBus, InMemoryInterruptChannel, InMemoryPatternReloader, InMemoryTracer};
    use crate::config::{AutonomyLevel, CircuitBreakerConfig, ImprovementPolicy, LearningAgentSpec, Metadata, NotificationsConfig};
    use crate::types::{ExpectedDetails, Impact};

    fn test_config(autonomy: AutonomyLevel) -> LearningAgentConfig {
        LearningAgentConfig {
            api_version: "loom/v1".into(),
            kind: "LearningAgentConfig".into(),
            metadata: Metadata { name: "test".into() },
            spec: LearningAgentSpec {
                enabled: true,
                autonomy_level: autonomy,
                analysis_interval_secs: 3600,
                watch_eval_suites: Vec::new(),
                domains: vec!["sql".into()],
                circuit_breaker: CircuitBreakerConfig { failure_threshold: 2, cooldown_secs: 3600, ..Default::default() },
                improvement_policy: ImprovementPolicy::default(),
                notifications: NotificationsConfig::default(),
                execution_trigger: 0,
            },
        }
    }

    fn test_agent(autonomy: AutonomyLevel) -> LearningAgent {
        let store = Arc::new(Store::open(":memory:").unwrap());
        LearningAgent::new("agent-1", test_config(autonomy), store, Arc::new(InMemoryTracer::default()), Arc::new(InMemoryBus::default()))
    }

    fn upsert_row(agent: &LearningAgent, pattern: &str, usages: u64, now: i64) {
        let key = crate::types::PatternKey { pattern_name: pattern.into(), variant: "default".into(), agent_id: "agent-1".into(), window_start: now };
        let mut stats = crate::types::PatternStats::default();
        for _ in 0..usages {
            stats.record(&crate::types::UsageEvent {
                pattern_name: pattern.into(),
                variant: "default".into(),
                domain: "sql".into(),
                agent_id: "agent-1".into(),
                success: true,
                cost: 0.01,
                latency_ms: 50,
                error_type: None,
                llm_provider: "anthropic".into(),
                llm_model: "claude".into(),
                judge_result: None,
            });
        }
        let row = crate::types::PatternEffectivenessRow::from_bucket(&key, "sql", 3600, &stats, now);
        agent.store.upsert_pattern_effectiveness(&[row]).unwrap();
    }

    fn effectiveness_row(pattern: &str, success_rate: f64, avg_cost_usd: f64, avg_latency_ms: u64, judge_criterion_scores: Option<HashMap<String, f64>>) -> PatternEffectivenessRow {
        let total = 100u64;
        let success = (success_rate * total as f64) as u64;
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
            success_rate,
            avg_cost_usd,
            avg_latency_ms,
            error_types: HashMap::new(),
            judge_pass_rate: None,
            judge_avg_score: None,
            judge_criterion_scores,
            llm_provider: "anthropic".into(),
            llm_model: "claude".into(),
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn manual_autonomy_denies_apply_without_force() {
        let agent = test_agent(AutonomyLevel::Manual);
        let cancel = CancellationToken::new();
        let improvement = Improvement::new(
            crate::types::ImprovementType::ParameterTune,
            "test".into(),
            0.9,
            Impact::Low,
            "sql".into(),
            ExpectedDetails::default(),
        );
        agent.store.insert_improvement(&improvement).unwrap();

        let result = agent.apply_improvement(&cancel, improvement.id, false).await.unwrap();
        assert!(!result.success);
        assert!(result.message.to_lowercase().contains("manual"));

        let forced = agent.apply_improvement(&cancel, improvement.id, true).await.unwrap();
        assert!(forced.success);
        let reloaded = agent.store.get_improvement(improvement.id).unwrap();
        assert_eq!(reloaded.status, ImprovementStatus::Applied);
    }

    #[tokio::test]
    async fn circuit_breaker_opens_after_repeated_apply_failures() {
        let agent = test_agent(AutonomyLevel::Full);
        let cancel = CancellationToken::new();
        let bad_id = Uuid::new_v4();

        assert!(agent.apply_improvement(&cancel, bad_id, true).await.is_err());
        assert!(agent.apply_improvement(&cancel, bad_id, true).await.is_err());

        let improvement = Improvement::new(
            crate::types::ImprovementType::ParameterTune,
            "should be denied by open breaker".into(),
            0.9,
            Impact::Low,
            "sql".into(),
            ExpectedDetails::default(),
        );
        agent.store.insert_improvement(&improvement).unwrap();
        let result = agent.apply_improvement(&cancel, improvement.id, true).await.unwrap();
        assert!(!result.success);
        assert!(result.message.contains("circuit"));
    }

    #[tokio::test]
    async fn apply_improvement_observes_precancelled_token() {
        let agent = test_agent(AutonomyLevel::Full);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(agent.apply_improvement(&cancel, Uuid::new_v4(), true).await, Err(LearningError::Cancelled)));
    }

    #[test]
    fn should_auto_apply_respects_confidence_impact_and_protected_agents() {
        let mut config = test_config(AutonomyLevel::Full);
        config.spec.improvement_policy.auto_apply_min_confidence = 0.8;
        config.spec.improvement_policy.max_auto_apply_impact = Impact::Medium;
        config.spec.improvement_policy.protected_agents = vec!["protected".into()];
        let store = Arc::new(Store::open(":memory:").unwrap());
        let agent = LearningAgent::new("agent-1", config, store, Arc::new(InMemoryTracer::default()), Arc::new(InMemoryBus::default()));

        let good = Improvement::new(crate::types::ImprovementType::ParameterTune, "x".into(), 0.9, Impact::Low, "sql".into(), ExpectedDetails::default());
        assert!(agent.should_auto_apply(&good));

        let low_confidence = Improvement::new(crate::types::ImprovementType::ParameterTune, "x".into(), 0.5, Impact::Low, "sql".into(), ExpectedDetails::default());
        assert!(!agent.should_auto_apply(&low_confidence));

        let too_impactful = Improvement::new(crate::types::ImprovementType::ParameterTune, "x".into(), 0.95, Impact::Critical, "sql".into(), ExpectedDetails::default());
        assert!(!agent.should_auto_apply(&too_impactful));

        let protected = Improvement::new(crate::types::ImprovementType::ParameterTune, "x".into(), 0.95, Impact::Low, "sql".into(), ExpectedDetails::default())
            .with_target_agent("protected");
        assert!(!agent.should_auto_apply(&protected));
    }

    #[tokio::test]
    async fn generate_improvements_persists_every_proposal() {
        let agent = test_agent(AutonomyLevel::Full);
        upsert_row(&agent, "join_hint", 20, 600_000);
        let cancel = CancellationToken::new();

        let improvements = agent.generate_improvements(&cancel, "sql", None, 10, None, 600_000).unwrap();
        assert!(!improvements.is_empty());
        for improvement in &improvements {
            assert!(agent.store.get_improvement(improvement.id).is_ok());
        }
    }

    #[tokio::test]
    async fn tune_patterns_updates_priority_and_reloads() {
        let agent = test_agent(AutonomyLevel::Full);
        let reloader = Arc::new(InMemoryPatternReloader::default());
        agent.set_pattern_reloader(reloader.clone());
        let cancel = CancellationToken::new();

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("patterns.yaml");
        std::fs::write(&file, "entries:\n  - name: join_hint\n    priority: 50\n").unwrap();

        upsert_row(&agent, "join_hint", 300, 1_000_000);

        let outcomes = agent
            .tune_patterns(&cancel, "sql", tuning::TuningStrategy::Moderate, None, dir.path(), None, None, false, 1_000_000)
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].new_priority > outcomes[0].previous_priority);
        assert_eq!(reloader.reloads(), vec!["join_hint".to_string()]);
    }

    #[test]
    fn priority_delta_rewards_higher_score() {
        let quality_heavy_score = 0.90_f64;
        let cost_heavy_score = 0.60_f64;
        let (quality_delta, _) = tuning::priority_delta(quality_heavy_score, tuning::TuningStrategy::Moderate, 500);
        let (cost_delta, _) = tuning::priority_delta(cost_heavy_score, tuning::TuningStrategy::Moderate, 500);
        assert!(quality_delta > cost_delta);
    }

    #[test]
    fn tuning_score_weights_judge_criteria_by_configured_dimension_weights() {
        let mut scores = HashMap::new();
        scores.insert("quality".to_string(), 0.9);
        scores.insert("cost".to_string(), 0.3);
        let row = effectiveness_row("p", 0.8, 0.01, 100, Some(scores));

        let mut weights = HashMap::new();
        weights.insert("quality".to_string(), 3.0);
        weights.insert("cost".to_string(), 1.0);

        let weighted = pattern_tuning_score(&row, None, &weights, None);
        let unweighted = pattern_tuning_score(&row, None, &HashMap::new(), None);
        assert!(weighted > unweighted);
    }

    #[test]
    fn tuning_score_target_dimensions_restricts_consideration() {
        let mut scores = HashMap::new();
        scores.insert("quality".to_string(), 0.9);
        scores.insert("cost".to_string(), 0.1);
        let row = effectiveness_row("p", 0.8, 0.01, 100, Some(scores));

        let targets = vec!["quality".to_string()];
        let restricted = pattern_tuning_score(&row, None, &HashMap::new(), Some(&targets));
        assert!((restricted - 0.9).abs() < 1e-9);
    }

    #[test]
    fn tuning_score_legacy_branch_uses_optimization_goal_weights() {
        let row = effectiveness_row("p", 0.8, 0.01, 100, None);
        let quality_heavy = OptimizationGoal { cost: 0.0, quality: 1.0, latency: 0.0 };
        let cost_heavy = OptimizationGoal { cost: 1.0, quality: 0.0, latency: 0.0 };

        let quality_score = pattern_tuning_score(&row, Some(quality_heavy), &HashMap::new(), None);
        let cost_score = pattern_tuning_score(&row, Some(cost_heavy), &HashMap::new(), None);

        assert!((quality_score - row.success_rate).abs() < 1e-9);
        assert!((quality_score - cost_score).abs() > 1e-9);
    }

    #[tokio::test]
    async fn start_registers_handlers_and_analyze_dispatches() {
        let agent = Arc::new(test_agent(AutonomyLevel::Full));
        let channel = Arc::new(InMemoryInterruptChannel::default());
        agent.set_interrupt_channel(channel.clone());

        let (cancel, handle) = agent.clone().start().await;

        let result = channel.send("ANALYZE", serde_json::json!({ "domain": "sql" })).await.unwrap();
        assert!(result.get("summary").is_some());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn dispatch_optimize_auto_applies_when_policy_allows() {
        let mut config = test_config(AutonomyLevel::Full);
        config.spec.improvement_policy.auto_apply_min_confidence = 0.0;
        config.spec.improvement_policy.max_auto_apply_impact = Impact::Critical;
        let store = Arc::new(Store::open(":memory:").unwrap());
        let agent = LearningAgent::new("agent-1", config, store, Arc::new(InMemoryTracer::default()), Arc::new(InMemoryBus::default()));
        upsert_row(&agent, "join_hint", 20, crate::now_unix());

        let cancel = CancellationToken::new();
        let result = agent
            .dispatch_interrupt(&cancel, "OPTIMIZE", serde_json::json!({ "domain": "sql", "auto_apply": true }))
            .await
            .unwrap();
        assert!(result["applied"].as_u64().unwrap() >= 1);
    }

    #[tokio::test]
    async fn dispatch_sync_counts_against_known_patterns() {
        let agent = test_agent(AutonomyLevel::Full);
        upsert_row(&agent, "join_hint", 5, crate::now_unix());
        let cancel = CancellationToken::new();

        let payload = serde_json::json!({ "mode": "bidirectional", "domain": "sql", "patterns": ["join_hint", "new_pattern"] });
        let result = agent.dispatch_interrupt(&cancel, "SYNC", payload).await.unwrap();
        assert_eq!(result["pushed"], 1);
        assert_eq!(result["pulled"], 1);
    }

    #[tokio::test]
    async fn dispatch_unknown_signal_is_a_validation_error() {
        let agent = test_agent(AutonomyLevel::Full);
        let cancel = CancellationToken::new();
        assert!(matches!(agent.dispatch_interrupt(&cancel, "BOGUS", serde_json::json!({})).await, Err(LearningError::Validation(_))));
    }

    #[tokio::test]
    async fn stream_pattern_metrics_filters_by_domain_and_stops_on_cancel() {
        let bus = Arc::new(InMemoryBus::default());
        let agent = LearningAgent::new(
            "agent-1",
            test_config(AutonomyLevel::Full),
            Arc::new(Store::open(":memory:").unwrap()),
            Arc::new(InMemoryTracer::default()),
            bus.clone(),
        );
        let cancel = CancellationToken::new();
        let mut rx = agent.stream_pattern_metrics(&cancel, Some("sql"), None).await.unwrap();

        let row = effectiveness_row("join_hint", 1.0, 0.01, 10, None);
        bus.publish(tracker::PATTERN_EFFECTIVENESS_TOPIC, serde_json::to_value(&row).unwrap()).await.unwrap();
        let mut other_domain_row = row.clone();
        other_domain_row.domain = "other".into();
        bus.publish(tracker::PATTERN_EFFECTIVENESS_TOPIC, serde_json::to_value(&other_domain_row).unwrap()).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.metric.pattern_name, "join_hint");

        cancel.cancel();
        assert!(rx.recv().await.is_none());
    }
}
