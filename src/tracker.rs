//! Pattern Effectiveness Tracker: buffers usage events in memory and
//! periodically flushes aggregated windows to durable storage.
//!
//! The background-worker shape (message enum, `mpsc` channel, `tokio::select!`
//! between incoming messages and a periodic tick, explicit shutdown with a
//! final flush) follows `backtest_v2::trade_recorder::AsyncTradeRecorder`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::buffer::Buffer;
use crate::collaborators::Bus;
use crate::error::{LearningError, Result};
use crate::storage::Store;
use crate::types::{PatternEffectivenessRow, UsageEvent};

pub const PATTERN_EFFECTIVENESS_TOPIC: &str = "meta.pattern.effectiveness";

enum Message {
    Record(Box<UsageEvent>, i64),
    Flush(tokio::sync::oneshot::Sender<Result<usize>>),
    Shutdown,
}

/// Handle to the running tracker. Cloning shares the same background task.
#[derive(Clone)]
pub struct PatternEffectivenessTracker {
    tx: mpsc::Sender<Message>,
    handle: Arc<tokio::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl PatternEffectivenessTracker {
    /// Start the background worker. Flushes every `flush_interval`, or
    /// immediately on explicit `flush()`/`stop()`.
    pub fn start(domain: String, store: Arc<Store>, bus: Arc<dyn Bus>, flush_interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel(1024);
        let buffer = Arc::new(Buffer::new());
        let handle = tokio::spawn(run_writer(domain, store, bus, buffer, rx, flush_interval));
        Self {
            tx,
            handle: Arc::new(tokio::sync::Mutex::new(Some(handle))),
        }
    }

    pub async fn record_usage(&self, cancel: &CancellationToken, event: UsageEvent, now: i64) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(LearningError::Cancelled);
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(LearningError::Cancelled),
            res = self.tx.send(Message::Record(Box::new(event), now)) => res.map_err(|_| LearningError::Cancelled),
        }
    }

    /// Force an immediate flush; returns the number of rows written.
    pub async fn flush(&self, cancel: &CancellationToken) -> Result<usize> {
        if cancel.is_cancelled() {
            return Err(LearningError::Cancelled);
        }
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        tokio::select! {
            _ = cancel.cancelled() => return Err(LearningError::Cancelled),
            res = self.tx.send(Message::Flush(reply_tx)) => res.map_err(|_| LearningError::Cancelled)?,
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(LearningError::Cancelled),
            res = reply_rx => res.map_err(|_| LearningError::Cancelled)?,
        }
    }

    /// Flush once more, then stop the background task. Idempotent: a
    /// second `stop()` is a no-op. Per §5, cancelling `stop` does not
    /// abandon the in-flight final flush — shutdown is best-effort-complete
    /// regardless of the token's state.
    pub async fn stop(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(LearningError::Cancelled);
        }
        let _ = self.tx.send(Message::Shutdown).await;
        let mut handle = self.handle.lock().await;
        if let Some(handle) = handle.take() {
            let _ = handle.await;
        }
        Ok(())
    }
}

async fn run_writer(
    domain: String,
    store: Arc<Store>,
    bus: Arc<dyn Bus>,
    buffer: Arc<Buffer>,
    mut rx: mpsc::Receiver<Message>,
    flush_interval: Duration,
) {
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Some(Message::Record(event, now)) => buffer.record(&event, now),
                    Some(Message::Flush(reply)) => {
                        let result = do_flush(&domain, &store, &bus, &buffer).await;
                        let _ = reply.send(result);
                    }
                    Some(Message::Shutdown) | None => {
                        if let Err(e) = do_flush(&domain, &store, &bus, &buffer).await {
                            error!(error = %e, "final flush on shutdown failed");
                        }
                        return;
                    }
                }
            }
            _ = ticker.tick() => {
                if let Err(e) = do_flush(&domain, &store, &bus, &buffer).await {
                    warn!(error = %e, "periodic flush failed, buffer retained for next attempt");
                }
            }
        }
    }
}

/// Snapshot the buffer, persist it, and publish the batch. On storage
/// failure the drained snapshot is dropped rather than restored — a
/// flush interval's events are lost rather than retried and
/// double-published (see DESIGN.md, pattern-effectiveness flush semantics).
async fn do_flush(domain: &str, store: &Store, bus: &Arc<dyn Bus>, buffer: &Buffer) -> Result<usize> {
    let drained = buffer.drain();
    if drained.is_empty() {
        return Ok(0);
    }
    let now = crate::now_unix();
    let rows: Vec<PatternEffectivenessRow> = drained
        .iter()
        .map(|(key, stats)| PatternEffectivenessRow::from_bucket(key, domain, crate::buffer::WINDOW_SIZE_SECS, stats, now))
        .collect();

    store.upsert_pattern_effectiveness(&rows)?;
    info!(rows = rows.len(), domain, "flushed pattern effectiveness window");

    for row in &rows {
        let payload = serde_json::to_value(row).unwrap_or_default();
        if let Err(e) = bus.publish(PATTERN_EFFECTIVENESS_TOPIC, payload).await {
            warn!(error = %e, pattern = %row.pattern_name, "publish failed, row already durable");
        }
    }
    Ok(rows.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::InMemoryBus;
    use crate::types::UsageEvent;

    fn event(pattern: &str) -> UsageEvent {
        UsageEvent {
            pattern_name: pattern.into(),
            variant: String::new(),
            domain: "sql".into(),
            agent_id: "agent-1".into(),
            success: true,
            cost: 0.01,
            latency_ms: 40,
            error_type: None,
            llm_provider: "anthropic".into(),
            llm_model: "claude".into(),
            judge_result: None,
        }
    }

    #[tokio::test]
    async fn record_then_flush_persists_and_publishes() {
        let store = Arc::new(Store::open(":memory:").unwrap());
        let bus = Arc::new(InMemoryBus::default());
        let tracker = PatternEffectivenessTracker::start("sql".into(), store.clone(), bus.clone(), Duration::from_secs(3600));
        let cancel = CancellationToken::new();

        tracker.record_usage(&cancel, event("join_hint"), 1_000).await.unwrap();
        tracker.record_usage(&cancel, event("join_hint"), 1_000).await.unwrap();
        let flushed = tracker.flush(&cancel).await.unwrap();
        assert_eq!(flushed, 1);

        let rows = store.query_pattern_effectiveness("sql", None, 0).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total_usages, 2);
        assert_eq!(bus.published_on(PATTERN_EFFECTIVENESS_TOPIC).len(), 1);

        tracker.stop(&cancel).await.unwrap();
    }

    #[tokio::test]
    async fn empty_buffer_flush_is_a_noop() {
        let store = Arc::new(Store::open(":memory:").unwrap());
        let bus = Arc::new(InMemoryBus::default());
        let tracker = PatternEffectivenessTracker::start("sql".into(), store, bus, Duration::from_secs(3600));
        let cancel = CancellationToken::new();
        assert_eq!(tracker.flush(&cancel).await.unwrap(), 0);
        tracker.stop(&cancel).await.unwrap();
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let store = Arc::new(Store::open(":memory:").unwrap());
        let bus = Arc::new(InMemoryBus::default());
        let tracker = PatternEffectivenessTracker::start("sql".into(), store, bus, Duration::from_secs(3600));
        let cancel = CancellationToken::new();
        tracker.stop(&cancel).await.unwrap();
        tracker.stop(&cancel).await.unwrap();
    }

    #[tokio::test]
    async fn record_usage_observes_cancellation() {
        let store = Arc::new(Store::open(":memory:").unwrap());
        let bus = Arc::new(InMemoryBus::default());
        let tracker = PatternEffectivenessTracker::start("sql".into(), store, bus, Duration::from_secs(3600));
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(tracker.record_usage(&cancel, event("join_hint"), 1_000).await, Err(LearningError::Cancelled)));
    }
}
