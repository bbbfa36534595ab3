//! Narrow traits for the systems this crate talks to but does not own:
//! tracing/metrics, the message bus, the interrupt control plane, and the
//! pattern-library file watcher.
//!
//! Grounded on the `LearningPersistence` trait + `InMemoryLearningPersistence`
//! pattern: a small async trait per external dependency, with an in-memory
//! double alongside it for tests.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

/// Emits spans and point metrics. Implemented over the host platform's
/// tracer in production; the in-memory double just records calls.
#[async_trait]
pub trait Tracer: Send + Sync {
    fn start_span(&self, name: &str) -> u64;
    fn end_span(&self, span_id: u64);
    fn record_metric(&self, name: &str, value: f64);
}

pub struct InMemoryTracer {
    next_id: Mutex<u64>,
    open_spans: Mutex<Vec<u64>>,
    closed_spans: Mutex<Vec<u64>>,
    metrics: Mutex<Vec<(String, f64)>>,
}

impl Default for InMemoryTracer {
    fn default() -> Self {
        Self {
            next_id: Mutex::new(1),
            open_spans: Mutex::new(Vec::new()),
            closed_spans: Mutex::new(Vec::new()),
            metrics: Mutex::new(Vec::new()),
        }
    }
}

impl Tracer for InMemoryTracer {
    fn start_span(&self, _name: &str) -> u64 {
        let mut next_id = self.next_id.lock();
        let id = *next_id;
        *next_id += 1;
        self.open_spans.lock().push(id);
        id
    }

    fn end_span(&self, span_id: u64) {
        self.open_spans.lock().retain(|id| *id != span_id);
        self.closed_spans.lock().push(span_id);
    }

    fn record_metric(&self, name: &str, value: f64) {
        self.metrics.lock().push((name.to_string(), value));
    }
}

impl InMemoryTracer {
    pub fn metrics(&self) -> Vec<(String, f64)> {
        self.metrics.lock().clone()
    }

    pub fn open_span_count(&self) -> usize {
        self.open_spans.lock().len()
    }
}

/// A live subscription: an id for `unsubscribe`, and the receiving half of
/// the channel messages published on the subscribed topic arrive on.
pub struct Subscription {
    pub id: u64,
    pub receiver: mpsc::Receiver<Value>,
}

/// Publish/subscribe to the orchestration platform's message bus.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, topic: &str, payload: Value) -> anyhow::Result<()>;
    async fn subscribe(&self, topic: &str) -> anyhow::Result<Subscription>;
    async fn unsubscribe(&self, subscription_id: u64) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct InMemoryBus {
    next_subscription_id: Mutex<u64>,
    subscriptions: Mutex<HashMap<u64, (String, mpsc::Sender<Value>)>>,
    published: Mutex<Vec<(String, Value)>>,
}

#[async_trait]
impl Bus for InMemoryBus {
    async fn publish(&self, topic: &str, payload: Value) -> anyhow::Result<()> {
        self.published.lock().push((topic.to_string(), payload.clone()));
        let senders: Vec<mpsc::Sender<Value>> = self
            .subscriptions
            .lock()
            .values()
            .filter(|(t, _)| t == topic)
            .map(|(_, tx)| tx.clone())
            .collect();
        for tx in senders {
            let _ = tx.send(payload.clone()).await;
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> anyhow::Result<Subscription> {
        let mut next_id = self.next_subscription_id.lock();
        let id = *next_id;
        *next_id += 1;
        drop(next_id);
        let (tx, rx) = mpsc::channel(256);
        self.subscriptions.lock().insert(id, (topic.to_string(), tx));
        Ok(Subscription { id, receiver: rx })
    }

    async fn unsubscribe(&self, subscription_id: u64) -> anyhow::Result<()> {
        self.subscriptions.lock().remove(&subscription_id);
        Ok(())
    }
}

impl InMemoryBus {
    pub fn published(&self) -> Vec<(String, Value)> {
        self.published.lock().clone()
    }

    pub fn published_on(&self, topic: &str) -> Vec<Value> {
        self.published
            .lock()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

/// A registered interrupt handler: takes the raw payload, returns a
/// structured response (e.g. an analysis summary, sync counts).
pub type InterruptHandler = Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>> + Send + Sync>;

/// Registers handlers for orchestration-platform interrupt signals and
/// dispatches externally-triggered sends (also used by tests to simulate a
/// signal arriving over the wire).
#[async_trait]
pub trait InterruptChannel: Send + Sync {
    async fn register_handler(&self, signal: &str, handler: InterruptHandler);
    async fn send(&self, signal: &str, payload: Value) -> anyhow::Result<Value>;
}

#[derive(Default)]
pub struct InMemoryInterruptChannel {
    handlers: Mutex<HashMap<String, InterruptHandler>>,
}

impl InMemoryInterruptChannel {
    /// Convenience for tests: register a synchronous closure as a handler.
    pub fn on(&self, signal: &str, handler: impl Fn(Value) -> Value + Send + Sync + 'static) {
        let handler: InterruptHandler = Arc::new(move |payload| {
            let result = handler(payload);
            Box::pin(async move { Ok(result) })
        });
        self.handlers.lock().insert(signal.to_string(), handler);
    }
}

#[async_trait]
impl InterruptChannel for InMemoryInterruptChannel {
    async fn register_handler(&self, signal: &str, handler: InterruptHandler) {
        self.handlers.lock().insert(signal.to_string(), handler);
    }

    async fn send(&self, signal: &str, payload: Value) -> anyhow::Result<Value> {
        let handler = self.handlers.lock().get(signal).cloned();
        match handler {
            Some(handler) => handler(payload).await,
            None => Err(anyhow::anyhow!("no handler registered for signal {signal}")),
        }
    }
}

/// Forces the orchestration platform's pattern-library cache to reload
/// after a targeted YAML edit.
#[async_trait]
pub trait PatternReloader: Send + Sync {
    async fn manual_reload(&self, domain: &str) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct InMemoryPatternReloader {
    reloads: Mutex<Vec<String>>,
}

#[async_trait]
impl PatternReloader for InMemoryPatternReloader {
    async fn manual_reload(&self, domain: &str) -> anyhow::Result<()> {
        self.reloads.lock().push(domain.to_string());
        Ok(())
    }
}

impl InMemoryPatternReloader {
    pub fn reloads(&self) -> Vec<String> {
        self.reloads.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bus_records_published_payloads() {
        let bus = InMemoryBus::default();
        bus.publish("meta.pattern.effectiveness", serde_json::json!({"ok": true}))
            .await
            .unwrap();
        assert_eq!(bus.published_on("meta.pattern.effectiveness").len(), 1);
    }

    #[tokio::test]
    async fn interrupt_channel_dispatches_to_registered_handler() {
        let channel = InMemoryInterruptChannel::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        channel.on("ANALYZE", move |payload| {
            seen_clone.lock().push(payload.clone());
            payload
        });

        channel.send("ANALYZE", serde_json::json!({"domain": "sql"})).await.unwrap();
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn interrupt_channel_errors_on_unknown_signal() {
        let channel = InMemoryInterruptChannel::default();
        let result = channel.send("UNKNOWN", serde_json::json!({})).await;
        assert!(result.is_err());
    }
}
