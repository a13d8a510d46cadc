//! Execution event stream and replayable history
//!
//! Every significant runtime transition emits an [`EngineEvent`] carrying a
//! monotonic sequence number, a UTC timestamp, the execution id, the step
//! id where applicable, and a structured payload. The engine owns event
//! *production*; transport is pluggable through [`EventSink`] - install a
//! sink to forward events to logs, queues, or sockets. The built-in
//! [`TracingSink`] bridges events onto `tracing`.
//!
//! Independently of any sinks, every execution appends its events to a
//! [`History`] trace that supports replay and per-step inspection after
//! the fact.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Kinds of runtime transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    EnsembleStarted,
    StepStarted,
    StepCompleted,
    StepFailed,
    StepSkipped,
    /// Member-emitted progress payload (the `emit` capability of the
    /// member contract)
    StepProgress,
    Suspended,
    Resumed,
    EnsembleCompleted,
    EnsembleFailed,
}

/// One event in an execution's trace
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineEvent {
    /// Monotonic per-execution sequence number
    pub seq: u64,

    /// ISO-8601 UTC timestamp
    pub timestamp: DateTime<Utc>,

    pub kind: EventKind,

    /// Execution this event belongs to
    pub execution_id: String,

    /// Step attribution, when the transition concerns one step
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,

    /// Structured, kind-specific payload
    pub payload: Value,
}

/// Pluggable event transport
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &EngineEvent);
}

/// Bridges events onto the `tracing` subscriber
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &EngineEvent) {
        tracing::debug!(
            seq = event.seq,
            kind = ?event.kind,
            execution = %event.execution_id,
            step = event.step_id.as_deref().unwrap_or(""),
            "engine event"
        );
    }
}

/// Append-only, step-indexed trace of one execution
#[derive(Debug, Clone, Default)]
pub struct History {
    events: Arc<RwLock<Vec<EngineEvent>>>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    fn append(&self, event: EngineEvent) {
        self.events.write().push(event);
    }

    /// All events in sequence order
    pub fn replay(&self) -> Vec<EngineEvent> {
        self.events.read().clone()
    }

    /// The slice of the trace attributed to one step
    pub fn for_step(&self, step_id: &str) -> Vec<EngineEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.step_id.as_deref() == Some(step_id))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

/// Per-execution event producer: assigns sequence numbers, stamps
/// timestamps, appends to history, fans out to sinks.
#[derive(Clone)]
pub struct EventEmitter {
    execution_id: String,
    seq: Arc<AtomicU64>,
    history: History,
    sinks: Arc<Vec<Arc<dyn EventSink>>>,
}

impl EventEmitter {
    pub fn new(execution_id: impl Into<String>, sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self {
            execution_id: execution_id.into(),
            seq: Arc::new(AtomicU64::new(0)),
            history: History::new(),
            sinks: Arc::new(sinks),
        }
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    /// Emit an event. Sequence numbers are assigned atomically, so the
    /// trace is totally ordered even under concurrent steps.
    pub fn emit(&self, kind: EventKind, step_id: Option<&str>, payload: Value) -> u64 {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let event = EngineEvent {
            seq,
            timestamp: Utc::now(),
            kind,
            execution_id: self.execution_id.clone(),
            step_id: step_id.map(|s| s.to_string()),
            payload,
        };
        self.history.append(event.clone());
        for sink in self.sinks.iter() {
            sink.emit(&event);
        }
        seq
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("execution_id", &self.execution_id)
            .field("seq", &self.seq.load(Ordering::SeqCst))
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sequence_is_monotonic() {
        let emitter = EventEmitter::new("exec-1", vec![]);
        let a = emitter.emit(EventKind::EnsembleStarted, None, json!({}));
        let b = emitter.emit(EventKind::StepStarted, Some("fetch"), json!({}));
        let c = emitter.emit(EventKind::StepCompleted, Some("fetch"), json!({}));
        assert!(a < b && b < c);

        let replayed = emitter.history().replay();
        assert_eq!(replayed.len(), 3);
        assert_eq!(replayed[0].seq, 0);
        assert_eq!(replayed[2].kind, EventKind::StepCompleted);
    }

    #[test]
    fn test_step_filter() {
        let emitter = EventEmitter::new("exec-1", vec![]);
        emitter.emit(EventKind::StepStarted, Some("a"), json!({}));
        emitter.emit(EventKind::StepStarted, Some("b"), json!({}));
        emitter.emit(EventKind::StepCompleted, Some("a"), json!({"out": 1}));

        let trace = emitter.history().for_step("a");
        assert_eq!(trace.len(), 2);
        assert!(trace.iter().all(|e| e.step_id.as_deref() == Some("a")));
    }

    #[test]
    fn test_sink_fanout() {
        #[derive(Default)]
        struct Counting(std::sync::atomic::AtomicUsize);
        impl EventSink for Counting {
            fn emit(&self, _event: &EngineEvent) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let sink = Arc::new(Counting::default());
        let emitter = EventEmitter::new("exec-2", vec![sink.clone()]);
        emitter.emit(EventKind::EnsembleStarted, None, json!({}));
        emitter.emit(EventKind::EnsembleCompleted, None, json!({}));
        assert_eq!(sink.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_event_serializes_with_iso_timestamp() {
        let emitter = EventEmitter::new("exec-3", vec![]);
        emitter.emit(EventKind::Suspended, Some("gate"), json!({"token": "resume_x"}));
        let event = &emitter.history().replay()[0];
        let encoded = serde_json::to_value(event).unwrap();
        assert_eq!(encoded["kind"], json!("Suspended"));
        assert!(encoded["timestamp"].as_str().unwrap().contains('T'));
    }
}
