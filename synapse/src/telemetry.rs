//! Structured telemetry for outbound calls.
//!
//! The core only depends on [`TelemetrySink`]'s two methods. Sinks:
//! - [`TracingSink`]: one structured `tracing` line per event
//! - [`MemorySink`]: in-process history, queried by tests and the CLI
//! - [`JsonlSink`]: append-only `.jsonl` log, one event per line
//! - [`FanoutSink`]: forwards every event to several sinks

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

/// Error details attached to an event recorded through `record_error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    /// Messages of the `source()` chain, outermost first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub causes: Vec<String>,
}

impl ErrorDetail {
    pub fn from_error(error: &(dyn std::error::Error + 'static)) -> Self {
        let mut causes = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }
        Self {
            message: error.to_string(),
            causes,
        }
    }
}

/// A structured, JSON-serializable telemetry event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub event_name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,
}

impl TelemetryEvent {
    pub fn new(event_name: impl Into<String>) -> Self {
        Self {
            event_name: event_name.into(),
            timestamp: Utc::now(),
            flow_name: None,
            step_name: None,
            duration_ms: None,
            model_name: None,
            error: None,
            attributes: Map::new(),
        }
    }

    pub fn flow(mut self, flow: impl Into<String>) -> Self {
        self.flow_name = Some(flow.into());
        self
    }

    pub fn step(mut self, step: impl Into<String>) -> Self {
        self.step_name = Some(step.into());
        self
    }

    pub fn duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model_name = Some(model.into());
        self
    }

    pub fn attr(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Attribute lookup, mostly for assertions.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{{\"event_name\":\"{}\"}}", self.event_name))
    }
}

/// Destination for telemetry. Implementations must not block for long:
/// they are called inline on the call path.
pub trait TelemetrySink: Send + Sync {
    fn record_event(&self, event: TelemetryEvent);

    /// Record a failure. Default: attach the error details and forward to
    /// `record_event`.
    fn record_error(&self, error: &(dyn std::error::Error + 'static), context: TelemetryEvent) {
        let mut event = context;
        event.error = Some(ErrorDetail::from_error(error));
        self.record_event(event);
    }
}

/// Shared sink handle.
pub type SharedSink = Arc<dyn TelemetrySink>;

/// Emits each event as one `tracing` line under the `synapse::telemetry` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn record_event(&self, event: TelemetryEvent) {
        if event.error.is_some() {
            warn!(target: "synapse::telemetry", event = %event.event_name, payload = %event.to_json(), "telemetry");
        } else {
            info!(target: "synapse::telemetry", event = %event.event_name, payload = %event.to_json(), "telemetry");
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Snapshot of all recorded events, oldest first.
    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Events that carry error details.
    pub fn errors(&self) -> Vec<TelemetryEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.error.is_some())
            .collect()
    }

    /// Events whose name matches exactly.
    pub fn named(&self, name: &str) -> Vec<TelemetryEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.event_name == name)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl TelemetrySink for MemorySink {
    fn record_event(&self, event: TelemetryEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

/// Append-only JSON-lines log.
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
    // Serializes appends from concurrent calls.
    write_lock: Mutex<()>,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, line: &str) -> std::io::Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")
    }
}

impl TelemetrySink for JsonlSink {
    fn record_event(&self, event: TelemetryEvent) {
        if let Err(e) = self.append(&event.to_json()) {
            warn!(path = %self.path.display(), error = %e, "Failed to append telemetry event");
        }
    }
}

/// Forwards every event to each inner sink, in order.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<SharedSink>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: SharedSink) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }
}

impl TelemetrySink for FanoutSink {
    fn record_event(&self, event: TelemetryEvent) {
        for sink in &self.sinks {
            sink.record_event(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("outer failure")]
    struct Outer(#[source] Inner);

    #[derive(Debug, thiserror::Error)]
    #[error("inner cause")]
    struct Inner;

    #[test]
    fn test_event_builder_and_json() {
        let event = TelemetryEvent::new("Api.Call.Success")
            .flow("route")
            .step("generate")
            .duration_ms(42)
            .model("gemini-1.5-flash")
            .attr("engine", "fast");

        let json: Value = serde_json::from_str(&event.to_json()).unwrap();
        assert_eq!(json["event_name"], "Api.Call.Success");
        assert_eq!(json["duration_ms"], 42);
        assert_eq!(json["model_name"], "gemini-1.5-flash");
        assert_eq!(json["attributes"]["engine"], "fast");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_record_error_captures_source_chain() {
        let sink = MemorySink::new();
        sink.record_error(&Outer(Inner), TelemetryEvent::new("Op.Failed"));

        let errors = sink.errors();
        assert_eq!(errors.len(), 1);
        let detail = errors[0].error.as_ref().unwrap();
        assert_eq!(detail.message, "outer failure");
        assert_eq!(detail.causes, vec!["inner cause".to_string()]);
    }

    #[test]
    fn test_memory_sink_filters() {
        let sink = MemorySink::new();
        sink.record_event(TelemetryEvent::new("a"));
        sink.record_event(TelemetryEvent::new("b"));
        sink.record_event(TelemetryEvent::new("a"));
        assert_eq!(sink.len(), 3);
        assert_eq!(sink.named("a").len(), 2);
        assert!(sink.errors().is_empty());
        sink.clear();
        assert!(sink.is_empty());
    }

    #[test]
    fn test_jsonl_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telemetry.jsonl");
        let sink = JsonlSink::new(&path);

        sink.record_event(TelemetryEvent::new("first"));
        sink.record_error(&Inner, TelemetryEvent::new("second"));

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: TelemetryEvent = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.event_name, "second");
        assert_eq!(second.error.unwrap().message, "inner cause");
    }

    #[test]
    fn test_fanout_reaches_every_sink() {
        let a = MemorySink::shared();
        let b = MemorySink::shared();
        let fanout = FanoutSink::new().with(a.clone()).with(b.clone());
        assert_eq!(fanout.sink_count(), 2);

        fanout.record_event(TelemetryEvent::new("x"));
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
    }
}
