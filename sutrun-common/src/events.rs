//! Event broadcast for run progress.
//!
//! Schedulers emit lifecycle events here; consumers subscribe and receive
//! JSON lines. Emission never blocks and never reports failure back to the
//! emitter.

use crate::types::{SuiteResult, Test, TestResult};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::warn;

const DEFAULT_BUFFER: usize = 256;

/// Lifecycle events emitted during a run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "event", content = "data")]
pub enum Event {
    TestStarted { test: Test },
    TestStdout { test: String, data: String },
    KernelTainted { reasons: Vec<String> },
    KernelPanic,
    SutNotResponding,
    TestCompleted { result: TestResult },
    SuiteStarted { suite: String, tests: usize },
    SutRestart { sut: String },
    SutStdout { sut: String, data: String },
    SuiteTimeout { suite: String, timeout_secs: f64 },
    SuiteCompleted { result: SuiteResult, exec_time_secs: f64 },
}

impl Event {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::TestStarted { .. } => "test_started",
            Self::TestStdout { .. } => "test_stdout",
            Self::KernelTainted { .. } => "kernel_tainted",
            Self::KernelPanic => "kernel_panic",
            Self::SutNotResponding => "sut_not_responding",
            Self::TestCompleted { .. } => "test_completed",
            Self::SuiteStarted { .. } => "suite_started",
            Self::SutRestart { .. } => "sut_restart",
            Self::SutStdout { .. } => "sut_stdout",
            Self::SuiteTimeout { .. } => "suite_timeout",
            Self::SuiteCompleted { .. } => "suite_completed",
        }
    }
}

/// Broadcast channel for run events (JSON lines).
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<String>,
}

impl EventBus {
    /// Create a new event bus with the provided buffer size.
    ///
    /// Note: the effective buffer is clamped to at least `DEFAULT_BUFFER` so
    /// bursts of stdout chunks don't immediately lag slow subscribers.
    pub fn new(buffer: usize) -> Self {
        let buffer = buffer.max(DEFAULT_BUFFER);
        let (sender, _) = broadcast::channel(buffer);
        Self { sender }
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }

    /// Emit an event. Having no subscriber is not an error.
    pub fn emit(&self, event: &Event) {
        let payload = match serde_json::to_value(event) {
            Ok(serde_json::Value::Object(mut map)) => {
                map.entry("data").or_insert(serde_json::Value::Null);
                map.insert("timestamp".to_string(), json!(Utc::now().to_rfc3339()));
                serde_json::Value::Object(map)
            }
            Ok(other) => json!({ "event": other, "timestamp": Utc::now().to_rfc3339() }),
            Err(err) => {
                warn!("Failed to serialize event {}: {}", event.name(), err);
                return;
            }
        };
        match serde_json::to_string(&payload) {
            Ok(serialized) => {
                let _ = self.sender.send(serialized);
            }
            Err(err) => warn!("Failed to serialize event {}: {}", event.name(), err),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

/// Drain every event currently buffered and return their names.
pub fn drain_event_names(rx: &mut broadcast::Receiver<String>) -> Vec<String> {
    let mut names = Vec::new();
    while let Ok(line) = rx.try_recv() {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&line)
            && let Some(name) = value["event"].as_str()
        {
            names.push(name.to_string());
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn emit_sends_json_with_event_data_and_timestamp() {
        let bus = EventBus::new(1);
        let mut rx = bus.subscribe();

        bus.emit(&Event::SutRestart {
            sut: "host".to_string(),
        });

        let msg = tokio::time::timeout(Duration::from_millis(50), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("broadcast recv failed");

        let parsed: serde_json::Value = serde_json::from_str(&msg).expect("invalid json");
        assert_eq!(parsed["event"], "sut_restart");
        assert_eq!(parsed["data"]["sut"], "host");
        let ts = parsed["timestamp"]
            .as_str()
            .expect("timestamp should be string");
        chrono::DateTime::parse_from_rfc3339(ts).expect("timestamp should be RFC3339");
    }

    #[tokio::test]
    async fn unit_events_carry_null_data() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(&Event::KernelPanic);

        let msg = rx.recv().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(parsed["event"], "kernel_panic");
        assert!(parsed["data"].is_null());
    }

    #[test]
    fn emit_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.emit(&Event::SutNotResponding);
    }

    #[tokio::test]
    async fn name_matches_serialized_tag() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let events = [
            Event::TestStarted {
                test: Test::new("a", "true"),
            },
            Event::TestStdout {
                test: "a".into(),
                data: "out".into(),
            },
            Event::KernelTainted {
                reasons: vec!["kernel issued warning".into()],
            },
            Event::SuiteTimeout {
                suite: "s".into(),
                timeout_secs: 1.0,
            },
        ];
        for event in &events {
            bus.emit(event);
        }

        let names = drain_event_names(&mut rx);
        let expected: Vec<_> = events.iter().map(|e| e.name().to_string()).collect();
        assert_eq!(names, expected);
    }

    #[tokio::test]
    async fn new_clamps_small_buffers_to_default_capacity() {
        let bus = EventBus::new(1);
        let mut rx = bus.subscribe();

        for _ in 0..DEFAULT_BUFFER {
            bus.emit(&Event::KernelPanic);
        }

        assert_eq!(drain_event_names(&mut rx).len(), DEFAULT_BUFFER);
    }
}
