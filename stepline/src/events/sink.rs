//! Event sink trait and implementations.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use tracing::{debug, info, Level};

/// Lifecycle event types emitted by the engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventType {
    /// A run was created and is about to dispatch steps.
    #[serde(rename = "run.started")]
    RunStarted,
    /// Every step completed or was skipped.
    #[serde(rename = "run.completed")]
    RunCompleted,
    /// A step failed or the run aborted.
    #[serde(rename = "run.failed")]
    RunFailed,
    /// The run honoured a cancellation request.
    #[serde(rename = "run.cancelled")]
    RunCancelled,
    /// A step was handed to the step executor.
    #[serde(rename = "step.started")]
    StepStarted,
    /// A failed attempt will be retried after backoff.
    #[serde(rename = "step.retrying")]
    StepRetrying,
    /// A step succeeded.
    #[serde(rename = "step.completed")]
    StepCompleted,
    /// A step exhausted its attempts.
    #[serde(rename = "step.failed")]
    StepFailed,
    /// A step was skipped.
    #[serde(rename = "step.skipped")]
    StepSkipped,
}

impl EventType {
    /// Returns the dotted event name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunStarted => "run.started",
            Self::RunCompleted => "run.completed",
            Self::RunFailed => "run.failed",
            Self::RunCancelled => "run.cancelled",
            Self::StepStarted => "step.started",
            Self::StepRetrying => "step.retrying",
            Self::StepCompleted => "step.completed",
            Self::StepFailed => "step.failed",
            Self::StepSkipped => "step.skipped",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LifecycleEvent {
    /// What happened.
    pub event_type: EventType,
    /// Pipeline name.
    pub pipeline: String,
    /// Run id.
    pub run_id: String,
    /// Step name for step events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    /// Extra payload (attempt, exit code, reason).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl LifecycleEvent {
    /// Creates a run-level event.
    #[must_use]
    pub fn run(event_type: EventType, pipeline: &str, run_id: &str) -> Self {
        Self {
            event_type,
            pipeline: pipeline.to_string(),
            run_id: run_id.to_string(),
            step: None,
            data: None,
        }
    }

    /// Creates a step-level event.
    #[must_use]
    pub fn step(event_type: EventType, pipeline: &str, run_id: &str, step: &str) -> Self {
        Self {
            step: Some(step.to_string()),
            ..Self::run(event_type, pipeline, run_id)
        }
    }

    /// Attaches a payload.
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Trait for sinks that receive lifecycle events.
///
/// Sinks never fail a run: implementations log and swallow their own errors.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event asynchronously.
    async fn emit(&self, event: LifecycleEvent);

    /// Emits an event without awaiting.
    fn try_emit(&self, event: LifecycleEvent);
}

/// A no-op event sink that discards all events.
///
/// Used as the default when no sink is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: LifecycleEvent) {}

    fn try_emit(&self, _event: LifecycleEvent) {}
}

/// An event sink that logs events using the tracing framework.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    /// The log level to use.
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a new logging event sink with the specified level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log_event(&self, event: &LifecycleEvent) {
        let step = event.step.as_deref().unwrap_or("");
        if self.level == Level::DEBUG {
            debug!(
                event_type = %event.event_type,
                pipeline = %event.pipeline,
                run_id = %event.run_id,
                step = %step,
                event_data = ?event.data,
                "Event: {}", event.event_type
            );
        } else {
            info!(
                event_type = %event.event_type,
                pipeline = %event.pipeline,
                run_id = %event.run_id,
                step = %step,
                event_data = ?event.data,
                "Event: {}", event.event_type
            );
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event: LifecycleEvent) {
        self.log_event(&event);
    }

    fn try_emit(&self, event: LifecycleEvent) {
        self.log_event(&event);
    }
}

/// A collecting event sink for testing purposes.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: parking_lot::RwLock<Vec<LifecycleEvent>>,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.read().clone()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clears all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Returns events of one type.
    #[must_use]
    pub fn events_of_type(&self, event_type: EventType) -> Vec<LifecycleEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    /// Returns the event types seen for one step, in order.
    #[must_use]
    pub fn step_timeline(&self, step: &str) -> Vec<EventType> {
        self.events
            .read()
            .iter()
            .filter(|e| e.step.as_deref() == Some(step))
            .map(|e| e.event_type)
            .collect()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event: LifecycleEvent) {
        self.events.write().push(event);
    }

    fn try_emit(&self, event: LifecycleEvent) {
        self.events.write().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_and_logging_sinks() {
        let event = LifecycleEvent::run(EventType::RunStarted, "deploy", "r1");
        NoOpEventSink.emit(event.clone()).await;
        LoggingEventSink::default().emit(event.clone()).await;
        LoggingEventSink::debug().try_emit(event);
    }

    #[tokio::test]
    async fn test_collecting_sink() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        sink.emit(LifecycleEvent::run(EventType::RunStarted, "deploy", "r1"))
            .await;
        sink.try_emit(
            LifecycleEvent::step(EventType::StepRetrying, "deploy", "r1", "build")
                .with_data(serde_json::json!({"attempt": 1})),
        );
        sink.try_emit(LifecycleEvent::step(EventType::StepCompleted, "deploy", "r1", "build"));

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.events_of_type(EventType::StepRetrying).len(), 1);
        assert_eq!(
            sink.step_timeline("build"),
            vec![EventType::StepRetrying, EventType::StepCompleted]
        );

        sink.clear();
        assert!(sink.is_empty());
    }

    #[test]
    fn test_event_serializes_with_dotted_name() {
        let event = LifecycleEvent::step(EventType::StepSkipped, "p", "r", "s");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "step.skipped");
        assert_eq!(json["step"], "s");
        assert!(json.get("data").is_none());
    }
}
