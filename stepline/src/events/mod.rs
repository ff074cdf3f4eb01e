//! Lifecycle event fan-out.

mod sink;

pub use sink::{
    CollectingEventSink, EventSink, EventType, LifecycleEvent, LoggingEventSink, NoOpEventSink,
};
