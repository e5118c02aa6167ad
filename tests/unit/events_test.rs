//! Tests for event sinks and the notifier

use std::sync::Arc;

use uuid::Uuid;
use workhorse::core::{ChannelEventSink, EngineEvent, EventSink, InMemoryEventSink, JobStatus, Notifier};

fn finished(execution_id: u64) -> EngineEvent {
    EngineEvent::ExecutionFinished {
        job_id: 1,
        execution_id,
        duration_ms: 5,
    }
}

#[test]
fn test_history_drops_oldest_first() {
    let history = InMemoryEventSink::new(2);
    history.record(&finished(1));
    history.record(&finished(2));
    history.record(&finished(3));
    assert_eq!(history.events(), vec![finished(2), finished(3)]);
}

#[test]
fn test_history_with_zero_capacity_keeps_nothing() {
    let history = InMemoryEventSink::new(0);
    history.record(&finished(1));
    assert!(history.events().is_empty());
}

#[test]
fn test_notifier_fans_out_to_every_sink() {
    let notifier = Notifier::new();
    let history = Arc::new(InMemoryEventSink::new(16));
    let (channel, rx) = ChannelEventSink::unbounded();
    notifier.add_sink(history.clone());
    notifier.add_sink(Arc::new(channel));

    let event = EngineEvent::BatchFinished {
        job_id: 3,
        batch_id: Uuid::new_v4(),
    };
    notifier.emit(event.clone());

    assert_eq!(history.events(), vec![event.clone()]);
    assert_eq!(rx.try_recv().unwrap(), event);
}

#[test]
fn test_bounded_channel_drops_when_full() {
    let (channel, rx) = ChannelEventSink::bounded(1);
    channel.record(&finished(1));
    channel.record(&finished(2));
    assert_eq!(rx.try_iter().count(), 1);
}

#[test]
fn test_event_serialization_is_tagged() {
    let event = EngineEvent::JobError {
        job_id: 9,
        prior_status: JobStatus::Active,
        message: "invalid schedule".to_string(),
    };
    let value = serde_json::to_value(&event).unwrap();
    assert_eq!(value["kind"], "job_error");
    assert_eq!(value["prior_status"], "ACTIVE");
    assert_eq!(event.job_id(), 9);
}
