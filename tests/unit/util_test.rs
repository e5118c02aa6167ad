//! Tests for utility functions

use std::time::Duration;

use workhorse::util::{init_tracing, new_batch_id, new_chain_id, now, now_ms, until};

#[test]
fn test_group_ids_are_unique() {
    assert_ne!(new_batch_id(), new_batch_id());
    assert_ne!(new_chain_id(), new_chain_id());
}

#[test]
fn test_clock_helpers_agree() {
    let wall = now().timestamp_millis();
    let epoch = i64::try_from(now_ms()).unwrap();
    assert!((epoch - wall).abs() < 1_000);
}

#[test]
fn test_until_saturates_at_zero() {
    assert_eq!(until(now() - chrono::Duration::seconds(1)), Duration::ZERO);
    assert!(until(now() + chrono::Duration::seconds(10)) > Duration::from_secs(9));
}

#[test]
fn test_init_tracing_is_idempotent() {
    init_tracing();
    assert!(tracing::dispatcher::has_been_set());
    init_tracing();
    tracing::info!(target: "workhorse", "tracing initialized twice");
}
