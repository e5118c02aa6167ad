//! Tests for error types

use workhorse::core::{EngineError, StoreError};

#[test]
fn test_job_not_found_error() {
    let err = EngineError::JobNotFound(7);
    assert_eq!(format!("{err}"), "job 7 not found");
}

#[test]
fn test_no_worker_error() {
    let err = EngineError::NoWorker("send_mail".to_string());
    assert_eq!(format!("{err}"), "no worker registered for `send_mail`");
}

#[test]
fn test_invalid_schedule_error() {
    let err = EngineError::InvalidSchedule {
        expression: "bogus".to_string(),
        reason: "unexpected token".to_string(),
    };
    assert_eq!(format!("{err}"), "invalid schedule `bogus`: unexpected token");
}

#[test]
fn test_empty_group_error() {
    assert_eq!(format!("{}", EngineError::EmptyGroup("chain")), "cannot submit an empty chain");
}

#[test]
fn test_store_error_is_transparent() {
    let err: EngineError = StoreError::Backend("connection failed".to_string()).into();
    assert_eq!(format!("{err}"), "backend error: connection failed");
    assert!(matches!(err, EngineError::Store(StoreError::Backend(_))));
}
