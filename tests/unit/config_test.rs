//! Tests for configuration validation

use workhorse::config::{EngineConfig, JobConfig};
use workhorse::core::JobStatus;

fn job(name: &str) -> JobConfig {
    JobConfig {
        name: name.to_string(),
        worker_ref: "noop".to_string(),
        ..JobConfig::default()
    }
}

#[test]
fn test_engine_config_defaults() {
    let cfg = EngineConfig::default();
    assert!(cfg.validate().is_ok());
    assert_eq!(cfg.poll_interval_ms, 5_000);
    assert!(cfg.buffer_low_water <= cfg.buffer_high_water);
    assert!(cfg.zombie_max_age().is_none());
}

#[test]
fn test_engine_config_invalid_poll_interval() {
    let invalid = EngineConfig {
        poll_interval_ms: 0,
        ..EngineConfig::default()
    };
    assert!(invalid.validate().is_err());
}

#[test]
fn test_engine_config_invalid_water_marks() {
    let invalid = EngineConfig {
        buffer_low_water: 20,
        buffer_high_water: 10,
        ..EngineConfig::default()
    };
    let err = invalid.validate().unwrap_err();
    assert!(err.contains("buffer_high_water"));
}

#[test]
fn test_engine_config_invalid_zombie_age() {
    let invalid = EngineConfig {
        zombie_max_age_secs: Some(0),
        ..EngineConfig::default()
    };
    assert!(invalid.validate().is_err());
}

#[test]
fn test_job_config_validation() {
    assert!(job("mail").validate().is_ok());

    let unnamed = job("  ");
    assert!(unnamed.validate().is_err());

    let unbound = JobConfig {
        worker_ref: String::new(),
        ..job("mail")
    };
    assert!(unbound.validate().is_err());

    let zero_rate = JobConfig {
        max_per_minute: Some(0),
        ..job("mail")
    };
    assert!(zero_rate.validate().is_err());
}

#[test]
fn test_invalid_job_fails_engine_validation() {
    let cfg = EngineConfig {
        jobs: vec![job("ok"), job("")],
        ..EngineConfig::default()
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn test_engine_config_from_json() {
    let cfg = EngineConfig::from_json_str(
        r#"{
            "poll_interval_ms": 250,
            "zombie_max_age_secs": 600,
            "jobs": [
                {"name": "reports", "worker_ref": "build_report", "threads": 3,
                 "schedule": "0 */5 * * * *", "status": "INACTIVE"}
            ]
        }"#,
    )
    .unwrap();
    assert_eq!(cfg.poll_interval_ms, 250);
    assert_eq!(cfg.zombie_max_age().map(|d| d.as_secs()), Some(600));
    assert_eq!(cfg.jobs.len(), 1);

    let job = cfg.jobs[0].to_job();
    assert_eq!(job.threads, 3);
    assert_eq!(job.status, JobStatus::Inactive);
    assert_eq!(job.cron_expression(), Some("0 */5 * * * *"));
}

#[test]
fn test_engine_config_from_json_rejects_invalid() {
    assert!(EngineConfig::from_json_str(r#"{"buffer_low_water": 0}"#).is_err());
    assert!(EngineConfig::from_json_str("not json").is_err());
}

#[test]
fn test_shared_config_is_updatable() {
    let shared = EngineConfig::default().into_shared();
    shared.write().poll_interval_ms = 42;
    assert_eq!(shared.read().poll_interval().as_millis(), 42);
}
