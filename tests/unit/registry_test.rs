//! Tests for the work registry

use async_trait::async_trait;
use serde_json::{json, Value};
use workhorse::core::{worker_fn, EngineError, InvokeError, JobWorker, WorkContext, WorkRegistry};

struct Doubler;

#[async_trait]
impl JobWorker for Doubler {
    async fn do_work(&self, parameters: Option<Value>, ctx: &WorkContext) -> anyhow::Result<()> {
        let n = parameters
            .and_then(|p| p.as_i64())
            .ok_or_else(|| anyhow::anyhow!("expected a number"))?;
        ctx.append_log(format!("{}", n * 2));
        Ok(())
    }
}

#[tokio::test]
async fn test_trait_worker_logs_into_context() {
    let registry = WorkRegistry::new();
    registry.register("double", Doubler);
    let ctx = WorkContext::new(1, 1, 0);

    registry.invoke("double", Some(json!(21)), &ctx).await.unwrap();
    assert_eq!(ctx.take_log().as_deref(), Some("42"));
}

#[tokio::test]
async fn test_worker_error_is_reported_as_failed() {
    let registry = WorkRegistry::new();
    registry.register("double", Doubler);
    let ctx = WorkContext::new(1, 1, 0);

    let err = registry.invoke("double", None, &ctx).await.unwrap_err();
    assert!(matches!(err, InvokeError::Failed(e) if e.to_string() == "expected a number"));
}

#[tokio::test]
async fn test_unbound_reference() {
    let registry = WorkRegistry::new();
    let ctx = WorkContext::new(1, 1, 0);
    assert!(matches!(
        registry.invoke("missing", None, &ctx).await,
        Err(InvokeError::Unbound(name)) if name == "missing"
    ));
    assert!(matches!(registry.ensure_bound("missing"), Err(EngineError::NoWorker(_))));
}

#[test]
fn test_register_and_unregister() {
    let registry = WorkRegistry::new();
    registry.register(
        "noop",
        worker_fn(|_params: Option<Value>, _ctx: WorkContext| async { anyhow::Ok(()) }),
    );
    assert!(registry.contains("noop"));
    assert!(registry.ensure_bound("noop").is_ok());
    assert!(registry.unregister("noop"));
    assert!(!registry.unregister("noop"));
    assert!(!registry.contains("noop"));
}
