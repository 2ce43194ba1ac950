//! Standalone demo binary: boots the engine with a scripted adapter so the
//! dispatch loop, credential rotation, and request lifecycle can be driven
//! end to end without a real upstream or an HTTP ingress in front of it.

use std::sync::Arc;
use std::time::Duration;

use genproxy_engine::adapter::mock::{always_ok, ScriptedAdapter};
use genproxy_engine::{Engine, EngineConfig, Operation, StaticCredentialValidator};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = EngineConfig::from_env();
    let adapter = Arc::new(ScriptedAdapter::new());
    for id in 0..3 {
        adapter.script(id, always_ok(json!({ "demo": true, "credential": id })));
    }

    let validator = StaticCredentialValidator::new(["demo-token".to_string()]);
    let client = genproxy_engine::engine::authorize(&validator, "demo-token")?;

    let engine = Engine::start(3, adapter, config);

    let id = engine.enqueue(
        client,
        5,
        Operation::Generate {
            model: "demo-model".into(),
            args: json!({ "prompt": "hello" }),
        },
    );
    tracing::info!(request_id = %id, "enqueued demo request");

    let result = engine.poll_wait(&id, false).await;
    match result {
        Some(poll) => tracing::info!(status = ?poll.status, result = ?poll.result, "request finished"),
        None => tracing::warn!("request id not found"),
    }

    let stats = engine.stats();
    tracing::info!(
        queue_size = stats.queue_size,
        in_flight = stats.in_flight,
        completed = stats.completed,
        "engine stats"
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    engine.shutdown().await;
    Ok(())
}
