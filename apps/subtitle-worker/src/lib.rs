//! Subtitle worker service — a thin binary wiring `pipeline-core` to one
//! example message handler.
//!
//! This crate contains no subtitle-domain logic itself; its handler is a
//! stand-in that logs, nudges a job's phase forward in the store, and acks
//! — demonstrating the instantiation pattern every real service (media
//! discovery, the downloader, the translator, the event-consumer) follows.
//! They differ from this binary only in what they install as the
//! [`pipeline_core::MessageHandler`].

use async_trait::async_trait;
use eyre::{Result, WrapErr};
use pipeline_core::{
    health_router, BrokerClient, Config, HealthState, Job, JobStatus, MessageHandler,
    ShutdownManager, StoreClient, WorkerRuntime,
};
use serde_json::Value;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

const QUEUE_NAME: &str = "subtitle.worker.demo";
const BINDINGS: &[&str] = &["subtitle.*", "job.*"];

struct DemoHandler {
    store: StoreClient,
}

#[async_trait]
impl MessageHandler for DemoHandler {
    async fn handle(&self, routing_key: &str, payload: &[u8]) -> Result<(), String> {
        let body: Value = serde_json::from_slice(payload).map_err(|e| e.to_string())?;
        let job_id = body
            .get("job_id")
            .and_then(Value::as_str)
            .ok_or_else(|| "payload missing 'job_id'".to_string())?;

        info!(routing_key, job_id, "received event");

        if self.store.get_job(job_id).await.is_none() {
            let job = Job::new(job_id, Default::default());
            self.store.save_job(&job).await;
        }

        let next_status = match routing_key {
            "subtitle.download.requested" => JobStatus::Downloading,
            "subtitle.ready" => JobStatus::Translating,
            "subtitle.translated" | "translation.completed" => JobStatus::Completed,
            "job.failed" => JobStatus::Failed,
            _ => return Ok(()),
        };

        self.store
            .update_phase(job_id, next_status, "subtitle-worker", Default::default())
            .await;

        Ok(())
    }
}

async fn serve_health(state: HealthState, port: u16) -> Result<()> {
    let app = health_router(state);
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("failed to bind health server to {addr}"))?;

    info!(%addr, "health server listening");
    axum::serve(listener, app)
        .await
        .wrap_err("health server failed")?;
    Ok(())
}

pub async fn run() -> Result<()> {
    let config = Config::from_env().wrap_err("failed to load configuration")?;
    pipeline_core::config::init_tracing(&config.environment);
    pipeline_core::metrics::init_metrics();

    info!(environment = ?config.environment, "starting subtitle worker");

    let broker = BrokerClient::new_with_backoff(config.broker.url.clone(), config.broker.backoff);
    let store = StoreClient::new(
        config.store.url.clone(),
        config.ttl,
        config.store.health_check_interval,
        config.store.backoff,
    );
    let shutdown = ShutdownManager::new(config.shutdown_timeout)
        .wrap_err("invalid SHUTDOWN_TIMEOUT")?;

    let health_port: u16 = std::env::var("HEALTH_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080);

    let health_state = HealthState::new(broker.clone(), store.clone(), shutdown.clone());
    tokio::spawn(async move {
        if let Err(e) = serve_health(health_state, health_port).await {
            warn!(error = %e, "health server exited");
        }
    });

    let runtime = WorkerRuntime::new(
        broker,
        store.clone(),
        shutdown,
        QUEUE_NAME,
        BINDINGS.iter().map(|s| s.to_string()).collect(),
    )
    .with_health_check_interval(config.broker.health_check_interval);

    let handler: Arc<dyn MessageHandler> = Arc::new(DemoHandler { store });
    runtime.run(handler).await.map_err(|e| eyre::eyre!("{e}"))?;

    info!("subtitle worker stopped");
    Ok(())
}
