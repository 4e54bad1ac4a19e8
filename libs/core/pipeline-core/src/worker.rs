//! Worker runtime — the glue that instantiates the broker and store
//! clients, drives one queue's consume loop under a shutdown manager, and
//! runs ordered cleanup.
//!
//! Grounded on `stream_worker::worker::StreamWorker::run` for the overall
//! loop shape (outer `while !shutdown`, periodic health-check timer,
//! error-category dispatch) and `messaging::nats::worker::NatsWorker::run`
//! for the simpler `tokio::select!` structure. Neither loop implements an
//! explicit timed `get_one(queue, poll_timeout)` primitive directly — both
//! read bounded batches via a single blocking call per iteration — so the
//! named-constant poll/timeout/sleep values here are a deliberate
//! departure rather than a copy of either loop.

use crate::broker::{BrokerClient, BrokerError, Delivery, QueueOptions};
use crate::metrics;
use crate::shutdown::ShutdownManager;
use crate::store::StoreClient;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Poll timeout for `get_one` — the single highest-impact change over a
/// blocking consumer iterator: lets the outer loop observe the shutdown
/// flag between deliveries instead of hanging on an idle queue.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(1);
/// Sleep between empty-queue polls, bounding CPU use while idle.
pub const EMPTY_QUEUE_SLEEP: Duration = Duration::from_millis(100);
/// Default interval between store/broker health probes during consumption.
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
    #[error("handler failed: {0}")]
    Handler(String),
}

/// Per-service message handler, injected by the worker binary. This is the
/// only part of the system considered domain logic — every concrete
/// service (media discovery, downloader, translator, event-consumer)
/// differs only in what it installs here.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, routing_key: &str, payload: &[u8]) -> Result<(), String>;
}

pub struct WorkerRuntime {
    pub broker: BrokerClient,
    pub store: StoreClient,
    pub shutdown: ShutdownManager,
    queue: String,
    bindings: Vec<String>,
    health_check_interval: Duration,
}

impl WorkerRuntime {
    pub fn new(
        broker: BrokerClient,
        store: StoreClient,
        shutdown: ShutdownManager,
        queue: impl Into<String>,
        bindings: Vec<String>,
    ) -> Self {
        Self {
            broker,
            store,
            shutdown,
            queue: queue.into(),
            bindings,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
        }
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Startup sequence: install signal handlers, connect
    /// store and broker with tolerance (log a warning and continue on
    /// failure — fast container health, background recovery), register
    /// LIFO cleanup, then drive the consume loop until shutdown.
    pub async fn run(&self, handler: Arc<dyn MessageHandler>) -> Result<(), WorkerError> {
        self.shutdown.setup_signal_handlers();

        if let Err(e) = self.store.connect().await {
            warn!(error = %e, "store connect failed at startup, continuing in degraded mode");
        }
        if let Err(e) = self.broker.connect().await {
            warn!(error = %e, "broker connect failed at startup, continuing in degraded mode");
        }
        if !self.bindings.is_empty() {
            let bindings: Vec<&str> = self.bindings.iter().map(String::as_str).collect();
            if let Err(e) = self
                .broker
                .declare_queue(&self.queue, &bindings, QueueOptions::durable())
                .await
            {
                warn!(error = %e, queue = %self.queue, "failed to declare queue at startup");
            }
        }

        let store = self.store.clone();
        let broker = self.broker.clone();
        self.shutdown.register_cleanup_callback(move || async move {
            broker.close().await;
            store.close().await;
        });

        self.consume_loop(handler).await;
        Ok(())
    }

    async fn consume_loop(&self, handler: Arc<dyn MessageHandler>) {
        let mut last_health_check = tokio::time::Instant::now();

        while !self.shutdown.is_shutdown_requested() {
            if !self.broker.is_healthy().await {
                self.broker.ensure_connected().await;
                tokio::time::sleep(EMPTY_QUEUE_SLEEP).await;
                continue;
            }

            match self.broker.get_one(&self.queue, POLL_TIMEOUT).await {
                Ok(None) => {
                    tokio::time::sleep(EMPTY_QUEUE_SLEEP).await;
                }
                Ok(Some(delivery)) => {
                    if self.shutdown.is_shutdown_requested() {
                        let _ = delivery.nack_requeue().await;
                        break;
                    }
                    self.process_one(delivery, &handler).await;
                }
                Err(BrokerError::ConnectionLost) => {
                    warn!(queue = %self.queue, "connection lost, outer loop will reconnect");
                    self.broker.ensure_connected().await;
                }
                Err(e) => {
                    warn!(error = %e, "get_one failed");
                    tokio::time::sleep(EMPTY_QUEUE_SLEEP).await;
                }
            }

            if last_health_check.elapsed() >= self.health_check_interval {
                if !self.shutdown.is_shutdown_requested() {
                    self.probe_health().await;
                }
                last_health_check = tokio::time::Instant::now();
            }
        }

        info!(queue = %self.queue, "consume loop stopped");
    }

    async fn process_one(&self, delivery: Delivery, handler: &Arc<dyn MessageHandler>) {
        let routing_key = delivery.routing_key.clone();
        let payload = delivery.payload.clone();
        let handler = handler.clone();
        let start = std::time::Instant::now();

        metrics::set_in_flight(&self.queue, 1.0);
        let outcome = tokio::time::timeout(
            self.shutdown.shutdown_timeout,
            handler.handle(&routing_key, &payload),
        )
        .await;
        metrics::set_in_flight(&self.queue, 0.0);

        metrics::record_message_duration(&self.queue, start.elapsed());

        match outcome {
            Ok(Ok(())) => {
                metrics::record_message_outcome(&self.queue, metrics::MessageOutcome::Acked);
                if let Err(e) = delivery.ack().await {
                    warn!(error = %e, "failed to ack message");
                }
            }
            Ok(Err(e)) => {
                debug!(error = %e, routing_key = %routing_key, "handler error, nack-requeue");
                metrics::record_message_outcome(
                    &self.queue,
                    metrics::MessageOutcome::NackedRequeue,
                );
                let _ = delivery.nack_requeue().await;
            }
            Err(_) => {
                warn!(routing_key = %routing_key, "handler timed out, nack-requeue");
                metrics::record_message_outcome(&self.queue, metrics::MessageOutcome::TimedOut);
                let _ = delivery.nack_requeue().await;
            }
        }
    }

    /// Checked every `health_check_interval`, skipped during shutdown to
    /// avoid racing with cleanup. A failed probe does not
    /// itself reconnect in-place — that happens the next time the consume
    /// loop observes `!is_healthy()`.
    async fn probe_health(&self) {
        let store_ok = self.store.is_healthy().await;
        let broker_ok = self.broker.is_healthy().await;
        if !store_ok || !broker_ok {
            debug!(store_ok, broker_ok, "periodic health probe found a degraded dependency");
        }
    }
}
