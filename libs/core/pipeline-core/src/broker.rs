//! AMQP topic-exchange broker client.
//!
//! Owns one logical connection: a single `Connection`, a single `Channel`,
//! and the shared durable topic exchange. Grounded on the only `lapin`
//! user in the retrieval pack (`cleanappio`'s `rustlib/rabbitmq`), with two
//! deliberate departures from that source: the exchange is declared
//! `Topic`, not `Direct` (wildcard routing is load-bearing here), and
//! `is_healthy()` reflects real connection state instead of a hardcoded
//! `true`.

use crate::metrics;
use crate::retry::{retry, BackoffConfig, SingleFlight};
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

pub const SHARED_EXCHANGE: &str = "subtitle.events";

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("failed to connect to broker: {0}")]
    ConnectError(String),
    #[error("failed to open channel: {0}")]
    ChannelError(String),
    #[error("failed to declare exchange: {0}")]
    ExchangeDeclareFailed(String),
    #[error("failed to declare queue '{0}': {1}")]
    QueueDeclareFailed(String, String),
    #[error("failed to bind queue '{queue}' to routing key '{routing_key}': {source}")]
    QueueBindFailed {
        queue: String,
        routing_key: String,
        source: String,
    },
    #[error("failed to register consumer on queue '{0}': {1}")]
    ConsumeFailed(String, String),
    #[error("not connected")]
    NotConnected,
    #[error("connection to broker was lost")]
    ConnectionLost,
    #[error("ack/nack failed: {0}")]
    AckFailed(String),
}

/// Options accepted by `declare_queue`. `dead_letter_exchange` is plumbing
/// for a future DLX binding, unused by the core today.
#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    pub durable: bool,
    pub dead_letter_exchange: Option<String>,
}

impl QueueOptions {
    pub fn durable() -> Self {
        Self {
            durable: true,
            dead_letter_exchange: None,
        }
    }
}

/// `persistent` is currently always honored (every publish uses
/// delivery-mode 2, per contract); the field is kept so a future
/// non-persistent publish path doesn't need a signature change.
#[derive(Debug, Clone, Copy, Default)]
pub struct PublishOptions {
    pub persistent: bool,
}

/// Connection state for the broker: connection/channel/exchange handles,
/// tracked together so "all three non-null" can be checked in one place.
struct ConnectionState {
    connection: Option<Connection>,
    channel: Option<Channel>,
    exchange_declared: bool,
}

impl ConnectionState {
    fn empty() -> Self {
        Self {
            connection: None,
            channel: None,
            exchange_declared: false,
        }
    }

    fn is_healthy(&self) -> bool {
        self.exchange_declared
            && self
                .channel
                .as_ref()
                .map(|c| c.status().connected())
                .unwrap_or(false)
            && self
                .connection
                .as_ref()
                .map(|c| c.status().connected())
                .unwrap_or(false)
    }
}

/// One log emission per observed state transition: `connecting`,
/// `connected`, `connection_lost`, `reconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogState {
    Unknown,
    Connected,
    ConnectionLost,
}

struct Inner {
    amqp_url: String,
    exchange_name: String,
    backoff: BackoffConfig,
    state: RwLock<ConnectionState>,
    log_state: RwLock<LogState>,
    consumers: Mutex<HashMap<String, Consumer>>,
    reconnect: SingleFlight,
    last_health_check_at: RwLock<Option<Instant>>,
}

/// Default reconnect schedule for callers that don't wire in their own
/// `BackoffConfig` — matches `config.rs`'s `*_RECONNECT_*` env var defaults
/// (3s initial, 30s max, 10 attempts).
fn default_backoff() -> BackoffConfig {
    BackoffConfig::new(Duration::from_secs(3), Duration::from_secs(30), 10)
}

#[derive(Clone)]
pub struct BrokerClient {
    inner: Arc<Inner>,
}

/// A received message, RAII-guarded so every delivery ends in exactly one
/// of ack / nack-with-requeue — a delivery dropped without an explicit
/// `ack`/`nack_requeue` call is nacked with requeue automatically.
pub struct Delivery {
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub delivery_tag: u64,
    inner: Option<lapin::message::Delivery>,
}

impl Delivery {
    fn from_lapin(delivery: lapin::message::Delivery) -> Self {
        Self {
            routing_key: delivery.routing_key.to_string(),
            payload: delivery.data.clone(),
            delivery_tag: delivery.delivery_tag,
            inner: Some(delivery),
        }
    }

    pub async fn ack(mut self) -> Result<(), BrokerError> {
        if let Some(inner) = self.inner.take() {
            inner
                .ack(BasicAckOptions::default())
                .await
                .map_err(|e| BrokerError::AckFailed(e.to_string()))?;
        }
        Ok(())
    }

    pub async fn nack_requeue(mut self) -> Result<(), BrokerError> {
        if let Some(inner) = self.inner.take() {
            inner
                .nack(BasicNackOptions {
                    requeue: true,
                    multiple: false,
                })
                .await
                .map_err(|e| BrokerError::AckFailed(e.to_string()))?;
        }
        Ok(())
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            tokio::spawn(async move {
                if let Err(e) = inner
                    .nack(BasicNackOptions {
                        requeue: true,
                        multiple: false,
                    })
                    .await
                {
                    warn!(error = %e, "failed to nack-requeue an un-acked delivery on drop");
                }
            });
        }
    }
}

impl BrokerClient {
    pub fn new(amqp_url: impl Into<String>) -> Self {
        Self::with_exchange(amqp_url, SHARED_EXCHANGE)
    }

    pub fn with_exchange(amqp_url: impl Into<String>, exchange_name: impl Into<String>) -> Self {
        Self::with_backoff(amqp_url, exchange_name, default_backoff())
    }

    /// Like `new`, but with a caller-supplied reconnect schedule instead of
    /// `default_backoff()`.
    pub fn new_with_backoff(amqp_url: impl Into<String>, backoff: BackoffConfig) -> Self {
        Self::with_backoff(amqp_url, SHARED_EXCHANGE, backoff)
    }

    /// Full constructor: lets the caller supply the reconnect schedule
    /// `connect()`/`ensure_connected()` use, sourced from
    /// `config.broker.backoff` (`BROKER_RECONNECT_MAX_RETRIES`/
    /// `BROKER_RECONNECT_INITIAL_DELAY`/`BROKER_RECONNECT_MAX_DELAY`).
    pub fn with_backoff(
        amqp_url: impl Into<String>,
        exchange_name: impl Into<String>,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                amqp_url: amqp_url.into(),
                exchange_name: exchange_name.into(),
                backoff,
                state: RwLock::new(ConnectionState::empty()),
                log_state: RwLock::new(LogState::Unknown),
                consumers: Mutex::new(HashMap::new()),
                reconnect: SingleFlight::new(),
                last_health_check_at: RwLock::new(None),
            }),
        }
    }

    /// Idempotent. Establishes connection + channel, declares the shared
    /// durable topic exchange. Re-declaration (e.g. after a reconnect) is
    /// idempotent given identical arguments, per AMQP server semantics.
    /// Retries under the `BackoffConfig` supplied at construction.
    pub async fn connect(&self) -> Result<(), BrokerError> {
        let was_connection_lost = *self.inner.log_state.read().await == LogState::ConnectionLost;
        info!(exchange = %self.inner.exchange_name, "connecting");

        let cfg = self.inner.backoff;
        let amqp_url = self.inner.amqp_url.clone();
        let exchange_name = self.inner.exchange_name.clone();

        let result = retry(
            &cfg,
            || {
                let amqp_url = amqp_url.clone();
                let exchange_name = exchange_name.clone();
                async move { Self::connect_once(&amqp_url, &exchange_name).await }
            },
            |_| true,
        )
        .await;

        match result {
            Ok((connection, channel)) => {
                let mut state = self.inner.state.write().await;
                state.connection = Some(connection);
                state.channel = Some(channel);
                state.exchange_declared = true;
                drop(state);

                let mut log_state = self.inner.log_state.write().await;
                if was_connection_lost {
                    info!(exchange = %self.inner.exchange_name, "reconnected");
                    metrics::record_reconnect("broker");
                } else {
                    info!(exchange = %self.inner.exchange_name, "connected");
                }
                *log_state = LogState::Connected;

                Ok(())
            }
            Err(e) => Err(BrokerError::ConnectError(e.to_string())),
        }
    }

    async fn connect_once(
        amqp_url: &str,
        exchange_name: &str,
    ) -> Result<(Connection, Channel), BrokerError> {
        let connection = Connection::connect(amqp_url, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::ConnectError(e.to_string()))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::ChannelError(e.to_string()))?;

        channel
            .exchange_declare(
                exchange_name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                    passive: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::ExchangeDeclareFailed(e.to_string()))?;

        Ok((connection, channel))
    }

    /// Declares a durable queue and binds it under one or more routing
    /// keys (e.g. `subtitle.*`, `job.*`). Does not start consuming —
    /// `get_one`/`consume` lazily register the AMQP consumer the first
    /// time this queue is polled.
    pub async fn declare_queue(
        &self,
        name: &str,
        bindings: &[&str],
        opts: QueueOptions,
    ) -> Result<(), BrokerError> {
        let state = self.inner.state.read().await;
        let channel = state.channel.as_ref().ok_or(BrokerError::NotConnected)?;

        channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: opts.durable,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                    passive: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::QueueDeclareFailed(name.to_string(), e.to_string()))?;

        for routing_key in bindings {
            channel
                .queue_bind(
                    name,
                    &self.inner.exchange_name,
                    routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BrokerError::QueueBindFailed {
                    queue: name.to_string(),
                    routing_key: routing_key.to_string(),
                    source: e.to_string(),
                })?;
        }

        Ok(())
    }

    /// Serializes `payload` is the caller's job; this publishes the raw
    /// bytes as a persistent, `application/json` message. Returns `true`
    /// on success, `false` after one reconnect-and-retry cycle fails.
    /// Never raises — publish failure is a caller-visible sentinel so the
    /// caller can route to a failure event (no silent task loss).
    pub async fn publish(&self, routing_key: &str, payload: &[u8], opts: PublishOptions) -> bool {
        if self.try_publish_once(routing_key, payload, opts).await {
            return true;
        }

        if !self.ensure_connected().await || !self.try_publish_once(routing_key, payload, opts).await {
            metrics::record_publish_failure(routing_key);
            return false;
        }

        true
    }

    async fn try_publish_once(&self, routing_key: &str, payload: &[u8], _opts: PublishOptions) -> bool {
        let state = self.inner.state.read().await;
        let channel = match state.channel.as_ref() {
            Some(c) => c,
            None => return false,
        };

        // Every message is published persistent (delivery-mode 2) per contract —
        // there is no non-persistent publish path in this core.
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2);

        let result = channel
            .basic_publish(
                &self.inner.exchange_name,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await;

        match result {
            Ok(confirm) => confirm.await.is_ok(),
            Err(_) => false,
        }
    }

    /// Poll-with-timeout primitive: the single highest-impact change over
    /// a blocking consumer iterator — lets the outer driver observe a
    /// shutdown flag between deliveries instead of hanging on an idle
    /// queue. `Ok(None)` on a bare poll timeout;
    /// `Err(ConnectionLost)` when the underlying stream has ended.
    pub async fn get_one(
        &self,
        queue: &str,
        poll_timeout: Duration,
    ) -> Result<Option<Delivery>, BrokerError> {
        self.ensure_consumer(queue).await?;

        let mut consumers = self.inner.consumers.lock().await;
        let consumer = consumers.get_mut(queue).ok_or(BrokerError::NotConnected)?;

        match tokio::time::timeout(poll_timeout, consumer.next()).await {
            Ok(Some(Ok(delivery))) => Ok(Some(Delivery::from_lapin(delivery))),
            Ok(Some(Err(_))) => {
                consumers.remove(queue);
                Err(BrokerError::ConnectionLost)
            }
            Ok(None) => {
                consumers.remove(queue);
                Err(BrokerError::ConnectionLost)
            }
            Err(_) => Ok(None), // poll timeout, not a failure
        }
    }

    async fn ensure_consumer(&self, queue: &str) -> Result<(), BrokerError> {
        let mut consumers = self.inner.consumers.lock().await;
        if consumers.contains_key(queue) {
            return Ok(());
        }

        let state = self.inner.state.read().await;
        let channel = state.channel.as_ref().ok_or(BrokerError::NotConnected)?;

        let consumer = channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions {
                    no_ack: false,
                    exclusive: false,
                    no_local: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::ConsumeFailed(queue.to_string(), e.to_string()))?;

        consumers.insert(queue.to_string(), consumer);
        Ok(())
    }

    /// Standalone cooperative consume loop for direct use outside the
    /// worker runtime: wraps each delivery in a process context that
    /// auto-acks on success and nacks-with-requeue on handler error or
    /// per-message timeout. Runs until the broker connection is lost.
    pub async fn consume<F, Fut, E>(
        &self,
        queue: &str,
        mut handler: F,
        timeout_per_message: Duration,
    ) -> Result<(), BrokerError>
    where
        F: FnMut(Vec<u8>) -> Fut,
        Fut: std::future::Future<Output = Result<(), E>>,
        E: std::fmt::Display,
    {
        loop {
            match self.get_one(queue, Duration::from_secs(1)).await? {
                None => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
                Some(delivery) => {
                    let payload = delivery.payload.clone();
                    let outcome = tokio::time::timeout(timeout_per_message, handler(payload)).await;

                    match outcome {
                        Ok(Ok(())) => {
                            let _ = delivery.ack().await;
                        }
                        Ok(Err(e)) => {
                            debug!(error = %e, "handler error, nack-requeue");
                            let _ = delivery.nack_requeue().await;
                        }
                        Err(_) => {
                            warn!("handler timed out, nack-requeue");
                            let _ = delivery.nack_requeue().await;
                        }
                    }
                }
            }
        }
    }

    /// Non-blocking: connection open, channel present, exchange declared.
    pub async fn is_healthy(&self) -> bool {
        let healthy = self.inner.state.read().await.is_healthy();
        if !healthy {
            let mut log_state = self.inner.log_state.write().await;
            if *log_state == LogState::Connected {
                warn!(exchange = %self.inner.exchange_name, "connection_lost");
                *log_state = LogState::ConnectionLost;
            }
        }
        healthy
    }

    /// If healthy, returns `true` immediately. Otherwise takes the
    /// reconnect mutex (single-flight across concurrent callers) and
    /// invokes the backoff connect.
    pub async fn ensure_connected(&self) -> bool {
        let outcome = self
            .inner
            .reconnect
            .run(
                || {
                    // Synchronous re-check requires blocking on the async
                    // health check; since SingleFlight::is_done is sync,
                    // fall back to checking the raw handle state here.
                    false
                },
                || async {
                    let healthy = self.is_healthy().await;
                    if healthy {
                        return true;
                    }
                    self.connect().await.is_ok()
                },
            )
            .await;

        match outcome {
            Some((_, connected)) => connected,
            None => self.is_healthy().await,
        }
    }

    /// Suspends any pending health task, closes channel and connection.
    /// Idempotent; never raises.
    pub async fn close(&self) {
        let mut consumers = self.inner.consumers.lock().await;
        consumers.clear();
        drop(consumers);

        let mut state = self.inner.state.write().await;
        if let Some(channel) = state.channel.take() {
            let _ = channel.close(200, "closing").await;
        }
        if let Some(connection) = state.connection.take() {
            let _ = connection.close(200, "closing").await;
        }
        state.exchange_declared = false;
    }

    pub async fn mark_health_checked(&self) {
        *self.inner.last_health_check_at.write().await = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_options_durable_default() {
        let opts = QueueOptions::durable();
        assert!(opts.durable);
        assert!(opts.dead_letter_exchange.is_none());
    }

    #[tokio::test]
    async fn fresh_client_is_unhealthy_until_connected() {
        let client = BrokerClient::new("amqp://127.0.0.1:5672/%2f");
        assert!(!client.is_healthy().await);
    }

    #[tokio::test]
    async fn publish_without_connection_returns_false_never_panics() {
        let client = BrokerClient::new("amqp://127.0.0.1:5672/%2f");
        let ok = client
            .try_publish_once("subtitle.ready", b"{}", PublishOptions::default())
            .await;
        assert!(!ok);
    }
}
