//! Key-value job store client.
//!
//! Thin, strongly-typed façade over a Redis-style store: `job:{id}` holds the
//! serialised job record, `job:events:{id}` an append-only newest-first list.
//! Grounded on `stream_worker`'s `Arc<ConnectionManager>` storage/clone-per-call
//! pattern, generalized from stream (XADD/XREAD) semantics to plain
//! key-value (`SET`/`GETEX`/`DEL`/`EXPIRE`) and list (`LPUSH`/`LRANGE`)
//! commands, since this store is key-value, not a stream.

use crate::config::TtlPolicy;
use crate::job::{EventRecord, Job, JobStatus};
use crate::metrics;
use crate::retry::{retry, BackoffConfig, SingleFlight};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const PING_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to connect to store: {0}")]
    ConnectError(String),
    #[error("store operation timed out")]
    Timeout,
    #[error("job '{0}' not found")]
    JobNotFound(String),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("failed to (de)serialize job payload: {0}")]
    Serde(#[from] serde_json::Error),
}

fn job_key(id: &str) -> String {
    format!("job:{id}")
}

fn events_key(id: &str) -> String {
    format!("job:events:{id}")
}

/// TTL in seconds for a given status. `None` means no expiry (active jobs
/// keep living until a terminal status is reached).
fn ttl_for_status(ttl: &TtlPolicy, status: JobStatus) -> Option<u64> {
    match status {
        JobStatus::Completed if ttl.completed_secs > 0 => Some(ttl.completed_secs),
        JobStatus::Failed if ttl.failed_secs > 0 => Some(ttl.failed_secs),
        _ if ttl.active_secs > 0 => Some(ttl.active_secs),
        _ => None,
    }
}

/// Connection state for the store: client handle, connected flag, and the
/// last successful health-check timestamp, all behind one lock so
/// "connected" and "last checked" can't drift apart.
struct ConnectionState {
    client: Option<ConnectionManager>,
    connected: bool,
    last_health_check_at: Option<Instant>,
}

impl ConnectionState {
    fn empty() -> Self {
        Self {
            client: None,
            connected: false,
            last_health_check_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogState {
    Unknown,
    Connected,
    ConnectionLost,
}

struct Inner {
    redis_url: String,
    ttl: TtlPolicy,
    health_check_interval: Duration,
    backoff: BackoffConfig,
    state: RwLock<ConnectionState>,
    log_state: RwLock<LogState>,
    reconnect: SingleFlight,
    health_task: RwLock<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct StoreClient {
    inner: Arc<Inner>,
}

impl StoreClient {
    /// `backoff` is the reconnect schedule `connect()`/`ensure_connected()`
    /// retry under, sourced from `config.store.backoff`
    /// (`STORE_RECONNECT_MAX_RETRIES`/`STORE_RECONNECT_INITIAL_DELAY`/
    /// `STORE_RECONNECT_MAX_DELAY`).
    pub fn new(
        redis_url: impl Into<String>,
        ttl: TtlPolicy,
        health_check_interval: Duration,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                redis_url: redis_url.into(),
                ttl,
                health_check_interval,
                backoff,
                state: RwLock::new(ConnectionState::empty()),
                log_state: RwLock::new(LogState::Unknown),
                reconnect: SingleFlight::new(),
                health_task: RwLock::new(None),
            }),
        }
    }

    /// Establishes the connection manager and starts the background health
    /// task. Idempotent: a second call replaces the handle and restarts the
    /// task rather than stacking a duplicate. Retries under the
    /// `BackoffConfig` supplied at construction.
    pub async fn connect(&self) -> Result<(), StoreError> {
        let was_connection_lost = *self.inner.log_state.read().await == LogState::ConnectionLost;
        info!("connecting");

        let cfg = self.inner.backoff;
        let redis_url = self.inner.redis_url.clone();

        let result = retry(
            &cfg,
            || {
                let redis_url = redis_url.clone();
                async move { Self::connect_once(&redis_url).await }
            },
            |_| true,
        )
        .await;

        let manager = match result {
            Ok(manager) => manager,
            Err(e) => return Err(StoreError::ConnectError(e.to_string())),
        };

        {
            let mut state = self.inner.state.write().await;
            state.client = Some(manager);
            state.connected = true;
            state.last_health_check_at = Some(Instant::now());
        }

        {
            let mut log_state = self.inner.log_state.write().await;
            if was_connection_lost {
                info!("reconnected");
                metrics::record_reconnect("store");
            } else {
                info!("connected");
            }
            *log_state = LogState::Connected;
        }

        self.spawn_health_task().await;
        Ok(())
    }

    async fn connect_once(redis_url: &str) -> Result<ConnectionManager, StoreError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| StoreError::ConnectError(e.to_string()))?;
        client
            .get_connection_manager()
            .await
            .map_err(|e| StoreError::ConnectError(e.to_string()))
    }

    /// Replaces any previously running health task — `connect()` is
    /// idempotent, not additive.
    async fn spawn_health_task(&self) {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let client = StoreClient { inner: inner.clone() };
            loop {
                tokio::time::sleep(inner.health_check_interval).await;
                if !client.ping().await {
                    let mut state = inner.state.write().await;
                    state.connected = false;
                    drop(state);
                    client.ensure_connected().await;
                }
            }
        });

        let mut slot = self.inner.health_task.write().await;
        if let Some(old) = slot.take() {
            old.abort();
        }
        *slot = Some(handle);
    }

    /// Ping with its own 5s timeout — the whole point is to bound wait time
    /// during degraded states rather than hang on a half-open socket.
    async fn ping(&self) -> bool {
        let manager = {
            let state = self.inner.state.read().await;
            match state.client.clone() {
                Some(c) => c,
                None => return false,
            }
        };

        let mut conn = manager;
        let result = tokio::time::timeout(PING_TIMEOUT, async {
            redis::cmd("PING").query_async::<String>(&mut conn).await
        })
        .await;

        let healthy = matches!(result, Ok(Ok(_)));
        if healthy {
            self.inner.state.write().await.last_health_check_at = Some(Instant::now());
        } else {
            let mut log_state = self.inner.log_state.write().await;
            if *log_state == LogState::Connected {
                warn!("connection_lost");
                *log_state = LogState::ConnectionLost;
            }
        }
        healthy
    }

    /// `connected == true` implies a ping within the last health interval
    /// succeeded — this is a non-blocking read of that cached flag, not a
    /// fresh probe.
    pub async fn is_healthy(&self) -> bool {
        let state = self.inner.state.read().await;
        state.connected
            && state
                .last_health_check_at
                .map(|t| t.elapsed() <= self.inner.health_check_interval * 2)
                .unwrap_or(false)
    }

    /// Critical ordering: the "connected" flag is sampled *before* invoking
    /// the reconnect path. Sampling after would make a
    /// successful reconnect indistinguishable from "was already healthy",
    /// and the `reconnected` log line would never fire.
    pub async fn ensure_connected(&self) -> bool {
        let was_connected_before = self.inner.state.read().await.connected;

        if was_connected_before && self.ping().await {
            return true;
        }

        let outcome = self
            .inner
            .reconnect
            .run(
                || false,
                || async {
                    if self.ping().await {
                        return true;
                    }
                    self.connect().await.is_ok()
                },
            )
            .await;

        match outcome {
            Some((_, connected)) => connected,
            None => self.ping().await,
        }
    }

    async fn connection(&self) -> Option<ConnectionManager> {
        self.inner.state.read().await.client.clone()
    }

    /// Upsert; TTL is (re)applied per the job's current status on every
    /// write.
    pub async fn save_job(&self, job: &Job) -> bool {
        if !self.ensure_connected().await {
            return false;
        }

        let Some(mut conn) = self.connection().await else {
            return false;
        };

        let payload = match serde_json::to_string(job) {
            Ok(p) => p,
            Err(_) => return false,
        };

        let key = job_key(&job.id);
        let result: redis::RedisResult<()> = conn.set(&key, payload).await;
        if result.is_err() {
            return false;
        }

        if let Some(ttl_secs) = ttl_for_status(&self.inner.ttl, job.status) {
            let _: redis::RedisResult<()> = conn.expire(&key, ttl_secs as i64).await;
            let _: redis::RedisResult<()> =
                conn.expire(events_key(&job.id), ttl_secs as i64).await;
        }

        true
    }

    pub async fn get_job(&self, id: &str) -> Option<Job> {
        if !self.ensure_connected().await {
            return None;
        }
        let mut conn = self.connection().await?;

        let raw: Option<String> = conn.get(job_key(id)).await.ok()?;
        let raw = raw?;
        serde_json::from_str(&raw).ok()
    }

    /// Load-update-save merge: loads the job, applies the new status plus
    /// `updated_at`, appends a phase-change event, saves. Atomic only from
    /// the caller's view — the store itself provides no cross-command
    /// atomicity here.
    pub async fn update_phase(
        &self,
        id: &str,
        status: JobStatus,
        source: &str,
        metadata_patch: std::collections::HashMap<String, serde_json::Value>,
    ) -> bool {
        let Some(mut job) = self.get_job(id).await else {
            return false;
        };

        if !job.status.can_transition_to(status) {
            return false;
        }

        job.status = status;
        job.updated_at = chrono::Utc::now();
        job.metadata.extend(metadata_patch);

        if !self.save_job(&job).await {
            return false;
        }

        let event = EventRecord::new(
            format!("job.phase.{}", status_event_suffix(status)),
            source,
            std::collections::HashMap::new(),
        );
        self.record_event(id, &event).await
    }

    pub async fn list_jobs(&self) -> Vec<Job> {
        if !self.ensure_connected().await {
            return Vec::new();
        }
        let Some(mut conn) = self.connection().await else {
            return Vec::new();
        };

        let keys: Vec<String> = match conn.keys("job:*").await {
            Ok(k) => k,
            Err(_) => return Vec::new(),
        };

        let mut jobs = Vec::new();
        for key in keys {
            // Skip the per-job event lists, which share the `job:` prefix.
            if key.starts_with("job:events:") {
                continue;
            }
            if let Ok(Some(raw)) = conn.get::<_, Option<String>>(&key).await {
                if let Ok(job) = serde_json::from_str::<Job>(&raw) {
                    jobs.push(job);
                }
            }
        }
        jobs
    }

    /// Left-pushes onto the event list so readers (`LRANGE`) see
    /// newest-first without re-sorting.
    pub async fn record_event(&self, id: &str, event: &EventRecord) -> bool {
        if !self.ensure_connected().await {
            return false;
        }
        let Some(mut conn) = self.connection().await else {
            return false;
        };

        let payload = match serde_json::to_string(event) {
            Ok(p) => p,
            Err(_) => return false,
        };

        conn.lpush::<_, _, ()>(events_key(id), payload).await.is_ok()
    }

    pub async fn get_job_events(&self, id: &str, limit: Option<isize>) -> Vec<EventRecord> {
        if !self.ensure_connected().await {
            return Vec::new();
        }
        let Some(mut conn) = self.connection().await else {
            return Vec::new();
        };

        let stop = limit.map(|l| l - 1).unwrap_or(-1);
        let raw: Vec<String> = conn.lrange(events_key(id), 0, stop).await.unwrap_or_default();
        raw.iter()
            .filter_map(|s| serde_json::from_str(s).ok())
            .collect()
    }

    /// Aborts the background health task, drops the connection handle.
    /// Idempotent; never raises.
    pub async fn close(&self) {
        if let Some(handle) = self.inner.health_task.write().await.take() {
            handle.abort();
        }
        let mut state = self.inner.state.write().await;
        state.client = None;
        state.connected = false;
    }
}

fn status_event_suffix(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => "pending",
        JobStatus::Downloading => "downloading",
        JobStatus::Translating => "translating",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
    }
}
