//! Connection-resilient broker/store clients, a shutdown manager, a worker
//! runtime, and a health surface shared by every service in the
//! subtitle-acquisition pipeline.
//!
//! This crate is the concurrency and messaging core shared by a
//! distributed subtitle-acquisition pipeline: media discovery, the
//! downloader, the translator, and the event-consumer all instantiate
//! [`worker::WorkerRuntime`] with the core described here; their
//! differences are purely in the [`worker::MessageHandler`] callback they
//! install.

pub mod broker;
pub mod config;
pub mod health;
pub mod job;
pub mod metrics;
pub mod retry;
pub mod shutdown;
pub mod store;
pub mod worker;

pub use broker::{BrokerClient, BrokerError, Delivery, PublishOptions, QueueOptions};
pub use config::{Config, ConfigError, ConnectionConfig, Environment, TtlPolicy};
pub use health::{health_router, HealthState};
pub use job::{EventRecord, Job, JobId, JobStatus};
pub use retry::{retry, BackoffConfig, FlightOutcome, RetryError, SingleFlight};
pub use shutdown::{ShutdownConfigError, ShutdownManager};
pub use store::{StoreClient, StoreError};
pub use worker::{MessageHandler, WorkerError, WorkerRuntime};
