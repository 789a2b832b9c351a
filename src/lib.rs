//! A single-tenant CloudEvents broker.
//!
//! This crate provides a broker that ingests CloudEvents over HTTP,
//! persists them in a pluggable durable backend, and fans them out to
//! declaratively configured triggers with per-trigger filtering, retries
//! and dead-lettering. Trigger configuration is hot-reloaded from a file
//! without restarting the broker.
//!
//! ## Guarantees
//! - At-least-once delivery per matching trigger
//! - Exactly one acknowledgement per message per subscription,
//!   issued only after a terminal outcome
//! - Backend cursors survive trigger reconfiguration
//! - Every dropped event leaves a `lost = true` log record
//!
//! ## Non-Guarantees
//! - Exactly-once end-to-end delivery
//! - Ordered delivery across subscribers
//! - Multi-tenant isolation
//! - Cross-broker replication
//!
//! The dispatch pipeline is the point of this crate: durable intake,
//! backend-driven redelivery, filter evaluation, retrying delivery and
//! optional re-ingest of reply events, coordinated by a subscription table
//! that reconciles against configuration snapshots.

mod backend;
mod backend_memory;
mod broker;
mod cesql;
mod config;
mod delivery;
mod error;
mod filter;
mod ingest;
mod shutdown;
mod subscriptions;
mod types;
mod watcher;

#[cfg(feature = "redis")]
mod backend_redis;

pub use backend::{Backend, CloudEventHandler, DispatchHandler};
pub use backend_memory::MemoryBackend;
pub use broker::Broker;
pub use cesql::CesqlError;
pub use config::{load_config, parse_config, parse_period, ConfigError, PeriodError};
pub use delivery::{
    DeliveryClient, DeliveryContext, DeliveryResult, HttpDeliveryClient, RetryPolicy,
};
pub use error::{BackendError, BrokerError, ProduceError};
pub use filter::{materialize, Filter, FilterError, FilterResult};
pub use ingest::{Ingest, IngestError};
pub use shutdown::Shutdown;
pub use subscriptions::Manager;
pub use types::{
    BackoffPolicy, BrokerConfig, DeliveryOptions, FilterExpr, IngestAuth, IngestConfig, Target,
    Trigger,
};
pub use watcher::{ConfigCallback, ConfigWatcher, WatcherError};

#[cfg(feature = "redis")]
pub use backend_redis::RedisBackend;

// The broker works with the SDK's event type; re-export it for callers.
pub use cloudevents::Event;
