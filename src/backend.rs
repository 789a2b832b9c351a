//! Durable queue contract consumed by the broker.
//!
//! A backend durably appends produced events and redelivers them to each
//! named subscription until acknowledged. Acknowledgement is implicit in
//! the dispatch handler: the backend considers a message processed when the
//! handler's future resolves, so a handler must not return before the
//! dispatch path reached a terminal outcome (delivered, dead-lettered or
//! logged lost). A message in flight when the process dies is redelivered
//! by `init` on the next run.

use std::sync::Arc;

use async_trait::async_trait;
use cloudevents::Event;
use futures::future::BoxFuture;

use crate::error::{BackendError, ProduceError};
use crate::shutdown::Shutdown;

/// Dispatch function registered per subscription. The backend invokes it
/// serially per subscription, one message in flight at a time; handler
/// return acknowledges the message.
pub type DispatchHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, ()> + Send + Sync>;

/// Sink for CloudEvents produced outside the dispatch loop: the ingest
/// server's producer callback and the subscription manager's reply sink
/// both carry this shape, and both normally point at [`Backend::produce`].
pub type CloudEventHandler =
    Arc<dyn Fn(Event) -> BoxFuture<'static, Result<(), ProduceError>> + Send + Sync>;

#[async_trait]
pub trait Backend: Send + Sync {
    /// Idempotent initialization: create structures, run migrations and
    /// reclaim messages left unacknowledged by a prior run. A failure here
    /// is fatal for the broker.
    async fn init(&self) -> Result<(), BackendError>;

    /// Drive redelivery until shutdown or a fatal error. In-flight
    /// dispatches are drained before returning.
    async fn start(&self, shutdown: Shutdown) -> Result<(), BackendError>;

    /// Durably append an event. At-least-once: the event will reach every
    /// current subscription's dispatch handler at least once.
    async fn produce(&self, event: Event) -> Result<(), ProduceError>;

    /// Register a dispatch handler under a named subscription with an
    /// independent cursor.
    async fn subscribe(&self, name: &str, handler: DispatchHandler);

    /// Remove a subscription cursor. An in-flight dispatch runs to
    /// completion; no new dispatches start.
    async fn unsubscribe(&self, name: &str);
}
