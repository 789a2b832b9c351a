use std::fmt;

use crate::ingest::IngestError;
use crate::watcher::WatcherError;

/// Errors that terminate the broker supervisor.
///
/// The first error returned by any supervised task cancels the shared
/// shutdown scope and becomes the result of `Broker::start`.
#[derive(Debug)]
pub enum BrokerError {
    /// Backend initialization or runtime failure.
    Backend(BackendError),

    /// Configuration watcher could not be started.
    Watcher(WatcherError),

    /// Ingest server failed to bind or serve.
    Ingest(IngestError),
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::Backend(e) =>
                write!(f, "backend failure: {}", e),
            BrokerError::Watcher(e) =>
                write!(f, "could not start configuration watcher: {}", e),
            BrokerError::Ingest(e) =>
                write!(f, "ingest failure: {}", e),
        }
    }
}

impl std::error::Error for BrokerError {}

/// Errors surfaced by a backend implementation.
#[derive(Debug)]
pub enum BackendError {
    /// Initialization failed (structures, migrations, reclaim).
    /// Fatal for the broker.
    Initialization(String),

    /// Connection to the underlying store was lost or refused.
    Connection(String),

    /// Unrecoverable runtime failure while driving redelivery.
    Fatal(String),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Initialization(msg) =>
                write!(f, "initialization failed: {}", msg),
            BackendError::Connection(msg) =>
                write!(f, "connection failed: {}", msg),
            BackendError::Fatal(msg) =>
                write!(f, "fatal backend error: {}", msg),
        }
    }
}

impl std::error::Error for BackendError {}

/// Errors returned by `Backend::produce`.
///
/// A produce failure at ingest surfaces as a 5xx to the client; a produce
/// failure while re-ingesting a reply event counts as a delivery failure.
#[derive(Debug)]
pub enum ProduceError {
    /// The backend rejected or could not durably append the event.
    Backend(String),

    /// The backend is shutting down and no longer accepts events.
    Shutdown,
}

impl fmt::Display for ProduceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProduceError::Backend(msg) =>
                write!(f, "produce failed: {}", msg),
            ProduceError::Shutdown =>
                write!(f, "backend is shut down"),
        }
    }
}

impl std::error::Error for ProduceError {}
