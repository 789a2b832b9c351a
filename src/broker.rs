//! Broker supervisor.
//!
//! Wires backend, ingest, subscription manager and config watcher
//! together, owns the shared shutdown scope, and surfaces the first error
//! of any supervised task. Interrupt and termination signals translate to
//! cancellation of the scope; no component outlives it.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info};

use crate::backend::Backend;
use crate::error::BrokerError;
use crate::ingest::Ingest;
use crate::shutdown::Shutdown;
use crate::subscriptions::Manager;
use crate::watcher::ConfigWatcher;

pub struct Broker {
    backend: Arc<dyn Backend>,
    ingest: Arc<Ingest>,
    subscriptions: Arc<Manager>,
    watcher: ConfigWatcher,
    shutdown: Shutdown,
}

impl Broker {
    pub fn new(
        backend: Arc<dyn Backend>,
        ingest: Arc<Ingest>,
        subscriptions: Arc<Manager>,
        watcher: ConfigWatcher,
    ) -> Self {
        Self::with_shutdown(backend, ingest, subscriptions, watcher, Shutdown::new())
    }

    /// Build a broker on an externally owned shutdown scope, so
    /// collaborators created before the broker (such as the delivery
    /// client) can share it.
    pub fn with_shutdown(
        backend: Arc<dyn Backend>,
        ingest: Arc<Ingest>,
        subscriptions: Arc<Manager>,
        watcher: ConfigWatcher,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            backend,
            ingest,
            subscriptions,
            watcher,
            shutdown,
        }
    }

    /// Handle to the broker's shutdown scope, for embedding and tests.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Run the broker until a signal, a fatal component error, or external
    /// cancellation of the shutdown scope.
    pub async fn start(mut self) -> Result<(), BrokerError> {
        let signal_shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            info!("signal received, shutting down");
            signal_shutdown.initiate();
        });

        // Initialization creates structures, runs migrations and reclaims
        // unacknowledged messages. A failure here is fatal.
        self.backend.init().await.map_err(BrokerError::Backend)?;

        let (report_tx, mut report_rx) = mpsc::channel::<Result<(), BrokerError>>(2);

        // Long-running redelivery loop.
        let backend = self.backend.clone();
        let backend_shutdown = self.shutdown.clone();
        let backend_report = report_tx.clone();
        tokio::spawn(async move {
            let result = backend
                .start(backend_shutdown)
                .await
                .map_err(BrokerError::Backend);
            let _ = backend_report.send(result).await;
        });

        // The reply sink and the ingest producer both append to the
        // backend. Both are installed before the watcher delivers the
        // first snapshot, so dispatch never observes a missing sink.
        let produce_backend = self.backend.clone();
        self.subscriptions
            .register_cloud_event_handler(Arc::new(move |event| {
                let backend = produce_backend.clone();
                Box::pin(async move { backend.produce(event).await })
            }))
            .await;

        let ingest_backend = self.backend.clone();
        self.ingest
            .register_cloud_event_handler(Arc::new(move |event| {
                let backend = ingest_backend.clone();
                Box::pin(async move { backend.produce(event).await })
            }))
            .await;

        // Reconfiguration callbacks: trigger table and ingest auth.
        let subscriptions = self.subscriptions.clone();
        self.watcher.add_callback(Arc::new(move |config| {
            let subscriptions = subscriptions.clone();
            Box::pin(async move { subscriptions.update_from_config(&config).await })
        }));
        let ingest = self.ingest.clone();
        self.watcher.add_callback(Arc::new(move |config| {
            let ingest = ingest.clone();
            Box::pin(async move { ingest.update_from_config(&config).await })
        }));

        // The watcher task exits cleanly on cancellation and is not
        // supervised.
        self.watcher
            .start(self.shutdown.clone())
            .await
            .map_err(BrokerError::Watcher)?;

        let ingest = self.ingest.clone();
        let ingest_shutdown = self.shutdown.clone();
        let ingest_report = report_tx;
        tokio::spawn(async move {
            let result = ingest
                .start(ingest_shutdown)
                .await
                .map_err(BrokerError::Ingest);
            let _ = ingest_report.send(result).await;
        });

        // Wait for supervised tasks; the first error cancels the scope and
        // becomes the broker's result once the rest have drained.
        let mut first_error = None;
        let mut remaining = 2;
        while remaining > 0 {
            let Some(result) = report_rx.recv().await else {
                break;
            };
            remaining -= 1;
            if let Err(e) = result {
                error!(error = %e, "broker component failed");
                if first_error.is_none() {
                    first_error = Some(e);
                }
                self.shutdown.initiate();
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
