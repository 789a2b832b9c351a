//! Full broker wiring: HTTP ingest, memory backend, config hot reload.
//!
//! Run with a config file next to it:
//!
//! ```yaml
//! # config.yaml
//! triggers:
//!   orders:
//!     filters:
//!       - exact:
//!           type: com.example.order.created
//!     target:
//!       url: http://localhost:9000/orders
//! ```

use std::sync::Arc;

use cloudevents_broker::{
    Broker, ConfigWatcher, HttpDeliveryClient, Ingest, Manager, MemoryBackend, Shutdown,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let shutdown = Shutdown::new();
    let backend = Arc::new(MemoryBackend::new());
    let client = Arc::new(HttpDeliveryClient::new(shutdown.clone()));
    let manager = Arc::new(Manager::new(backend.clone(), client));
    let ingest = Arc::new(Ingest::new("127.0.0.1:8080".parse().expect("valid addr")));
    let watcher = ConfigWatcher::new("config.yaml");

    let broker = Broker::with_shutdown(backend, ingest, manager, watcher, shutdown);
    if let Err(e) = broker.start().await {
        eprintln!("broker exited with error: {e}");
        std::process::exit(1);
    }
}
