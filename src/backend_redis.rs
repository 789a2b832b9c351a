//! Redis-backed durable backend.
//!
//! Uses the reliable-queue list pattern per subscription: `produce` LPUSHes
//! the JSON-serialized event onto each registered subscription queue, the
//! per-subscription worker RPOPLPUSHes the oldest entry onto an in-flight
//! list before dispatching and LREMs it once the handler returns. `init`
//! moves any in-flight leftovers from a prior run back onto their queues so
//! unacknowledged messages are redelivered.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cloudevents::Event;
use redis::AsyncCommands;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::backend::{Backend, DispatchHandler};
use crate::error::{BackendError, ProduceError};
use crate::shutdown::Shutdown;

/// Interval between polls of an empty subscription queue.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct RedisBackend {
    client: redis::Client,
    prefix: String,
    workers: RwLock<HashMap<String, Worker>>,
}

struct Worker {
    cancel: Shutdown,
    handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl RedisBackend {
    pub fn new(client: redis::Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
            workers: RwLock::new(HashMap::new()),
        }
    }

    fn subs_key(&self) -> String {
        format!("{}:subs", self.prefix)
    }

    fn queue_key(&self, name: &str) -> String {
        format!("{}:sub:{}:queue", self.prefix, name)
    }

    fn in_flight_key(&self, name: &str) -> String {
        format!("{}:sub:{}:inflight", self.prefix, name)
    }

    async fn connection(&self) -> Result<redis::aio::Connection, BackendError> {
        self.client
            .get_tokio_connection()
            .await
            .map_err(|e| BackendError::Connection(e.to_string()))
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn init(&self) -> Result<(), BackendError> {
        let mut conn = self.connection().await?;

        let names: Vec<String> = conn
            .smembers(self.subs_key())
            .await
            .map_err(|e| BackendError::Initialization(e.to_string()))?;

        // Reclaim messages a previous run took in flight but never
        // acknowledged. They are appended to the consuming end of the
        // queue so they redeliver before newer messages.
        for name in names {
            let in_flight: Vec<String> = conn
                .lrange(self.in_flight_key(&name), 0, -1)
                .await
                .map_err(|e| BackendError::Initialization(e.to_string()))?;
            if in_flight.is_empty() {
                continue;
            }

            warn!(
                subscription = %name,
                count = in_flight.len(),
                "reclaiming unacknowledged messages from a previous run"
            );
            for payload in &in_flight {
                let _: i64 = conn
                    .rpush(self.queue_key(&name), payload)
                    .await
                    .map_err(|e| BackendError::Initialization(e.to_string()))?;
            }
            let _: i64 = conn
                .del(self.in_flight_key(&name))
                .await
                .map_err(|e| BackendError::Initialization(e.to_string()))?;
        }

        Ok(())
    }

    async fn start(&self, shutdown: Shutdown) -> Result<(), BackendError> {
        shutdown.cancelled().await;

        let workers: Vec<Worker> = {
            let mut guard = self.workers.write().await;
            guard.drain().map(|(_, w)| w).collect()
        };
        for worker in &workers {
            worker.cancel.initiate();
        }
        for worker in workers {
            if let Some(handle) = worker.handle.lock().await.take() {
                let _ = handle.await;
            }
        }
        Ok(())
    }

    async fn produce(&self, event: Event) -> Result<(), ProduceError> {
        let payload =
            serde_json::to_string(&event).map_err(|e| ProduceError::Backend(e.to_string()))?;

        let mut conn = self
            .client
            .get_tokio_connection()
            .await
            .map_err(|e| ProduceError::Backend(e.to_string()))?;

        let names: Vec<String> = conn
            .smembers(self.subs_key())
            .await
            .map_err(|e| ProduceError::Backend(e.to_string()))?;

        for name in names {
            let _: i64 = conn
                .lpush(self.queue_key(&name), &payload)
                .await
                .map_err(|e| ProduceError::Backend(e.to_string()))?;
        }
        Ok(())
    }

    async fn subscribe(&self, name: &str, handler: DispatchHandler) {
        let cancel = Shutdown::new();
        let handle = tokio::spawn(consume_loop(
            self.client.clone(),
            self.queue_key(name),
            self.in_flight_key(name),
            name.to_string(),
            handler,
            cancel.clone(),
        ));

        if let Ok(mut conn) = self.client.get_tokio_connection().await {
            let result: redis::RedisResult<i64> = conn.sadd(self.subs_key(), name).await;
            if let Err(e) = result {
                error!(subscription = %name, error = %e, "could not register subscription");
            }
        }

        self.workers.write().await.insert(
            name.to_string(),
            Worker {
                cancel,
                handle: Arc::new(Mutex::new(Some(handle))),
            },
        );
    }

    async fn unsubscribe(&self, name: &str) {
        let worker = self.workers.write().await.remove(name);
        if let Some(worker) = worker {
            worker.cancel.initiate();
            if let Some(handle) = worker.handle.lock().await.take() {
                let _ = handle.await;
            }
        }

        if let Ok(mut conn) = self.client.get_tokio_connection().await {
            let removed: redis::RedisResult<i64> = conn.srem(self.subs_key(), name).await;
            if let Err(e) = removed {
                error!(subscription = %name, error = %e, "could not deregister subscription");
            }
            let dropped: redis::RedisResult<i64> = conn
                .del(&[self.queue_key(name), self.in_flight_key(name)])
                .await;
            if let Err(e) = dropped {
                error!(subscription = %name, error = %e, "could not drop subscription queues");
            }
        }
    }
}

/// Serial consumer for one subscription. A message sits on the in-flight
/// list from pop to acknowledgement so a crash between the two redelivers
/// it on the next `init`.
async fn consume_loop(
    client: redis::Client,
    queue_key: String,
    in_flight_key: String,
    name: String,
    handler: DispatchHandler,
    cancel: Shutdown,
) {
    loop {
        if cancel.is_initiated() {
            break;
        }

        let mut conn = match client.get_tokio_connection().await {
            Ok(c) => c,
            Err(e) => {
                warn!(subscription = %name, error = %e, "redis connection failed, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(POLL_INTERVAL) => continue,
                    _ = cancel.cancelled() => break,
                }
            }
        };

        let popped: redis::RedisResult<Option<String>> =
            conn.rpoplpush(&queue_key, &in_flight_key).await;

        match popped {
            Ok(Some(payload)) => {
                match serde_json::from_str::<Event>(&payload) {
                    Ok(event) => handler(event).await,
                    Err(e) => {
                        // An undecodable payload can never dispatch; treat
                        // it as consumed rather than poison the queue.
                        error!(subscription = %name, error = %e, "dropping undecodable message");
                    }
                }
                let acked: redis::RedisResult<i64> = conn.lrem(&in_flight_key, 1, &payload).await;
                if let Err(e) = acked {
                    error!(subscription = %name, error = %e, "could not acknowledge message");
                }
            }
            Ok(None) => {
                tokio::select! {
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                    _ = cancel.cancelled() => break,
                }
            }
            Err(e) => {
                warn!(subscription = %name, error = %e, "redis poll failed, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                    _ = cancel.cancelled() => break,
                }
            }
        }
    }
    debug!(subscription = %name, "subscription consumer stopped");
}
