//! In-memory backend for tests and lightweight deployments.
//!
//! Keeps a FIFO queue per subscription and fans produced events out to the
//! subscriptions registered at produce time. Delivery is serial per
//! subscription; a popped message stays tracked as in-flight until its
//! dispatch handler returns. Not durable across restarts.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use cloudevents::Event;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::backend::{Backend, DispatchHandler};
use crate::error::{BackendError, ProduceError};
use crate::shutdown::Shutdown;

pub struct MemoryBackend {
    subscriptions: RwLock<HashMap<String, Arc<Subscription>>>,
}

struct Subscription {
    name: String,
    queue: Mutex<VecDeque<Event>>,
    /// Message currently being dispatched; cleared on handler return.
    in_flight: Mutex<bool>,
    notify: Notify,
    cancel: Shutdown,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    /// Messages not yet acknowledged for a subscription: queued plus
    /// in-flight. Diagnostic only.
    pub async fn pending(&self, name: &str) -> Option<usize> {
        let subs = self.subscriptions.read().await;
        let sub = subs.get(name)?;
        let queued = sub.queue.lock().await.len();
        let in_flight = usize::from(*sub.in_flight.lock().await);
        Some(queued + in_flight)
    }

    /// Names of active subscriptions. Diagnostic only.
    pub async fn subscription_names(&self) -> Vec<String> {
        self.subscriptions.read().await.keys().cloned().collect()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn init(&self) -> Result<(), BackendError> {
        // Nothing survives a restart, so there is nothing to reclaim.
        Ok(())
    }

    async fn start(&self, shutdown: Shutdown) -> Result<(), BackendError> {
        shutdown.cancelled().await;

        // Stop workers and drain in-flight dispatches.
        let subs: Vec<Arc<Subscription>> = {
            let mut guard = self.subscriptions.write().await;
            guard.drain().map(|(_, sub)| sub).collect()
        };
        for sub in &subs {
            sub.cancel.initiate();
            sub.notify.notify_one();
        }
        for sub in subs {
            if let Some(worker) = sub.worker.lock().await.take() {
                let _ = worker.await;
            }
        }
        Ok(())
    }

    async fn produce(&self, event: Event) -> Result<(), ProduceError> {
        let subs = self.subscriptions.read().await;
        for sub in subs.values() {
            sub.queue.lock().await.push_back(event.clone());
            sub.notify.notify_one();
        }
        Ok(())
    }

    async fn subscribe(&self, name: &str, handler: DispatchHandler) {
        let sub = Arc::new(Subscription {
            name: name.to_string(),
            queue: Mutex::new(VecDeque::new()),
            in_flight: Mutex::new(false),
            notify: Notify::new(),
            cancel: Shutdown::new(),
            worker: Mutex::new(None),
        });

        let worker = tokio::spawn(drain_loop(sub.clone(), handler));
        *sub.worker.lock().await = Some(worker);

        self.subscriptions
            .write()
            .await
            .insert(name.to_string(), sub);
    }

    async fn unsubscribe(&self, name: &str) {
        let sub = self.subscriptions.write().await.remove(name);
        if let Some(sub) = sub {
            sub.cancel.initiate();
            sub.notify.notify_one();
            if let Some(worker) = sub.worker.lock().await.take() {
                let _ = worker.await;
            }
        }
    }
}

/// Serial per-subscription dispatch loop. Handler return acknowledges the
/// message; cancellation lets an in-flight dispatch finish.
async fn drain_loop(sub: Arc<Subscription>, handler: DispatchHandler) {
    loop {
        if sub.cancel.is_initiated() {
            break;
        }

        // The message becomes in-flight in the same critical section that
        // removes it from the queue, so it is never unaccounted for.
        let next = {
            let mut queue = sub.queue.lock().await;
            let event = queue.pop_front();
            if event.is_some() {
                *sub.in_flight.lock().await = true;
            }
            event
        };
        match next {
            Some(event) => {
                handler(event).await;
                *sub.in_flight.lock().await = false;
            }
            None => {
                tokio::select! {
                    _ = sub.notify.notified() => {}
                    _ = sub.cancel.cancelled() => break,
                }
            }
        }
    }
    debug!(subscription = %sub.name, "subscription drain loop stopped");
}
