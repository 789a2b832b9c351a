//! Subscription manager and per-trigger dispatch path.
//!
//! The manager owns the table of active subscribers and reconciles it
//! against configuration snapshots. Each subscriber binds one trigger to a
//! backend subscription cursor and owns the dispatch path for it:
//! filter, deliver with retries, dead-letter, optional reply re-ingest.
//!
//! Reconciliation is the only writer to the subscriber table. The dispatch
//! path never crosses the table lock: the backend holds a direct handler
//! installed at subscribe time, and a subscriber's compiled state is
//! published as an `Arc` snapshot that dispatch clones under a short read
//! lock, so an update can never be observed torn.

use std::collections::HashMap;
use std::sync::Arc;

use cloudevents::event::AttributesReader;
use cloudevents::Event;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::backend::{Backend, CloudEventHandler, DispatchHandler};
use crate::config::parse_period;
use crate::delivery::{DeliveryClient, DeliveryContext, DeliveryResult, RetryPolicy};
use crate::filter::{materialize, Filter, FilterError, FilterResult};
use crate::types::{BrokerConfig, Trigger};

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

type ReplyHandler = Arc<RwLock<Option<CloudEventHandler>>>;

/// Owns the set of active subscribers and reconciles it against desired
/// configuration.
pub struct Manager {
    backend: Arc<dyn Backend>,
    client: Arc<dyn DeliveryClient>,
    reply_handler: ReplyHandler,
    subscribers: RwLock<HashMap<String, Arc<Subscriber>>>,
}

impl Manager {
    pub fn new(backend: Arc<dyn Backend>, client: Arc<dyn DeliveryClient>) -> Self {
        Self {
            backend,
            client,
            reply_handler: Arc::new(RwLock::new(None)),
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// Register the sink for reply events produced by targets, normally
    /// `Backend::produce`. Must be installed before dispatch begins; a
    /// reply observed without a handler counts as a delivery failure.
    pub async fn register_cloud_event_handler(&self, handler: CloudEventHandler) {
        *self.reply_handler.write().await = Some(handler);
    }

    /// Reconcile the subscriber set against a configuration snapshot.
    ///
    /// Unknown names are unsubscribed, new names subscribed, and changed
    /// triggers recompiled in place so the backend cursor survives. A
    /// trigger that fails to compile is logged and skipped; the remaining
    /// triggers still reconcile, and an existing subscriber keeps its
    /// prior good state.
    pub async fn update_from_config(&self, config: &BrokerConfig) {
        let mut subscribers = self.subscribers.write().await;

        let stale: Vec<String> = subscribers
            .keys()
            .filter(|name| !config.triggers.contains_key(*name))
            .cloned()
            .collect();
        for name in stale {
            info!(trigger = %name, "removing trigger subscription");
            self.backend.unsubscribe(&name).await;
            subscribers.remove(&name);
        }

        for (name, trigger) in &config.triggers {
            match subscribers.get(name) {
                None => {
                    let subscriber = match Subscriber::new(
                        name,
                        trigger,
                        self.client.clone(),
                        self.reply_handler.clone(),
                    ) {
                        Ok(subscriber) => Arc::new(subscriber),
                        Err(e) => {
                            error!(trigger = %name, error = %e, "could not set up trigger");
                            continue;
                        }
                    };

                    self.backend
                        .subscribe(name, subscriber.dispatch_handler())
                        .await;
                    subscribers.insert(name.clone(), subscriber);
                }
                Some(existing) => {
                    if existing.matches(trigger).await {
                        continue;
                    }
                    info!(trigger = %name, "updating trigger configuration");
                    if let Err(e) = existing.update_trigger(trigger).await {
                        error!(trigger = %name, error = %e, "could not update trigger");
                    }
                }
            }
        }
    }

    /// Names of active subscribers. Diagnostic only; takes the read lock.
    pub async fn subscriber_names(&self) -> Vec<String> {
        self.subscribers.read().await.keys().cloned().collect()
    }
}

/// Compiled, immutable revision of a trigger. Swapped wholesale on update.
struct CompiledTrigger {
    trigger: Trigger,
    filter: Filter,
    retry: Option<RetryPolicy>,
    /// The backoff delay failed to parse: matching events are logged lost
    /// and consumed without a delivery attempt.
    backoff_invalid: bool,
    dead_letter: Option<String>,
}

impl CompiledTrigger {
    fn compile(trigger: &Trigger) -> Result<Self, FilterError> {
        let filter = materialize(&trigger.filters)?;

        let mut retry = None;
        let mut backoff_invalid = false;
        if let Some(options) = &trigger.target.delivery_options {
            let retries = options.retry.unwrap_or(0);
            if retries >= 1 {
                if let Some(policy) = options.backoff_policy {
                    match options.backoff_delay.as_deref().map(parse_period) {
                        Some(Ok(delay)) => {
                            retry = Some(RetryPolicy {
                                policy,
                                delay,
                                retries,
                            });
                        }
                        Some(Err(_)) | None => backoff_invalid = true,
                    }
                }
            }
        }

        let dead_letter = trigger
            .target
            .delivery_options
            .as_ref()
            .and_then(|o| o.dead_letter_url.clone())
            .filter(|url| !url.is_empty());

        Ok(Self {
            trigger: trigger.clone(),
            filter,
            retry,
            backoff_invalid,
            dead_letter,
        })
    }
}

/// Runtime object implementing one trigger against the backend.
struct Subscriber {
    name: String,
    client: Arc<dyn DeliveryClient>,
    reply_handler: ReplyHandler,
    compiled: RwLock<Arc<CompiledTrigger>>,
}

impl Subscriber {
    fn new(
        name: &str,
        trigger: &Trigger,
        client: Arc<dyn DeliveryClient>,
        reply_handler: ReplyHandler,
    ) -> Result<Self, FilterError> {
        let compiled = CompiledTrigger::compile(trigger)?;
        Ok(Self {
            name: name.to_string(),
            client,
            reply_handler,
            compiled: RwLock::new(Arc::new(compiled)),
        })
    }

    /// Structural comparison against the currently installed trigger.
    async fn matches(&self, trigger: &Trigger) -> bool {
        self.compiled.read().await.trigger == *trigger
    }

    /// Recompile and atomically publish a changed trigger. The backend
    /// subscription is untouched, preserving the cursor.
    async fn update_trigger(&self, trigger: &Trigger) -> Result<(), FilterError> {
        let compiled = CompiledTrigger::compile(trigger)?;
        *self.compiled.write().await = Arc::new(compiled);
        Ok(())
    }

    /// The dispatch function handed to `Backend::subscribe`. Returning from
    /// it acknowledges the message, so it resolves only on a terminal
    /// outcome.
    fn dispatch_handler(self: &Arc<Self>) -> DispatchHandler {
        let subscriber = Arc::clone(self);
        Arc::new(move |event| {
            let subscriber = Arc::clone(&subscriber);
            Box::pin(async move {
                subscriber.dispatch(event).await;
            })
        })
    }

    async fn dispatch(&self, event: Event) {
        let compiled = Arc::clone(&*self.compiled.read().await);

        if compiled.filter.evaluate(&event) == FilterResult::Fail {
            debug!(
                trigger = %self.name,
                id = %event.id(),
                "skipped delivery due to filter"
            );
            metric_inc("broker.dispatch.filtered");
            return;
        }

        let target = &compiled.trigger.target.url;

        if compiled.backoff_invalid {
            error!(
                lost = true,
                trigger = %self.name,
                r#type = %event.ty(),
                source = %event.source(),
                id = %event.id(),
                "event was lost while sending to {} due to backoff delay parsing",
                target
            );
            metric_inc("broker.dispatch.lost");
            return;
        }

        let ctx = DeliveryContext {
            target: target.clone(),
            retry: compiled.retry.clone(),
        };
        if self.send(&ctx, &event).await {
            metric_inc("broker.dispatch.delivered");
            return;
        }

        let mut last_target = ctx.target;
        if let Some(dead_letter) = &compiled.dead_letter {
            let ctx = DeliveryContext {
                target: dead_letter.clone(),
                retry: compiled.retry.clone(),
            };
            if self.send(&ctx, &event).await {
                metric_inc("broker.dispatch.dead_lettered");
                return;
            }
            last_target = ctx.target;
        }

        // The "lost" attribute lets log aggregators find dropped events.
        error!(
            lost = true,
            trigger = %self.name,
            r#type = %event.ty(),
            source = %event.source(),
            id = %event.id(),
            "event was lost while sending to {}",
            last_target
        );
        metric_inc("broker.dispatch.lost");
    }

    /// One send to one target, reply handling included. True on success.
    async fn send(&self, ctx: &DeliveryContext, event: &Event) -> bool {
        let (reply, result) = self.client.request(ctx, event.clone()).await;

        match result {
            DeliveryResult::Ack => {
                if let Some(reply) = reply {
                    return self.ingest_reply(ctx, reply).await;
                }
                true
            }
            DeliveryResult::Undelivered => {
                error!(
                    target = %ctx.target,
                    r#type = %event.ty(),
                    source = %event.source(),
                    id = %event.id(),
                    "failed to send event"
                );
                false
            }
            DeliveryResult::Nack => {
                error!(
                    target = %ctx.target,
                    r#type = %event.ty(),
                    source = %event.source(),
                    id = %event.id(),
                    "event not accepted at target"
                );
                false
            }
        }
    }

    /// Hand a reply event to the registered sink. Failing to ingest the
    /// reply fails the whole delivery so the dead-letter path runs.
    async fn ingest_reply(&self, ctx: &DeliveryContext, reply: Event) -> bool {
        let handler = self.reply_handler.read().await.clone();
        let Some(handler) = handler else {
            error!(
                target = %ctx.target,
                "no reply handler registered, treating delivery as failed"
            );
            return false;
        };

        if let Err(e) = handler(reply.clone()).await {
            error!(
                target = %ctx.target,
                error = %e,
                r#type = %reply.ty(),
                source = %reply.source(),
                id = %reply.id(),
                "failed to consume response"
            );
            return false;
        }
        true
    }
}
