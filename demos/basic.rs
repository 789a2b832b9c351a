use std::sync::Arc;

use cloudevents::{EventBuilder, EventBuilderV10};
use cloudevents_broker::{
    Backend, BackoffPolicy, BrokerConfig, DeliveryOptions, FilterExpr, HttpDeliveryClient,
    Manager, MemoryBackend, Shutdown, Target, Trigger,
};

#[tokio::main]
async fn main() {
    let shutdown = Shutdown::new();
    let backend = Arc::new(MemoryBackend::new());
    let client = Arc::new(HttpDeliveryClient::new(shutdown.clone()));
    let manager = Arc::new(Manager::new(backend.clone(), client));

    // Reply events go straight back into the backend.
    let produce = backend.clone();
    manager
        .register_cloud_event_handler(Arc::new(move |event| {
            let backend = produce.clone();
            Box::pin(async move { backend.produce(event).await })
        }))
        .await;

    let trigger = Trigger::new(
        Target::new("https://example.com/orders").with_delivery_options(
            DeliveryOptions::new()
                .with_retry(3)
                .with_backoff(BackoffPolicy::Constant, "PT1S")
                .with_dead_letter_url("https://example.com/dlq"),
        ),
    )
    .with_filter(FilterExpr::exact("type", "com.example.order.created"));

    let config = BrokerConfig {
        triggers: [("orders".to_string(), trigger)].into(),
        ..Default::default()
    };
    manager.update_from_config(&config).await;

    let event = EventBuilderV10::new()
        .id("evt-1")
        .ty("com.example.order.created")
        .source("example/orders")
        .build()
        .expect("valid event");
    let _ = backend.produce(event).await;

    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    shutdown.initiate();
}
