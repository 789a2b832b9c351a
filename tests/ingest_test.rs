use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use cloudevents::binding::reqwest::RequestBuilderExt;
use cloudevents::{Event, EventBuilder, EventBuilderV10};

use cloudevents_broker::{BrokerConfig, Ingest};

fn test_event(id: &str) -> Event {
    EventBuilderV10::new()
        .id(id)
        .ty("ex.t")
        .source("test/source")
        .build()
        .expect("valid test event")
}

async fn spawn_ingest(ingest: &Ingest) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ingest");
    let addr = listener.local_addr().expect("ingest addr");
    let router = ingest.router();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    addr
}

fn recording_ingest() -> (Ingest, Arc<Mutex<Vec<String>>>) {
    let ingest = Ingest::new("127.0.0.1:0".parse().unwrap());
    let produced: Arc<Mutex<Vec<String>>> = Arc::default();
    (ingest, produced)
}

async fn install_recorder(ingest: &Ingest, produced: Arc<Mutex<Vec<String>>>) {
    use cloudevents::event::AttributesReader;

    ingest
        .register_cloud_event_handler(Arc::new(move |event: Event| {
            let produced = produced.clone();
            Box::pin(async move {
                produced.lock().unwrap().push(event.id().to_string());
                Ok(())
            })
        }))
        .await;
}

#[tokio::test]
async fn test_accepted_event_is_produced() {
    let (ingest, produced) = recording_ingest();
    install_recorder(&ingest, produced.clone()).await;
    let addr = spawn_ingest(&ingest).await;

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/"))
        .event(test_event("evt-1"))
        .expect("encode event")
        .send()
        .await
        .expect("send");

    assert!(response.status().is_success());
    assert_eq!(produced.lock().unwrap().as_slice(), ["evt-1"]);
}

#[tokio::test]
async fn test_no_producer_yields_service_unavailable() {
    let (ingest, _produced) = recording_ingest();
    let addr = spawn_ingest(&ingest).await;

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/"))
        .event(test_event("evt-1"))
        .expect("encode event")
        .send()
        .await
        .expect("send");

    assert_eq!(response.status().as_u16(), 503);
}

#[tokio::test]
async fn test_token_auth_is_enforced_and_hot_swapped() {
    let (ingest, produced) = recording_ingest();
    install_recorder(&ingest, produced.clone()).await;

    let config: BrokerConfig =
        serde_yaml::from_str("ingest:\n  auth:\n    type: token\n    token: s3cr3t\n").unwrap();
    ingest.update_from_config(&config).await;

    let addr = spawn_ingest(&ingest).await;
    let client = reqwest::Client::new();

    let unauthorized = client
        .post(format!("http://{addr}/"))
        .event(test_event("evt-1"))
        .expect("encode event")
        .send()
        .await
        .expect("send");
    assert_eq!(unauthorized.status().as_u16(), 401);

    let authorized = client
        .post(format!("http://{addr}/"))
        .header("Authorization", "Bearer s3cr3t")
        .event(test_event("evt-2"))
        .expect("encode event")
        .send()
        .await
        .expect("send");
    assert!(authorized.status().is_success());

    // Back to open access via a new snapshot.
    ingest.update_from_config(&BrokerConfig::default()).await;
    let open = client
        .post(format!("http://{addr}/"))
        .event(test_event("evt-3"))
        .expect("encode event")
        .send()
        .await
        .expect("send");
    assert!(open.status().is_success());

    assert_eq!(produced.lock().unwrap().as_slice(), ["evt-2", "evt-3"]);
}

#[tokio::test]
async fn test_health_endpoint() {
    let (ingest, _produced) = recording_ingest();
    let addr = spawn_ingest(&ingest).await;

    let response = reqwest::Client::new()
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .expect("send");
    assert!(response.status().is_success());
    let body = response.text().await.expect("body");
    assert!(body.contains("healthy"));
}
