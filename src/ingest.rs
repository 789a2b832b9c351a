//! HTTP ingest of CloudEvents.
//!
//! Accepts CloudEvents in binary or structured mode on `POST /` (wire
//! parsing is the SDK extractor's job) and hands accepted events to the
//! registered producer callback, normally `Backend::produce`. A successful
//! produce is the only thing that yields a 2xx, so acceptance implies the
//! event is durably queued. Authentication parameters are reconfigurable
//! through the config watcher.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use cloudevents::event::AttributesReader;
use cloudevents::Event;
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::backend::CloudEventHandler;
use crate::shutdown::Shutdown;
use crate::types::{BrokerConfig, IngestAuth};

/// Errors that prevent the ingest server from running.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("could not bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// HTTP ingest server.
pub struct Ingest {
    addr: SocketAddr,
    state: Arc<IngestState>,
}

struct IngestState {
    producer: tokio::sync::RwLock<Option<CloudEventHandler>>,
    auth: tokio::sync::RwLock<IngestAuth>,
}

impl Ingest {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            state: Arc::new(IngestState {
                producer: tokio::sync::RwLock::new(None),
                auth: tokio::sync::RwLock::new(IngestAuth::None),
            }),
        }
    }

    /// Register the producer callback invoked for every accepted event.
    pub async fn register_cloud_event_handler(&self, handler: CloudEventHandler) {
        *self.state.producer.write().await = Some(handler);
    }

    /// Apply the ingest section of a configuration snapshot.
    pub async fn update_from_config(&self, config: &BrokerConfig) {
        let mut auth = self.state.auth.write().await;
        if *auth != config.ingest.auth {
            info!("updating ingest authentication parameters");
            *auth = config.ingest.auth.clone();
        }
    }

    /// The axum router. Exposed for in-process testing.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", post(ingest_event))
            .route("/health", get(health))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serve until shutdown. New requests stop being accepted on
    /// cancellation; in-flight requests drain.
    pub async fn start(&self, shutdown: Shutdown) -> Result<(), IngestError> {
        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|source| IngestError::Bind {
                addr: self.addr,
                source,
            })?;
        info!(addr = %self.addr, "ingest server listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        Ok(())
    }
}

async fn ingest_event(
    State(state): State<Arc<IngestState>>,
    headers: HeaderMap,
    event: Event,
) -> StatusCode {
    let auth = state.auth.read().await.clone();
    if !authorized(&auth, &headers) {
        return StatusCode::UNAUTHORIZED;
    }

    let producer = state.producer.read().await.clone();
    let Some(producer) = producer else {
        error!("no event producer registered at ingest");
        return StatusCode::SERVICE_UNAVAILABLE;
    };

    debug!(
        r#type = %event.ty(),
        source = %event.source(),
        id = %event.id(),
        "event received at ingest"
    );

    match producer(event).await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            error!(error = %e, "could not produce ingested event");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn authorized(auth: &IngestAuth, headers: &HeaderMap) -> bool {
    let expected = match auth {
        IngestAuth::None => return true,
        IngestAuth::Token { token } => format!("Bearer {token}"),
        IngestAuth::Basic { username, password } => {
            format!("Basic {}", BASE64.encode(format!("{username}:{password}")))
        }
    };

    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|header| header == expected)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with_auth(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_no_auth_accepts_everything() {
        assert!(authorized(&IngestAuth::None, &HeaderMap::new()));
    }

    #[test]
    fn test_token_auth() {
        let auth = IngestAuth::Token {
            token: "s3cr3t".to_string(),
        };
        assert!(authorized(&auth, &headers_with_auth("Bearer s3cr3t")));
        assert!(!authorized(&auth, &headers_with_auth("Bearer wrong")));
        assert!(!authorized(&auth, &HeaderMap::new()));
    }

    #[test]
    fn test_basic_auth() {
        let auth = IngestAuth::Basic {
            username: "user".to_string(),
            password: "pass".to_string(),
        };
        // "user:pass" -> dXNlcjpwYXNz
        assert!(authorized(&auth, &headers_with_auth("Basic dXNlcjpwYXNz")));
        assert!(!authorized(&auth, &headers_with_auth("Basic dXNlcjpub3Bl")));
    }

    #[tokio::test]
    async fn test_update_from_config_swaps_auth() {
        let ingest = Ingest::new("127.0.0.1:0".parse().unwrap());
        let config: BrokerConfig = serde_yaml::from_str(
            "ingest:\n  auth:\n    type: token\n    token: abc\n",
        )
        .unwrap();
        ingest.update_from_config(&config).await;
        assert_eq!(
            *ingest.state.auth.read().await,
            IngestAuth::Token {
                token: "abc".to_string()
            }
        );
    }
}
