//! Streamable HTTP transport
//!
//! A hybrid of the SSE and HTTP transports on one listener: `GET /`
//! subscribes to the event stream, `POST /` publishes, `DELETE /` closes every
//! stream, and the HTTP request/response routes (`POST /mcp`,
//! `POST /<method>`, `GET /health`) carry protocol calls.

use async_trait::async_trait;
use axum::Router;
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{ info, warn };

use crate::errors::Error;
use crate::event_store::EventStore;
use crate::server::dispatcher::Dispatcher;
use crate::transport::http::{
    HttpServerOptions,
    HttpTransport,
    cors_layer,
    spawn_server,
    stop_server,
};
use crate::transport::hub::{ DEFAULT_CLIENT_BUFFER, EventHub };
use crate::transport::sse::{ HubState, PublishReply, broadcast_routes };
use crate::transport::Transport;

/// Options for the streamable HTTP transport
#[derive(Clone)]
pub struct StreamableHttpOptions {
    pub bind_address: String,
    pub client_buffer: usize,
    pub keep_alive_interval: Duration,
    pub require_session: bool,
    pub event_store: Option<Arc<dyn EventStore>>,
    /// Answer `POST /` with `{status, id}` instead of `202 Accepted`
    pub json_response_enabled: bool,
    pub max_body_bytes: usize,
    pub allowed_origins: Option<Vec<String>>,
    pub drain_timeout: Duration,
}

impl Default for StreamableHttpOptions {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8090".to_string(),
            client_buffer: DEFAULT_CLIENT_BUFFER,
            keep_alive_interval: Duration::from_secs(15),
            require_session: false,
            event_store: None,
            json_response_enabled: false,
            max_body_bytes: 4 * 1024 * 1024,
            allowed_origins: None,
            drain_timeout: Duration::from_secs(5),
        }
    }
}

impl fmt::Debug for StreamableHttpOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamableHttpOptions")
            .field("bind_address", &self.bind_address)
            .field("client_buffer", &self.client_buffer)
            .field("require_session", &self.require_session)
            .field("event_store", &self.event_store.is_some())
            .field("json_response_enabled", &self.json_response_enabled)
            .finish_non_exhaustive()
    }
}

pub struct StreamableHttpTransport {
    options: StreamableHttpOptions,
    hub: Arc<EventHub>,
    local_addr: Option<SocketAddr>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<Result<(), Error>>>,
}

impl StreamableHttpTransport {
    pub fn new(options: StreamableHttpOptions) -> Self {
        let hub = Arc::new(EventHub::new(options.client_buffer, options.event_store.clone()));
        Self {
            options,
            hub,
            local_addr: None,
            shutdown: CancellationToken::new(),
            task: None,
        }
    }

    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    /// Broadcast an event to every stream; returns the stored id, if any
    pub async fn publish<T: Serialize>(&self, event_type: &str, data: &T) -> Result<Option<String>, Error> {
        self.hub.publish(event_type, serde_json::to_string(data)?).await
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn router(&self, dispatcher: Arc<Dispatcher>) -> Router {
        let publish_reply = if self.options.json_response_enabled {
            PublishReply::Status
        } else {
            PublishReply::Accepted
        };
        let broadcast = broadcast_routes(HubState {
            hub: self.hub.clone(),
            require_session: self.options.require_session,
            keep_alive: self.options.keep_alive_interval,
            publish_reply,
        }).layer(cors_layer(self.options.allowed_origins.as_deref()));

        let calls = HttpTransport::new(HttpServerOptions {
            bind_address: self.options.bind_address.clone(),
            max_body_bytes: self.options.max_body_bytes,
            require_session: false,
            allowed_origins: self.options.allowed_origins.clone(),
            drain_timeout: self.options.drain_timeout,
        }).router(dispatcher);

        broadcast.merge(calls)
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    async fn start(&mut self, dispatcher: Arc<Dispatcher>) -> Result<(), Error> {
        if self.task.is_some() {
            warn!("Streamable HTTP server already started");
            return Ok(());
        }
        let router = self.router(dispatcher);
        let (addr, task) = spawn_server(router, &self.options.bind_address, self.shutdown.clone()).await?;
        info!("Streamable HTTP server listening on {}", addr);
        self.local_addr = Some(addr);
        self.task = Some(task);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), Error> {
        info!("Closing streamable HTTP transport");
        self.hub.close_all();
        stop_server(self.task.take(), &self.shutdown, self.options.drain_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::InMemoryEventStore;
    use crate::server::Server;
    use axum::body::{ Body, to_bytes };
    use axum::http::{ Request, StatusCode, header };
    use serde_json::{ Value, json };
    use tower::ServiceExt;

    async fn router(options: StreamableHttpOptions) -> Router {
        let server = Server::builder().build().await.unwrap();
        StreamableHttpTransport::new(options).router(server.dispatcher())
    }

    fn post(uri: &str, body: &str) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn publish_is_accepted_by_default() {
        let router = router(StreamableHttpOptions::default()).await;
        let response = router.oneshot(post("/", r#"{"data":{"x":1}}"#)).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn json_responses_carry_status_and_id() {
        let router = router(StreamableHttpOptions {
            json_response_enabled: true,
            event_store: Some(Arc::new(InMemoryEventStore::new())),
            ..Default::default()
        }).await;
        let response = router.oneshot(post("/", r#"{"data":{"x":1}}"#)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "ok");
        assert!(body["id"].is_string());
    }

    #[tokio::test]
    async fn protocol_calls_share_the_listener() {
        let router = router(StreamableHttpOptions::default()).await;
        let response = router.oneshot(post("/ping", "")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(serde_json::from_slice::<Value>(&bytes).unwrap(), json!({"result": {}}));
    }
}
