//! Server-side implementation of the SSE transport
//!
//! This module provides an SSE server that:
//! - Streams broadcast events at `GET /`, resuming after `Last-Event-ID`
//! - Publishes events posted to `POST /` and closes every stream on `DELETE /`
//! - Carries MCP over SSE: `GET /sse` opens a connection whose first event
//!   names its message endpoint, `POST /message?session_id=..` delivers
//!   envelopes, and replies and stream chunks come back on the event stream.
//!   These streams have their own hub and never carry broadcast events.

use async_trait::async_trait;
use axum::{
    Json,
    Router,
    body::Bytes,
    extract::{ Query, State },
    http::{ HeaderMap, HeaderValue, StatusCode, header },
    response::{ IntoResponse, Response, Sse, sse::{ Event, KeepAlive } },
    routing::{ get, post },
};
use futures::StreamExt;
use serde::{ Deserialize, Serialize };
use serde_json::{ Value, json };
use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{ Arc, RwLock };
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{ debug, info, warn };

use crate::errors::Error;
use crate::event_store::EventStore;
use crate::messages::{ Envelope, RequestId };
use crate::protocol::{ LAST_EVENT_ID_HEADER, SESSION_ID_HEADER };
use crate::server::dispatcher::{ Dispatcher, Reply };
use crate::stream::StreamChunk;
use crate::transport::connection::Connection;
use crate::transport::http::{ SESSION_HEADER, cors_layer, error_response, spawn_server, stop_server };
use crate::transport::hub::{ DEFAULT_CLIENT_BUFFER, EventHub, SseEvent, Subscription };
use crate::transport::{ ResponseWriter, Transport };

/// Configuration options for the SSE server
#[derive(Clone)]
pub struct SseServerOptions {
    /// Address to bind the server to
    pub bind_address: String,
    /// Events queued per client before it is disconnected
    pub client_buffer: usize,
    /// Keep-alive interval
    pub keep_alive_interval: Duration,
    /// Require the `Mcp-Session-Id` of a live stream to publish
    pub require_session: bool,
    /// Store for resumable delivery
    pub event_store: Option<Arc<dyn EventStore>>,
    /// CORS allowed origins
    pub allowed_origins: Option<Vec<String>>,
    /// How long shutdown waits for running requests
    pub drain_timeout: Duration,
}

impl Default for SseServerOptions {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8090".to_string(),
            client_buffer: DEFAULT_CLIENT_BUFFER,
            keep_alive_interval: Duration::from_secs(15),
            require_session: false,
            event_store: None,
            allowed_origins: None,
            drain_timeout: Duration::from_secs(5),
        }
    }
}

impl fmt::Debug for SseServerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SseServerOptions")
            .field("bind_address", &self.bind_address)
            .field("client_buffer", &self.client_buffer)
            .field("keep_alive_interval", &self.keep_alive_interval)
            .field("require_session", &self.require_session)
            .field("event_store", &self.event_store.is_some())
            .field("allowed_origins", &self.allowed_origins)
            .field("drain_timeout", &self.drain_timeout)
            .finish()
    }
}

/// What `POST /` answers after publishing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PublishReply {
    /// `200 {"id": ..}`
    Id,
    /// `200 {"status": "ok", "id": ..}`
    Status,
    /// `202 Accepted` without a body
    Accepted,
}

/// State of the broadcast routes shared with the streamable transport
#[derive(Clone)]
pub(crate) struct HubState {
    pub(crate) hub: Arc<EventHub>,
    pub(crate) require_session: bool,
    pub(crate) keep_alive: Duration,
    pub(crate) publish_reply: PublishReply,
}

#[derive(Debug, Deserialize)]
struct PublishRequest {
    #[serde(rename = "type", default = "default_event_type")]
    event_type: String,
    data: Value,
}

fn default_event_type() -> String {
    "message".to_string()
}

/// `GET /`, `POST /` and `DELETE /` over a hub
pub(crate) fn broadcast_routes(state: HubState) -> Router {
    Router::new()
        .route("/", get(handle_subscribe).post(handle_publish).delete(handle_close_all))
        .with_state(state)
}

async fn handle_subscribe(State(state): State<HubState>, headers: HeaderMap) -> Response {
    let last_event_id = headers.get(LAST_EVENT_ID_HEADER).and_then(|v| v.to_str().ok());
    let session_id = uuid::Uuid::new_v4().to_string();
    match state.hub.subscribe(Some(session_id.clone()), last_event_id).await {
        Ok(subscription) =>
            event_stream_response(
                state.hub.clone(),
                subscription,
                None,
                state.keep_alive,
                Some(&session_id),
                || {}
            ),
        Err(e) => error_response(&e),
    }
}

async fn handle_publish(State(state): State<HubState>, headers: HeaderMap, body: Bytes) -> Response {
    if let Err(e) = check_session(&state, &headers) {
        return error_response(&e);
    }
    let request = match serde_json::from_slice::<PublishRequest>(&body) {
        Ok(request) => request,
        Err(e) => {
            return error_response(&Error::Protocol(format!("malformed event: {}", e)));
        }
    };
    let data = match serde_json::to_string(&request.data) {
        Ok(data) => data,
        Err(e) => {
            return error_response(&e.into());
        }
    };
    let id = match state.hub.publish(&request.event_type, data).await {
        Ok(id) => id,
        Err(e) => {
            return error_response(&e);
        }
    };
    debug!(event = %request.event_type, id = ?id, "Event published");

    match state.publish_reply {
        PublishReply::Id => Json(json!({ "id": id })).into_response(),
        PublishReply::Status => Json(json!({ "status": "ok", "id": id })).into_response(),
        PublishReply::Accepted => StatusCode::ACCEPTED.into_response(),
    }
}

async fn handle_close_all(State(state): State<HubState>) -> Response {
    let closed = state.hub.close_all();
    info!("Closed {} event streams", closed);
    Json(json!({ "closed": closed })).into_response()
}

/// Publishing requires the session id of a live stream when configured
fn check_session(state: &HubState, headers: &HeaderMap) -> Result<(), Error> {
    if !state.require_session {
        return Ok(());
    }
    match headers.get(SESSION_ID_HEADER).and_then(|v| v.to_str().ok()) {
        Some(id) if state.hub.has_session(id) => Ok(()),
        Some(id) => Err(Error::SessionExpired(id.to_string())),
        None => Err(Error::Unauthorized("missing session header".to_string())),
    }
}

/// Stream a subscription as `text/event-stream`. The hub client is removed
/// and `on_close` runs when the response body is dropped.
pub(crate) fn event_stream_response<F>(
    hub: Arc<EventHub>,
    subscription: Subscription,
    first: Option<SseEvent>,
    keep_alive: Duration,
    session_id: Option<&str>,
    on_close: F
) -> Response
    where F: FnOnce() + Send + 'static
{
    let client_id = subscription.client_id.clone();
    let mut events = Box::pin(subscription.into_stream());
    let stream =
        async_stream::stream! {
        let _guard = scopeguard::guard((hub, client_id, on_close), |(hub, client_id, on_close)| {
            hub.remove(&client_id);
            on_close();
        });
        if let Some(first) = first {
            yield Ok::<Event, Infallible>(first.to_event());
        }
        while let Some(event) = events.next().await {
            yield Ok::<Event, Infallible>(event.to_event());
        }
    };

    let mut response = Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(keep_alive))
        .into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    if let Some(id) = session_id.and_then(|id| HeaderValue::from_str(id).ok()) {
        headers.insert(SESSION_HEADER, id);
    }
    response
}

type ConnectionMap = RwLock<HashMap<String, Arc<Connection<SseWriter>>>>;

#[derive(Clone)]
struct McpState {
    hub: Arc<EventHub>,
    dispatcher: Arc<Dispatcher>,
    connections: Arc<ConnectionMap>,
    keep_alive: Duration,
}

#[derive(Debug, Deserialize)]
struct MessageQuery {
    session_id: Option<String>,
}

/// Response writer delivering a connection's output on its event stream
struct SseWriter {
    hub: Arc<EventHub>,
    client_id: String,
}

impl SseWriter {
    fn send_envelope(&self, envelope: &Envelope) -> Result<(), Error> {
        let data = serde_json::to_string(envelope)?;
        self.hub.send_to(&self.client_id, SseEvent::new("message", data))
    }
}

#[async_trait]
impl ResponseWriter for SseWriter {
    async fn write_reply(&self, _method: &str, reply: Reply) -> Result<(), Error> {
        self.send_envelope(&reply.into_envelope())
    }

    async fn write_stream_chunk(
        &self,
        id: Option<&RequestId>,
        _method: &str,
        chunk: &StreamChunk
    ) -> Result<(), Error> {
        let data = chunk.to_json_with_id(id)?;
        self.hub.send_to(&self.client_id, SseEvent::new(chunk.type_name(), data))
    }

    async fn write_notification(&self, notification: &Envelope) -> Result<(), Error> {
        self.send_envelope(notification)
    }

    fn supports_streaming(&self) -> bool {
        true
    }
}

async fn handle_mcp_stream(State(state): State<McpState>) -> Response {
    let session_id = uuid::Uuid::new_v4().to_string();
    let subscription = match state.hub.subscribe(Some(session_id.clone()), None).await {
        Ok(subscription) => subscription,
        Err(e) => {
            return error_response(&e);
        }
    };
    info!("New SSE connection: client_id = {}, session_id = {}", subscription.client_id, session_id);

    let writer = Arc::new(SseWriter {
        hub: state.hub.clone(),
        client_id: subscription.client_id.clone(),
    });
    let connection = Connection::new(state.dispatcher.clone(), format!("sse-{}", session_id), writer);
    write_connections(&state.connections).insert(session_id.clone(), Arc::new(connection));

    let endpoint = SseEvent::new("endpoint", format!("/message?session_id={}", session_id));
    let connections = state.connections.clone();
    let closed_id = session_id.clone();
    event_stream_response(
        state.hub.clone(),
        subscription,
        Some(endpoint),
        state.keep_alive,
        Some(&session_id),
        move || {
            if write_connections(&connections).remove(&closed_id).is_some() {
                debug!(session_id = %closed_id, "SSE connection closed");
            }
        }
    )
}

async fn handle_message(
    State(state): State<McpState>,
    Query(query): Query<MessageQuery>,
    body: Bytes
) -> Response {
    let Some(session_id) = query.session_id else {
        return error_response(&Error::Protocol("missing session_id".to_string()));
    };
    let connection = read_connections(&state.connections).get(&session_id).cloned();
    let Some(connection) = connection else {
        return error_response(&Error::SessionExpired(session_id));
    };
    let envelope = match serde_json::from_slice::<Envelope>(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("Failed to parse message: {}", e);
            return error_response(&Error::Protocol(format!("malformed JSON: {}", e)));
        }
    };
    connection.handle(envelope).await;
    StatusCode::ACCEPTED.into_response()
}

fn read_connections(
    connections: &ConnectionMap
) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Connection<SseWriter>>>> {
    connections.read().unwrap_or_else(|p| p.into_inner())
}

fn write_connections(
    connections: &ConnectionMap
) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Connection<SseWriter>>>> {
    connections.write().unwrap_or_else(|p| p.into_inner())
}

/// Server-side implementation of the SSE transport
pub struct SseServerTransport {
    options: SseServerOptions,
    hub: Arc<EventHub>,
    /// MCP connections, kept apart from broadcast subscribers
    mcp_hub: Arc<EventHub>,
    connections: Arc<ConnectionMap>,
    local_addr: Option<SocketAddr>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<Result<(), Error>>>,
}

impl SseServerTransport {
    /// Create a new SSE server transport with the given options
    pub fn new(options: SseServerOptions) -> Self {
        let hub = Arc::new(EventHub::new(options.client_buffer, options.event_store.clone()));
        let mcp_hub = Arc::new(EventHub::new(options.client_buffer, None));
        Self {
            options,
            hub,
            mcp_hub,
            connections: Arc::new(RwLock::new(HashMap::new())),
            local_addr: None,
            shutdown: CancellationToken::new(),
            task: None,
        }
    }

    /// The hub behind `GET /`, for publishing from the application
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

    /// Number of open MCP-over-SSE connections
    pub fn connection_count(&self) -> usize {
        read_connections(&self.connections).len()
    }

    pub fn router(&self, dispatcher: Arc<Dispatcher>) -> Router {
        let broadcast = broadcast_routes(HubState {
            hub: self.hub.clone(),
            require_session: self.options.require_session,
            keep_alive: self.options.keep_alive_interval,
            publish_reply: PublishReply::Id,
        });
        let mcp = Router::new()
            .route("/sse", get(handle_mcp_stream))
            .route("/message", post(handle_message))
            .with_state(McpState {
                hub: self.mcp_hub.clone(),
                dispatcher,
                connections: self.connections.clone(),
                keep_alive: self.options.keep_alive_interval,
            });
        broadcast.merge(mcp).layer(cors_layer(self.options.allowed_origins.as_deref()))
    }
}

#[async_trait]
impl Transport for SseServerTransport {
    async fn start(&mut self, dispatcher: Arc<Dispatcher>) -> Result<(), Error> {
        if self.task.is_some() {
            warn!("SSE server already started");
            return Ok(());
        }
        let router = self.router(dispatcher);
        let (addr, task) = spawn_server(router, &self.options.bind_address, self.shutdown.clone()).await?;
        info!("Starting SSE server on {}", addr);
        self.local_addr = Some(addr);
        self.task = Some(task);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), Error> {
        info!("Closing SSE server transport");
        let connections: Vec<_> = write_connections(&self.connections)
            .drain()
            .map(|(_, c)| c)
            .collect();
        for connection in connections {
            connection.shutdown().await;
        }
        self.hub.close_all();
        self.mcp_hub.close_all();
        stop_server(self.task.take(), &self.shutdown, self.options.drain_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::InMemoryEventStore;
    use crate::server::Server;
    use axum::body::{ Body, to_bytes };
    use axum::http::Request;
    use tower::ServiceExt;

    async fn transport(options: SseServerOptions) -> (SseServerTransport, Router) {
        let server = Server::builder().build().await.unwrap();
        let transport = SseServerTransport::new(options);
        let router = transport.router(server.dispatcher());
        (transport, router)
    }

    fn post(uri: &str, body: &str) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn publish_stores_the_event() {
        let store = Arc::new(InMemoryEventStore::new());
        let (_transport, router) = transport(SseServerOptions {
            event_store: Some(store.clone()),
            ..Default::default()
        }).await;

        let response = router.oneshot(post("/", r#"{"type":"update","data":{"n":1}}"#)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let id = body_json(response).await["id"].as_str().unwrap().to_string();

        let stored = store.get_event(&id).await.unwrap();
        assert_eq!(stored.event_type, "update");
        assert_eq!(stored.data, r#"{"n":1}"#);
    }

    #[tokio::test]
    async fn publishing_requires_a_live_session_when_configured() {
        let (transport, router) = transport(SseServerOptions {
            require_session: true,
            ..Default::default()
        }).await;

        let response = router.clone().oneshot(post("/", r#"{"data":1}"#)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let mut request = post("/", r#"{"data":1}"#);
        request.headers_mut().insert(SESSION_HEADER, HeaderValue::from_static("nope"));
        let response = router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let _subscription = transport.hub().subscribe(Some("live".into()), None).await.unwrap();
        let mut request = post("/", r#"{"data":1}"#);
        request.headers_mut().insert(SESSION_HEADER, HeaderValue::from_static("live"));
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn messages_need_a_known_connection() {
        let (_transport, router) = transport(SseServerOptions::default()).await;

        let response = router.clone().oneshot(post("/message", r#"{"method":"ping"}"#)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = router
            .oneshot(post("/message?session_id=unknown", r#"{"method":"ping"}"#)).await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_closes_every_stream() {
        let (transport, router) = transport(SseServerOptions::default()).await;
        let _a = transport.hub().subscribe(None, None).await.unwrap();
        let _b = transport.hub().subscribe(None, None).await.unwrap();

        let response = router
            .oneshot(Request::delete("/").body(Body::empty()).unwrap()).await
            .unwrap();
        assert_eq!(body_json(response).await, json!({"closed": 2}));
        assert_eq!(transport.hub().client_count(), 0);
    }
}
