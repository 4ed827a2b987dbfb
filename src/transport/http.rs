//! HTTP Transport
//!
//! One POST per call. `POST /mcp` carries an envelope, `POST /<method>` carries
//! the parameters with the method taken from the path. Successful calls answer
//! `{"result": ..}`; failures answer `{"error": {code, message}}` with the code
//! as HTTP status. `readResource` answers the raw bytes with their
//! `Content-Type`.
//!
//! Requests are stateless unless they carry an `Mcp-Session-Id` header, which
//! `initialize` returns.

use async_trait::async_trait;
use axum::{
    Router,
    body::{ Body, Bytes },
    extract::{ DefaultBodyLimit, Path, State },
    http::{ HeaderMap, HeaderName, HeaderValue, StatusCode, header },
    response::{ IntoResponse, Response },
    routing::{ get, post },
};
use serde::{ Deserialize, Serialize };
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{ AllowOrigin, Any, CorsLayer };
use tracing::{ debug, error, info, warn };

use crate::errors::Error;
use crate::messages::Envelope;
use crate::protocol::{ Method, SESSION_ID_HEADER };
use crate::server::context::ConnectionState;
use crate::server::dispatcher::{ Dispatcher, Reply, ReplyBody };
use crate::transport::Transport;

/// Session header in its canonical lowercase form, for inserting
pub(crate) const SESSION_HEADER: HeaderName = HeaderName::from_static("mcp-session-id");

/// Configuration options for the HTTP server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpServerOptions {
    /// Address to bind the server to; port 0 picks a free port
    pub bind_address: String,
    /// Largest accepted request body
    pub max_body_bytes: usize,
    /// Reject requests other than `initialize` without a session header
    pub require_session: bool,
    /// CORS allowed origins, any when absent
    pub allowed_origins: Option<Vec<String>>,
    /// How long shutdown waits for running requests
    pub drain_timeout: Duration,
}

impl Default for HttpServerOptions {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8080".to_string(),
            max_body_bytes: 4 * 1024 * 1024,
            require_session: false,
            allowed_origins: None,
            drain_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Clone)]
struct AppState {
    dispatcher: Arc<Dispatcher>,
    require_session: bool,
}

/// HTTP request/response transport
pub struct HttpTransport {
    options: HttpServerOptions,
    local_addr: Option<SocketAddr>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<Result<(), Error>>>,
}

impl HttpTransport {
    pub fn new(options: HttpServerOptions) -> Self {
        Self {
            options,
            local_addr: None,
            shutdown: CancellationToken::new(),
            task: None,
        }
    }

    /// Address the server is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// The routes of this transport, for mounting into another router
    pub fn router(&self, dispatcher: Arc<Dispatcher>) -> Router {
        let state = AppState {
            dispatcher,
            require_session: self.options.require_session,
        };
        Router::new()
            .route("/health", get(health))
            .route("/mcp", post(handle_envelope))
            .route("/{method}", post(handle_method))
            .layer(DefaultBodyLimit::max(self.options.max_body_bytes))
            .layer(cors_layer(self.options.allowed_origins.as_deref()))
            .with_state(state)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn start(&mut self, dispatcher: Arc<Dispatcher>) -> Result<(), Error> {
        if self.task.is_some() {
            warn!("HTTP server already started");
            return Ok(());
        }
        let router = self.router(dispatcher);
        let (addr, task) = spawn_server(router, &self.options.bind_address, self.shutdown.clone()).await?;
        info!("HTTP server listening on {}", addr);
        self.local_addr = Some(addr);
        self.task = Some(task);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), Error> {
        info!("Closing HTTP server transport");
        stop_server(self.task.take(), &self.shutdown, self.options.drain_timeout).await
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn handle_envelope(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    match serde_json::from_slice::<Envelope>(&body) {
        Ok(envelope) => dispatch(&state, &headers, envelope).await,
        Err(e) => {
            debug!("Malformed request body: {}", e);
            error_response(&Error::Protocol(format!("malformed JSON: {}", e)))
        }
    }
}

async fn handle_method(
    State(state): State<AppState>,
    Path(method): Path<String>,
    headers: HeaderMap,
    body: Bytes
) -> Response {
    let params = if body.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        match serde_json::from_slice::<Value>(&body) {
            Ok(params) => Some(params),
            Err(e) => {
                return error_response(&Error::Protocol(format!("malformed JSON: {}", e)));
            }
        }
    };
    dispatch(&state, &headers, Envelope::request(None, method, params)).await
}

async fn dispatch(state: &AppState, headers: &HeaderMap, envelope: Envelope) -> Response {
    let method = envelope.method.as_deref().and_then(Method::parse);
    let connection_id = format!("http-{}", uuid::Uuid::new_v4());
    let options = state.dispatcher.connection_options();

    let session_id = headers.get(SESSION_ID_HEADER).and_then(|v| v.to_str().ok());
    let connection = match session_id {
        Some(id) =>
            match state.dispatcher.sessions().get(id) {
                Ok(session) => ConnectionState::resume(connection_id, session),
                Err(e) => {
                    return error_response(&e);
                }
            }
        None if state.require_session && method != Some(Method::Initialize) => {
            return error_response(&Error::NotInitialized);
        }
        None => ConnectionState::stateless(connection_id),
    }.with_request_timeout(options.request_timeout);

    let notification = method.is_some_and(|m| m.is_notification());
    match state.dispatcher.dispatch(&connection, envelope, None).await {
        Some(reply) => reply_response(reply),
        None if notification => StatusCode::ACCEPTED.into_response(),
        None => error_response(&Error::Cancelled("request cancelled".to_string())),
    }
}

fn reply_response(reply: Reply) -> Response {
    let status = match &reply.body {
        ReplyBody::Error(data) => status_for(data.code),
        _ => StatusCode::OK,
    };
    if let ReplyBody::Resource(content) = reply.body {
        return (
            [(header::CONTENT_TYPE, content.mime_type.clone())],
            Body::from(content.bytes),
        ).into_response();
    }

    let session_id = match &reply.body {
        ReplyBody::Result(result) => result.get("sessionId").and_then(Value::as_str).map(str::to_string),
        _ => None,
    };
    let mut response = json_response(status, &reply.into_envelope());
    if let Some(id) = session_id.and_then(|id| HeaderValue::from_str(&id).ok()) {
        response.headers_mut().insert(SESSION_HEADER, id);
    }
    response
}

pub(crate) fn error_response(error: &Error) -> Response {
    json_response(status_for(error.code()), &Envelope::failure(None, error))
}

pub(crate) fn json_response(status: StatusCode, envelope: &Envelope) -> Response {
    match serde_json::to_vec(envelope) {
        Ok(body) => (status, [(header::CONTENT_TYPE, "application/json")], body).into_response(),
        Err(e) => {
            error!("Failed to encode response: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// HTTP status for an error code; codes outside the status range map to 500
pub(crate) fn status_for(code: i32) -> StatusCode {
    u16::try_from(code)
        .ok()
        .filter(|c| (100..=599).contains(c))
        .and_then(|c| StatusCode::from_u16(c).ok())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

/// CORS for the given origins, or any origin
pub(crate) fn cors_layer(allowed_origins: Option<&[String]>) -> CorsLayer {
    let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    match allowed_origins {
        Some(origins) => {
            let origins: Vec<HeaderValue> = origins
                .iter()
                .filter_map(|o| HeaderValue::from_str(o).ok())
                .collect();
            cors.allow_origin(AllowOrigin::list(origins))
        }
        None => cors.allow_origin(Any),
    }
}

/// Bind `bind_address` and serve `router` until `shutdown` fires
pub(crate) async fn spawn_server(
    router: Router,
    bind_address: &str,
    shutdown: CancellationToken
) -> Result<(SocketAddr, JoinHandle<Result<(), Error>>), Error> {
    let listener = tokio::net::TcpListener
        ::bind(bind_address).await
        .map_err(|e| Error::Transport(format!("Failed to bind to {}: {}", bind_address, e)))?;
    let addr = listener.local_addr()?;
    let task = tokio::spawn(async move {
        axum
            ::serve(listener, router.into_make_service())
            .with_graceful_shutdown(async move { shutdown.cancelled().await }).await
            .map_err(|e| Error::Transport(format!("Server error: {}", e)))
    });
    Ok((addr, task))
}

/// Trigger graceful shutdown and wait up to `drain` for open requests
pub(crate) async fn stop_server(
    task: Option<JoinHandle<Result<(), Error>>>,
    shutdown: &CancellationToken,
    drain: Duration
) -> Result<(), Error> {
    shutdown.cancel();
    let Some(mut task) = task else {
        return Ok(());
    };
    match tokio::time::timeout(drain, &mut task).await {
        Ok(joined) => joined.map_err(|e| Error::Transport(e.to_string()))?,
        Err(_) => {
            warn!("Drain timeout elapsed, dropping open connections");
            task.abort();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_map_to_statuses() {
        assert_eq!(status_for(404), StatusCode::NOT_FOUND);
        assert_eq!(status_for(418), StatusCode::IM_A_TEAPOT);
        assert_eq!(status_for(499).as_u16(), 499);
        assert_eq!(status_for(-32601), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(status_for(700), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
