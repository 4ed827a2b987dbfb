//! Request dispatcher
//!
//! The dispatcher turns one decoded [`Envelope`] into at most one [`Reply`].
//! It validates the method, enforces the session lifecycle, looks the handler
//! up, runs it under the request's cancellation token and deadline with panic
//! recovery, and coerces whatever came back into the wire form. Notifications
//! (`initialized`, `cancel`) are recognized by name and never produce a reply.
//!
//! Transports own framing and writing; the dispatcher never touches a socket.

use futures::FutureExt;
use serde_json::{ Value, json };
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{ Instrument, debug, error, info_span, warn };

use crate::errors::{ Error, ErrorData };
use crate::messages::{ Envelope, RequestId };
use crate::protocol::Method;
use crate::server::context::{ ConnectionState, RequestContext };
use crate::server::handlers::{ HandlerOutput, HandlerTable };
use crate::server::middleware::RateLimiter;
use crate::server::session::{ SessionManager, SessionState };
use crate::stream::StreamWriter;
use crate::transport::connection::ConnectionOptions;
use crate::types::{
    CancelParams,
    Implementation,
    InitializeParams,
    InitializeResult,
    ResourceContent,
    ServerCapabilities,
};

/// Body of a reply
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyBody {
    /// JSON result
    Result(Value),
    /// Structured failure
    Error(ErrorData),
    /// Raw bytes from `readResource`
    Resource(ResourceContent),
}

/// The single answer to one request
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// Id of the request, echoed back
    pub id: Option<RequestId>,
    pub body: ReplyBody,
}

impl Reply {
    pub fn result(id: Option<RequestId>, result: Value) -> Self {
        Self { id, body: ReplyBody::Result(result) }
    }

    pub fn error(id: Option<RequestId>, error: &Error) -> Self {
        Self { id, body: ReplyBody::Error(error.to_error_data()) }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.body, ReplyBody::Error(_))
    }

    /// Error code of a failed reply
    pub fn error_code(&self) -> Option<i32> {
        match &self.body {
            ReplyBody::Error(data) => Some(data.code),
            _ => None,
        }
    }

    /// Envelope form for framed transports; resource bytes travel as a
    /// base64 resource chunk
    pub fn into_envelope(self) -> Envelope {
        match self.body {
            ReplyBody::Result(result) => Envelope::success(self.id, result),
            ReplyBody::Resource(content) => Envelope::success(self.id, content.to_chunk()),
            ReplyBody::Error(data) =>
                Envelope {
                    id: self.id,
                    error: Some(data),
                    ..Default::default()
                },
        }
    }
}

/// Static server identity returned by `initialize`
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub implementation: Implementation,
    pub capabilities: ServerCapabilities,
    pub instructions: Option<String>,
    pub protocol_version: String,
}

/// Routes envelopes to the handler table
pub struct Dispatcher {
    handlers: Arc<HandlerTable>,
    sessions: Arc<SessionManager>,
    info: ServerInfo,
    rate_limiter: Option<RateLimiter>,
    connection_options: ConnectionOptions,
}

impl Dispatcher {
    pub fn new(handlers: Arc<HandlerTable>, sessions: Arc<SessionManager>, info: ServerInfo) -> Self {
        Self {
            handlers,
            sessions,
            info,
            rate_limiter: None,
            connection_options: ConnectionOptions::default(),
        }
    }

    /// Defaults transports apply to the connections they open
    pub fn with_connection_options(mut self, options: ConnectionOptions) -> Self {
        self.connection_options = options;
        self
    }

    pub fn connection_options(&self) -> &ConnectionOptions {
        &self.connection_options
    }

    /// Reject requests with 429 once the bucket is empty
    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn handlers(&self) -> &Arc<HandlerTable> {
        &self.handlers
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn info(&self) -> &ServerInfo {
        &self.info
    }

    /// Handle one envelope received on `connection`. Returns the reply to
    /// write, or `None` for notifications, stray responses and cancelled
    /// requests. `stream` is the pipe the transport reads chunks from, when
    /// it can carry them.
    pub async fn dispatch(
        &self,
        connection: &ConnectionState,
        envelope: Envelope,
        stream: Option<Arc<StreamWriter>>
    ) -> Option<Reply> {
        if envelope.is_response() {
            debug!(connection = %connection.id(), "Ignoring response-shaped envelope");
            return None;
        }
        let Envelope { id, method, params, .. } = envelope;
        let Some(method) = method else {
            return Some(Reply::error(id, &Error::Protocol("missing method".to_string())));
        };
        let params = params.unwrap_or_else(|| json!({}));

        let span = info_span!(
            "request",
            method = %method,
            request_id = ?id,
            connection = %connection.id()
        );

        match Method::parse(&method) {
            Some(known) if known.is_notification() => {
                self.notification(connection, known, params).instrument(span).await;
                None
            }
            known => self.request(connection, id, method, known, params, stream).instrument(span).await,
        }
    }

    async fn notification(&self, connection: &ConnectionState, method: Method, params: Value) {
        match method {
            Method::Cancel => {
                match serde_json::from_value::<CancelParams>(params) {
                    Ok(cancel) => {
                        if connection.in_flight().cancel(&cancel.id) {
                            debug!(id = %cancel.id, "Cancelled request");
                        } else {
                            debug!(id = %cancel.id, "Cancel for unknown request");
                        }
                    }
                    Err(e) => warn!("Malformed cancel notification: {}", e),
                }
            }
            Method::Initialized => {
                match connection.session() {
                    Some(session) => {
                        if let Err(e) = session.write().mark_ready() {
                            warn!("Unexpected initialized notification: {}", e);
                            return;
                        }
                    }
                    None => {
                        if connection.enforces_initialize() {
                            warn!("initialized notification without a session");
                            return;
                        }
                    }
                }
                if let Some(hook) = self.handlers.get(method.as_str()) {
                    let ctx = RequestContext::new(
                        None,
                        method.as_str(),
                        connection.session(),
                        connection.cancellation_token().child_token(),
                        None
                    ).with_connection(connection, None);
                    match AssertUnwindSafe(hook.handle(ctx, params)).catch_unwind().await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => warn!("initialized handler failed: {}", e),
                        Err(_) => error!("initialized handler panicked"),
                    }
                }
            }
            other => debug!(method = %other, "Unhandled notification"),
        }
    }

    async fn request(
        &self,
        connection: &ConnectionState,
        id: Option<RequestId>,
        method: String,
        known: Option<Method>,
        params: Value,
        stream: Option<Arc<StreamWriter>>
    ) -> Option<Reply> {
        if let Some(limiter) = &self.rate_limiter {
            if let Err(e) = limiter.try_acquire() {
                return Some(Reply::error(id, &e));
            }
        }

        if let Err(e) = self.check_session(connection, known) {
            debug!("Rejected before dispatch: {}", e);
            return Some(Reply::error(id, &e));
        }

        let registered = id
            .as_ref()
            .map(|request_id| connection.in_flight().register(request_id, connection.cancellation_token()));
        let guard = match registered {
            Some(Ok(guard)) => Some(guard),
            Some(Err(e)) => {
                return Some(Reply::error(id, &e));
            }
            None => None,
        };
        let token = match &guard {
            Some(guard) => guard.token(),
            None => connection.cancellation_token().child_token(),
        };

        if known == Some(Method::Initialize) {
            let result = self.initialize(connection, params);
            return Some(match result {
                Ok(value) => Reply::result(id, value),
                Err(e) => Reply::error(id, &e),
            });
        }

        let Some(handler) = self.handlers.get(&method) else {
            if known == Some(Method::Ping) {
                return Some(Reply::result(id, json!({})));
            }
            return Some(Reply::error(id, &Error::HandlerNotRegistered(method)));
        };

        let deadline = connection.request_timeout().map(|timeout| Instant::now() + timeout);
        let ctx = RequestContext::new(
            id.clone(),
            method.as_str(),
            connection.session(),
            token.clone(),
            deadline
        ).with_connection(connection, stream);

        let call = AssertUnwindSafe(handler.handle(ctx.clone(), params)).catch_unwind();
        let outcome = tokio::select! {
            _ = token.cancelled() => None,
            outcome = async {
                match deadline {
                    Some(deadline) => tokio::time::timeout_at(deadline, call).await.ok(),
                    None => Some(call.await),
                }
            } => Some(outcome),
        };
        ctx.flush_forwarders().await;
        drop(guard);

        let result = match outcome {
            None => {
                debug!("Request cancelled, no reply");
                return None;
            }
            Some(None) => {
                token.cancel();
                Err(Error::Timeout(format!("{} exceeded its deadline", method)))
            }
            Some(Some(Err(_panic))) => {
                error!("Handler panicked");
                Err(Error::Other("internal error".to_string()))
            }
            Some(Some(Ok(result))) => result,
        };

        Some(match result {
            Ok(HandlerOutput::Json(value)) => Reply::result(id, value),
            Ok(HandlerOutput::Resource(content)) => Reply { id, body: ReplyBody::Resource(content) },
            Err(e) => {
                debug!(code = e.code(), "Handler failed: {}", e);
                Reply::error(id, &e)
            }
        })
    }

    /// Methods other than `initialize`, `ping` and `cancel` need an
    /// initialized, unexpired session on connections that enforce it
    fn check_session(&self, connection: &ConnectionState, known: Option<Method>) -> Result<(), Error> {
        if !connection.enforces_initialize() || known.is_some_and(|m| m.allowed_before_initialize()) {
            return Ok(());
        }
        let session = connection.session().ok_or(Error::NotInitialized)?;
        let session = session.read();
        if session.is_expired() {
            return Err(Error::SessionExpired(session.id().to_string()));
        }
        if session.state() != SessionState::Initialized {
            return Err(Error::NotInitialized);
        }
        Ok(())
    }

    fn initialize(&self, connection: &ConnectionState, params: Value) -> Result<Value, Error> {
        if connection.session().is_some() {
            return Err(Error::AlreadyInitialized);
        }
        let params: InitializeParams = serde_json
            ::from_value(params)
            .map_err(|e| Error::InvalidParams(e.to_string()))?;

        let session = self.sessions.create(connection.in_flight().clone());
        {
            let mut session = session.write();
            session.begin_initialize(&params)?;
            session.finish_initialize()?;
        }
        connection.bind_session(session.clone())?;
        let session_id = session.id();
        self.sessions.insert(session);

        if params.protocol_version != self.info.protocol_version {
            warn!(
                client = %params.protocol_version,
                server = %self.info.protocol_version,
                "Protocol version mismatch"
            );
        }

        let result = InitializeResult {
            protocol_version: self.info.protocol_version.clone(),
            server_info: self.info.implementation.clone(),
            capabilities: self.info.capabilities.clone(),
            instructions: self.info.instructions.clone(),
            session_id: Some(session_id),
        };
        Ok(serde_json::to_value(result)?)
    }
}
