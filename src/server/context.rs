//! Request and connection context
//!
//! [`ConnectionState`] is what a transport keeps for one connection: its
//! session slot, its cancellation token and the set of in-flight requests.
//! [`RequestContext`] is what a handler receives for one request.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{ Arc, Mutex };
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{ debug, warn };
use futures::StreamExt;

use crate::errors::Error;
use crate::messages::{ Envelope, RequestId };
use crate::progress::ProgressTracker;
use crate::protocol::PROGRESS_NOTIFICATION;
use crate::server::session::{ SessionHandle, SessionState };
use crate::stream::StreamWriter;

/// Cancellation tokens of the requests currently running on one connection,
/// keyed by the string form of their id
#[derive(Debug, Default)]
pub struct InFlight {
    requests: Mutex<HashMap<String, CancellationToken>>,
}

impl InFlight {
    /// Track a request; a second request with the same id is a conflict
    pub fn register(
        self: &Arc<Self>,
        id: &RequestId,
        parent: &CancellationToken
    ) -> Result<InFlightGuard, Error> {
        let key = id.key();
        let mut requests = self.lock();
        if requests.contains_key(&key) {
            return Err(Error::Conflict(format!("request id {} is already in flight", key)));
        }
        let token = parent.child_token();
        requests.insert(key.clone(), token.clone());
        Ok(InFlightGuard {
            set: self.clone(),
            key,
            token,
        })
    }

    /// Signal the matching request; returns whether one was found
    pub fn cancel(&self, id: &RequestId) -> bool {
        match self.lock().get(&id.key()) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.requests.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Removes a request from its in-flight set when dropped
pub struct InFlightGuard {
    set: Arc<InFlight>,
    key: String,
    token: CancellationToken,
}

impl InFlightGuard {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.lock().remove(&self.key);
    }
}

/// Per-connection state shared by every request on the connection
pub struct ConnectionState {
    id: String,
    session: Mutex<Option<SessionHandle>>,
    in_flight: Arc<InFlight>,
    cancel: CancellationToken,
    enforce_initialize: bool,
    gate_notifications: bool,
    request_timeout: Option<Duration>,
    outbound: Option<mpsc::Sender<Envelope>>,
}

impl ConnectionState {
    /// State for a stateful connection (stdio, WebSocket, SSE): methods other
    /// than `initialize` and `ping` require an initialized session
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            session: Mutex::new(None),
            in_flight: Arc::new(InFlight::default()),
            cancel: CancellationToken::new(),
            enforce_initialize: true,
            gate_notifications: false,
            request_timeout: None,
            outbound: None,
        }
    }

    /// State for one stateless request (HTTP without a session header)
    pub fn stateless(id: impl Into<String>) -> Self {
        Self {
            enforce_initialize: false,
            ..Self::new(id)
        }
    }

    /// State resuming an existing session (HTTP with a session header)
    pub fn resume(id: impl Into<String>, session: SessionHandle) -> Self {
        let in_flight = session.read().in_flight();
        Self {
            session: Mutex::new(Some(session)),
            in_flight,
            ..Self::new(id)
        }
    }

    /// Deliver server-initiated notifications through `outbound`
    pub fn with_outbound(mut self, outbound: mpsc::Sender<Envelope>) -> Self {
        self.outbound = Some(outbound);
        self
    }

    /// Drop notifications to the client until it sent `initialized`
    pub fn with_gated_notifications(mut self, gate: bool) -> Self {
        self.gate_notifications = gate;
        self
    }

    /// Deadline applied to every request on this connection
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session(&self) -> Option<SessionHandle> {
        self.session
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Attach the session created by `initialize`; a connection holds at most one
    pub(crate) fn bind_session(&self, session: SessionHandle) -> Result<(), Error> {
        let mut slot = self.session.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_some() {
            return Err(Error::AlreadyInitialized);
        }
        *slot = Some(session);
        Ok(())
    }

    pub(crate) fn take_session(&self) -> Option<SessionHandle> {
        self.session
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
    }

    pub fn in_flight(&self) -> &Arc<InFlight> {
        &self.in_flight
    }

    pub fn enforces_initialize(&self) -> bool {
        self.enforce_initialize
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    pub(crate) fn outbound(&self) -> Option<mpsc::Sender<Envelope>> {
        self.outbound.clone()
    }

    pub(crate) fn gates_notifications(&self) -> bool {
        self.gate_notifications
    }

    /// Token cancelled when the connection goes away
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel every in-flight request of this connection
    pub fn cancel_all(&self) {
        self.cancel.cancel();
    }
}

struct ContextInner {
    request_id: Option<RequestId>,
    method: String,
    session: Option<SessionHandle>,
    cancel: CancellationToken,
    deadline: Option<Instant>,
    stream: Option<Arc<StreamWriter>>,
    outbound: Option<mpsc::Sender<Envelope>>,
    gate_notifications: bool,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

/// Request-scoped context handed to every handler
#[derive(Clone)]
pub struct RequestContext {
    inner: Arc<ContextInner>,
}

impl RequestContext {
    pub(crate) fn new(
        request_id: Option<RequestId>,
        method: impl Into<String>,
        session: Option<SessionHandle>,
        cancel: CancellationToken,
        deadline: Option<Instant>
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                request_id,
                method: method.into(),
                session,
                cancel,
                deadline,
                stream: None,
                outbound: None,
                gate_notifications: false,
                forwarders: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Context detached from any connection, for calling handlers directly
    pub fn detached(method: impl Into<String>) -> Self {
        Self::new(None, method, None, CancellationToken::new(), None)
    }

    pub(crate) fn with_connection(
        mut self,
        connection: &ConnectionState,
        stream: Option<Arc<StreamWriter>>
    ) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.stream = stream;
            inner.outbound = connection.outbound();
            inner.gate_notifications = connection.gates_notifications();
        }
        self
    }

    /// Id of the request, absent for requests sent without one
    pub fn request_id(&self) -> Option<&RequestId> {
        self.inner.request_id.as_ref()
    }

    pub fn method(&self) -> &str {
        &self.inner.method
    }

    /// Session the request runs in, if any
    pub fn session(&self) -> Option<&SessionHandle> {
        self.inner.session.as_ref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Resolves when the client cancels the request or the connection drops
    pub async fn cancelled(&self) {
        self.inner.cancel.cancelled().await
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Deadline imposed by the transport
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Stream pipe of the request, on transports that expose one
    pub fn stream(&self) -> Option<&StreamWriter> {
        self.inner.stream.as_deref()
    }

    /// Check a client capability against the session
    pub fn client_supports(&self, required: &Value) -> bool {
        self.session().is_some_and(|s| s.read().check_client_capability(required))
    }

    /// Start a progress tracker scoped to this request. Every snapshot is
    /// forwarded as a stream chunk when the request has a stream pipe, or as
    /// a `progress` notification when the connection can carry one.
    pub fn progress(&self, message: impl Into<String>) -> Result<ProgressTracker, Error> {
        let tracker = ProgressTracker::with_buffer(256);
        let mut snapshots = Box::pin(tracker.subscribe());
        let ctx = self.clone();
        let handle = tokio::spawn(async move {
            while let Some(progress) = snapshots.next().await {
                let sent = match ctx.inner.stream.as_ref() {
                    Some(stream) => stream.write_progress(progress).await,
                    None => {
                        let params = serde_json::json!({
                            "id": ctx.request_id(),
                            "progress": progress,
                        });
                        ctx.notify(PROGRESS_NOTIFICATION, Some(params)).await
                    }
                };
                if let Err(e) = sent {
                    debug!("Progress forwarding stopped: {}", e);
                    break;
                }
            }
        });
        self.inner.forwarders
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(handle);
        tracker.start(message)?;
        Ok(tracker)
    }

    /// Send a notification to the client. When notifications are gated, the
    /// client must have sent `initialized` first.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), Error> {
        let Some(outbound) = &self.inner.outbound else {
            debug!(method, "Transport cannot carry notifications; dropped");
            return Ok(());
        };
        if self.inner.gate_notifications {
            let ready = self.session().is_some_and(|s| {
                let session = s.read();
                session.state() == SessionState::Initialized && session.is_ready()
            });
            if !ready {
                return Err(Error::NotInitialized);
            }
        }
        outbound
            .send(Envelope::notification(method, params)).await
            .map_err(|_| Error::Transport("connection closed".to_string()))
    }

    /// Wait for progress forwarders to flush once the handler returned
    pub(crate) async fn flush_forwarders(&self) {
        let handles: Vec<_> = self.inner.forwarders
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            if tokio::time::timeout(Duration::from_secs(1), handle).await.is_err() {
                warn!(method = %self.inner.method, "Progress forwarder outlived its handler");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{ StreamChunk, StreamPipe };

    #[test]
    fn duplicate_in_flight_ids_conflict() {
        let set = Arc::new(InFlight::default());
        let parent = CancellationToken::new();
        let guard = set.register(&RequestId::from(1), &parent).unwrap();
        let err = set.register(&RequestId::from("1"), &parent).err().unwrap();
        assert_eq!(err.code(), 409);
        drop(guard);
        assert!(set.is_empty());
        assert!(set.register(&RequestId::from(1), &parent).is_ok());
    }

    #[test]
    fn cancel_matches_string_form_of_id() {
        let set = Arc::new(InFlight::default());
        let parent = CancellationToken::new();
        let guard = set.register(&RequestId::from(5), &parent).unwrap();
        assert!(set.cancel(&RequestId::from("5")));
        assert!(guard.token().is_cancelled());
        assert!(!set.cancel(&RequestId::from("6")));
    }

    #[test]
    fn connection_cancel_reaches_requests() {
        let conn = ConnectionState::new("c1");
        let guard = conn.in_flight().register(&RequestId::from(1), conn.cancellation_token()).unwrap();
        conn.cancel_all();
        assert!(guard.token().is_cancelled());
    }

    #[tokio::test]
    async fn progress_is_forwarded_into_the_stream() {
        let (writer, mut reader) = StreamPipe::new(16);
        let writer = Arc::new(writer);
        let conn = ConnectionState::new("c1");
        let ctx = RequestContext::detached("callTool").with_connection(&conn, Some(writer.clone()));

        let tracker = ctx.progress("go").unwrap();
        tracker.update(50.0, "half").unwrap();
        tracker.complete("done").unwrap();
        drop(tracker);
        ctx.flush_forwarders().await;
        writer.close().await.unwrap();

        let mut percentages = Vec::new();
        while let Ok(chunk) = reader.recv().await {
            if let StreamChunk::Progress { progress } = chunk {
                percentages.push(progress.percentage);
            }
        }
        assert_eq!(percentages, vec![0.0, 50.0, 100.0]);
    }

    #[tokio::test]
    async fn gated_notifications_require_ready_session() {
        let (tx, mut rx) = mpsc::channel(4);
        let conn = ConnectionState::new("c1").with_outbound(tx).with_gated_notifications(true);
        let ctx = RequestContext::detached("callTool").with_connection(&conn, None);
        let err = ctx.notify("log", None).await.unwrap_err();
        assert_eq!(err.code(), 400);
        assert!(rx.try_recv().is_err());
    }
}
