//! Connection driver
//!
//! [`Connection`] decorates the dispatcher for one connection: it runs each
//! request on its own task (or on a FIFO worker in sequential mode), wires up
//! the request's stream pipe and notification channel, and hands every reply
//! to the transport's [`ResponseWriter`]. `cancel` and `initialized` are
//! handled inline so they are never stuck behind a running request, and so is
//! `initialize`, so that requests read after it see the session.

use serde::{ Deserialize, Serialize };
use std::sync::{ Arc, Mutex };
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{ debug, warn };

use crate::messages::Envelope;
use crate::protocol::Method;
use crate::server::context::ConnectionState;
use crate::server::dispatcher::Dispatcher;
use crate::stream::{ DEFAULT_PIPE_CAPACITY, StreamPipe };
use crate::transport::ResponseWriter;

/// Per-connection behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionOptions {
    /// Handle requests one at a time in arrival order
    pub sequential: bool,
    /// Deadline applied to every request
    pub request_timeout: Option<Duration>,
    /// How long shutdown waits for in-flight requests
    pub drain_timeout: Duration,
    /// Refuse server notifications until the client sent `initialized`
    pub gate_notifications: bool,
    /// Chunks buffered per stream pipe
    pub stream_capacity: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            sequential: false,
            request_timeout: None,
            drain_timeout: Duration::from_secs(5),
            gate_notifications: false,
            stream_capacity: DEFAULT_PIPE_CAPACITY,
        }
    }
}

/// Capacity of the server-to-client notification queue
const OUTBOUND_BUFFER: usize = 64;

/// One live connection bound to a dispatcher and a response writer
pub struct Connection<W: ResponseWriter> {
    dispatcher: Arc<Dispatcher>,
    state: Arc<ConnectionState>,
    writer: Arc<W>,
    options: ConnectionOptions,
    tasks: TaskTracker,
    queue: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    notifier: JoinHandle<()>,
}

impl<W: ResponseWriter> Connection<W> {
    /// Open a stateful connection with the dispatcher's default options
    pub fn new(dispatcher: Arc<Dispatcher>, id: impl Into<String>, writer: Arc<W>) -> Self {
        let options = dispatcher.connection_options().clone();
        Self::with_options(dispatcher, id, writer, options)
    }

    pub fn with_options(
        dispatcher: Arc<Dispatcher>,
        id: impl Into<String>,
        writer: Arc<W>,
        options: ConnectionOptions
    ) -> Self {
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Envelope>(OUTBOUND_BUFFER);
        let state = Arc::new(
            ConnectionState::new(id)
                .with_outbound(outbound_tx)
                .with_gated_notifications(options.gate_notifications)
                .with_request_timeout(options.request_timeout)
        );

        let notifier = {
            let writer = writer.clone();
            tokio::spawn(async move {
                while let Some(notification) = outbound_rx.recv().await {
                    if let Err(e) = writer.write_notification(&notification).await {
                        warn!("Failed to write notification: {}", e);
                        break;
                    }
                }
            })
        };

        let tasks = TaskTracker::new();
        let queue = if options.sequential {
            let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
            let (dispatcher, state, writer) = (dispatcher.clone(), state.clone(), writer.clone());
            let capacity = options.stream_capacity;
            tasks.spawn(async move {
                while let Some(envelope) = rx.recv().await {
                    process(&dispatcher, &state, &writer, envelope, capacity).await;
                }
            });
            Some(tx)
        } else {
            None
        };

        Self {
            dispatcher,
            state,
            writer,
            options,
            tasks,
            queue: Mutex::new(queue),
            notifier,
        }
    }

    pub fn id(&self) -> &str {
        self.state.id()
    }

    pub fn state(&self) -> &Arc<ConnectionState> {
        &self.state
    }

    pub fn writer(&self) -> &Arc<W> {
        &self.writer
    }

    /// Number of requests currently running
    pub fn in_flight(&self) -> usize {
        self.state.in_flight().len()
    }

    /// Accept one decoded envelope. Requests run in the background; this
    /// returns as soon as they are queued.
    pub async fn handle(&self, envelope: Envelope) {
        match envelope.method.as_deref().and_then(Method::parse) {
            Some(method) if method.is_notification() => {
                self.dispatcher.dispatch(&self.state, envelope, None).await;
                return;
            }
            // Later requests depend on the session it creates
            Some(Method::Initialize) => {
                process(&self.dispatcher, &self.state, &self.writer, envelope, 1).await;
                return;
            }
            _ => {}
        }

        if self.tasks.is_closed() {
            debug!(connection = %self.id(), "Connection closing, request dropped");
            return;
        }

        let queued = self.queue.lock().unwrap_or_else(|p| p.into_inner()).clone();
        match queued {
            Some(queue) => {
                if queue.send(envelope).is_err() {
                    debug!(connection = %self.id(), "Sequential worker gone, request dropped");
                }
            }
            None => {
                let (dispatcher, state, writer) = (
                    self.dispatcher.clone(),
                    self.state.clone(),
                    self.writer.clone(),
                );
                let capacity = self.options.stream_capacity;
                self.tasks.spawn(async move {
                    process(&dispatcher, &state, &writer, envelope, capacity).await;
                });
            }
        }
    }

    /// Stop accepting requests, wait up to the drain timeout for the running
    /// ones, cancel the rest and evict the session
    pub async fn shutdown(&self) {
        self.queue.lock().unwrap_or_else(|p| p.into_inner()).take();
        self.tasks.close();
        if tokio::time::timeout(self.options.drain_timeout, self.tasks.wait()).await.is_err() {
            warn!(
                connection = %self.id(),
                in_flight = self.in_flight(),
                "Drain timeout elapsed, cancelling requests"
            );
        }
        self.state.cancel_all();
        self.tasks.wait().await;
        self.notifier.abort();

        if let Some(session) = self.state.take_session() {
            self.dispatcher.sessions().remove(&session.id());
        }
        debug!(connection = %self.id(), "Connection closed");
    }
}

impl<W: ResponseWriter> Drop for Connection<W> {
    fn drop(&mut self) {
        self.state.cancel_all();
        self.notifier.abort();
        if let Some(session) = self.state.take_session() {
            self.dispatcher.sessions().remove(&session.id());
        }
    }
}

/// Run one request and write its reply after every stream chunk
async fn process<W: ResponseWriter>(
    dispatcher: &Dispatcher,
    state: &ConnectionState,
    writer: &Arc<W>,
    envelope: Envelope,
    capacity: usize
) {
    let method = envelope.method.clone().unwrap_or_default();
    let id = envelope.id.clone();

    let (stream, forwarder) = if writer.supports_streaming() {
        let (pipe_writer, mut pipe_reader) = StreamPipe::new(capacity);
        let writer = writer.clone();
        let (id, method) = (id.clone(), method.clone());
        let forwarder = tokio::spawn(async move {
            while let Ok(chunk) = pipe_reader.recv().await {
                if let Err(e) = writer.write_stream_chunk(id.as_ref(), &method, &chunk).await {
                    warn!("Failed to write stream chunk: {}", e);
                    break;
                }
            }
        });
        (Some(Arc::new(pipe_writer)), Some(forwarder))
    } else {
        (None, None)
    };

    let reply = dispatcher.dispatch(state, envelope, stream.clone()).await;

    if let Some(stream) = stream {
        if let Err(e) = stream.close().await {
            debug!("Closing stream pipe: {}", e);
        }
    }
    if let Some(forwarder) = forwarder {
        if let Err(e) = forwarder.await {
            warn!("Stream forwarder failed: {}", e);
        }
    }

    if let Some(reply) = reply {
        if let Err(e) = writer.write_reply(&method, reply).await {
            warn!(method = %method, "Failed to write reply: {}", e);
        }
    }
}
