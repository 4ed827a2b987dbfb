//! WebSocket Client Transport
//!
//! Frames are `{type, payload, id?}` JSON texts. [`WebSocketClientTransport::send_and_wait`]
//! registers a one-shot waiter for `<type>Response` (or an error frame with
//! the same id) and returns the first match. Frames nobody waits for go to
//! subscribers registered with [`WebSocketClientTransport::subscribe`].

use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{ SinkExt, StreamExt };
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{ AtomicU64, Ordering };
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{ Mutex, mpsc, oneshot };
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{ MaybeTlsStream, WebSocketStream, connect_async };
use tracing::{ debug, info, warn };
use url::Url;

use crate::client::transport::ClientTransport;
use crate::errors::Error;
use crate::messages::RequestId;
use crate::transport::websocket_server::{ ERROR_FRAME_TYPE, Frame };

/// Default connection timeout
const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Frames buffered per subscriber
const SUBSCRIBER_BUFFER: usize = 256;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// WebSocket transport options
#[derive(Debug, Clone)]
pub struct WebSocketClientOptions {
    /// Connection timeout
    pub connection_timeout: Duration,
    /// How long `send_and_wait` waits for the matching frame
    pub response_timeout: Duration,
}

impl Default for WebSocketClientOptions {
    fn default() -> Self {
        Self {
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            response_timeout: Duration::from_secs(30),
        }
    }
}

struct Waiter {
    token: u64,
    frame_type: String,
    id: Option<RequestId>,
    tx: oneshot::Sender<Frame>,
}

impl Waiter {
    fn matches(&self, frame: &Frame) -> bool {
        let same_id = match (&self.id, &frame.id) {
            (Some(expected), Some(got)) => expected.key() == got.key(),
            (Some(_), None) => false,
            (None, _) => true,
        };
        if frame.frame_type == ERROR_FRAME_TYPE {
            return self.id.is_some() && same_id;
        }
        frame.frame_type == self.frame_type && same_id
    }
}

#[derive(Default)]
struct Routes {
    waiters: Vec<Waiter>,
    subscribers: HashMap<String, Vec<mpsc::Sender<Frame>>>,
}

impl Routes {
    fn route(&mut self, frame: Frame) {
        if let Some(index) = self.waiters.iter().position(|w| w.matches(&frame)) {
            let waiter = self.waiters.swap_remove(index);
            let _ = waiter.tx.send(frame);
            return;
        }
        match self.subscribers.get_mut(&frame.frame_type) {
            Some(subscribers) => {
                subscribers.retain(|tx| !tx.is_closed());
                for tx in subscribers.iter() {
                    if tx.try_send(frame.clone()).is_err() {
                        warn!(frame_type = %frame.frame_type, "Subscriber full, frame dropped");
                    }
                }
            }
            None => debug!(frame_type = %frame.frame_type, "Unhandled frame"),
        }
    }
}

/// WebSocket transport for MCP and application frames
pub struct WebSocketClientTransport {
    sink: Mutex<WsSink>,
    routes: Arc<std::sync::Mutex<Routes>>,
    next_token: AtomicU64,
    options: WebSocketClientOptions,
    reader_task: JoinHandle<()>,
}

impl WebSocketClientTransport {
    /// Connect with default options
    pub async fn connect(url: &str) -> Result<Self, Error> {
        Self::connect_with_options(url, WebSocketClientOptions::default()).await
    }

    pub async fn connect_with_options(url: &str, options: WebSocketClientOptions) -> Result<Self, Error> {
        let url = Url::parse(url).map_err(|e| Error::InvalidParams(format!("invalid URL {}: {}", url, e)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::InvalidParams(format!("WebSocket URL must use ws:// or wss://: {}", url)));
        }
        info!("Connecting to WebSocket server at {}", url);
        let (socket, _) = tokio::time
            ::timeout(options.connection_timeout, connect_async(url.as_str())).await
            .map_err(|_| Error::Timeout("WebSocket connection timed out".to_string()))?
            .map_err(|e| Error::Transport(format!("WebSocket connection failed: {}", e)))?;

        let (sink, mut stream) = socket.split();
        let routes = Arc::new(std::sync::Mutex::new(Routes::default()));
        let reader_task = {
            let routes = routes.clone();
            tokio::spawn(async move {
                while let Some(message) = stream.next().await {
                    let text = match message {
                        Ok(WsMessage::Text(text)) => text.to_string(),
                        Ok(WsMessage::Binary(data)) => String::from_utf8_lossy(&data).into_owned(),
                        Ok(WsMessage::Close(frame)) => {
                            debug!("Server closed the connection: {:?}", frame);
                            break;
                        }
                        Ok(_) => {
                            continue;
                        }
                        Err(e) => {
                            warn!("WebSocket error: {}", e);
                            break;
                        }
                    };
                    match serde_json::from_str::<Frame>(&text) {
                        Ok(frame) => routes.lock().unwrap_or_else(|p| p.into_inner()).route(frame),
                        Err(e) => warn!("Failed to parse frame: {}", e),
                    }
                }
                // Dropping the waiters fails every pending call
                let mut routes = routes.lock().unwrap_or_else(|p| p.into_inner());
                routes.waiters.clear();
                routes.subscribers.clear();
            })
        };

        Ok(Self {
            sink: Mutex::new(sink),
            routes,
            next_token: AtomicU64::new(1),
            options,
            reader_task,
        })
    }

    /// Send one frame
    pub async fn send(&self, frame: &Frame) -> Result<(), Error> {
        let text = serde_json::to_string(frame)?;
        self.sink
            .lock().await
            .send(WsMessage::Text(text.into())).await
            .map_err(|e| Error::Transport(format!("WebSocket send failed: {}", e)))
    }

    /// Receive every frame of `frame_type` that no waiter claims
    pub fn subscribe(&self, frame_type: impl Into<String>) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.lock_routes().subscribers.entry(frame_type.into()).or_default().push(tx);
        rx
    }

    /// Send `frame` and wait for `<type>Response` with the same id. An error
    /// frame for that id is returned as its error.
    pub async fn send_and_wait(&self, frame: Frame) -> Result<Frame, Error> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.lock_routes().waiters.push(Waiter {
            token,
            frame_type: Frame::response_type(&frame.frame_type),
            id: frame.id.clone(),
            tx,
        });

        if let Err(e) = self.send(&frame).await {
            self.forget(token);
            return Err(e);
        }
        let reply = match tokio::time::timeout(self.options.response_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => {
                return Err(Error::StreamClosed);
            }
            Err(_) => {
                self.forget(token);
                return Err(Error::Timeout(format!("no {}Response received", frame.frame_type)));
            }
        };
        match reply.as_error() {
            Some(error) => Err(Error::Rpc(error)),
            None => Ok(reply),
        }
    }

    fn forget(&self, token: u64) {
        self.lock_routes().waiters.retain(|w| w.token != token);
    }

    fn lock_routes(&self) -> std::sync::MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl ClientTransport for WebSocketClientTransport {
    async fn request(&self, id: RequestId, method: &str, params: Option<Value>) -> Result<Value, Error> {
        let frame = Frame::new(method, params.unwrap_or(Value::Null)).with_id(id);
        Ok(self.send_and_wait(frame).await?.payload)
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), Error> {
        self.send(&Frame::new(method, params.unwrap_or(Value::Null))).await
    }

    async fn close(&self) -> Result<(), Error> {
        let result = self.sink.lock().await.send(WsMessage::Close(None)).await;
        self.reader_task.abort();
        result.map_err(|e| Error::Transport(format!("WebSocket close failed: {}", e)))
    }
}

impl Drop for WebSocketClientTransport {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}
