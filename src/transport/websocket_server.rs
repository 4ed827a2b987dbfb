//! Server-side WebSocket transport implementation using Axum
//!
//! Every text frame is one JSON object `{type, payload, id?}`. A `type` that
//! names a protocol method is dispatched through the connection's
//! [`Connection`] and answered with `<method>Response`; any other `type` is
//! routed to a frame handler registered on the transport. Failures come back
//! as `{type: "error", payload: {code, message}}`. Stream chunks of a request
//! arrive as `{type: "stream", id, payload: <chunk>}` before its response.

use async_trait::async_trait;
use axum::{
    Router,
    extract::{ State, ws::{ CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code } },
    http::StatusCode,
    response::{ IntoResponse, Response },
    routing::get,
};
use futures::future::BoxFuture;
use futures_util::{ FutureExt, SinkExt, StreamExt, stream::SplitSink };
use serde::{ Deserialize, Serialize };
use serde_json::{ Value, json };
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{ Arc, Mutex, RwLock };
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{ debug, info, warn };

use crate::errors::{ Error, ErrorData };
use crate::messages::{ Envelope, RequestId };
use crate::protocol::Method;
use crate::server::dispatcher::{ Dispatcher, Reply };
use crate::stream::StreamChunk;
use crate::transport::connection::Connection;
use crate::transport::http::{ cors_layer, spawn_server, stop_server };
use crate::transport::{ ResponseWriter, Transport };

/// Frame type of error replies
pub const ERROR_FRAME_TYPE: &str = "error";

/// Frame type of stream chunks
pub const STREAM_FRAME_TYPE: &str = "stream";

/// Configuration options for the WebSocket server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketServerOptions {
    /// Address to bind the server to
    pub bind_address: String,
    /// Path of the upgrade endpoint
    pub path: String,
    /// Upgrades beyond this many open sockets are refused with 503
    pub max_connections: usize,
    /// Broadcast frames queued per socket before new ones are dropped
    pub broadcast_buffer: usize,
    /// How long shutdown waits for sockets to answer the close frame
    pub close_grace: Duration,
    /// CORS allowed origins
    pub allowed_origins: Option<Vec<String>>,
}

impl Default for WebSocketServerOptions {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:9000".to_string(),
            path: "/".to_string(),
            max_connections: 1024,
            broadcast_buffer: 64,
            close_grace: Duration::from_secs(2),
            allowed_origins: None,
        }
    }
}

/// One WebSocket message
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Frame {
    #[serde(rename = "type")]
    pub frame_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
}

impl Frame {
    pub fn new(frame_type: impl Into<String>, payload: Value) -> Self {
        Self {
            frame_type: frame_type.into(),
            payload,
            id: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<RequestId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Reply type for a request of `frame_type`
    pub fn response_type(frame_type: &str) -> String {
        format!("{}Response", frame_type)
    }

    /// `{type: "error", payload: {code, message}}`
    pub fn error(id: Option<RequestId>, error: &Error) -> Self {
        Self::from_error_data(id, error.to_error_data())
    }

    pub fn from_error_data(id: Option<RequestId>, error: ErrorData) -> Self {
        Self {
            frame_type: ERROR_FRAME_TYPE.to_string(),
            payload: json!({ "code": error.code, "message": error.message }),
            id,
        }
    }

    /// Error carried by an error frame
    pub fn as_error(&self) -> Option<ErrorData> {
        if self.frame_type != ERROR_FRAME_TYPE {
            return None;
        }
        let code = self.payload.get("code")?.as_i64()?;
        let message = self.payload.get("message")?.as_str()?;
        Some(ErrorData::new(i32::try_from(code).ok()?, message))
    }
}

#[derive(Serialize)]
struct StreamFrame<'a> {
    #[serde(rename = "type")]
    frame_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a RequestId>,
    payload: &'a StreamChunk,
}

/// Handler of one application frame type
pub type FrameHandler = Arc<
    dyn (Fn(Frame) -> BoxFuture<'static, Result<Option<Frame>, Error>>) + Send + Sync
>;

/// Write half of a socket; one writer at a time
struct WsSink {
    sink: tokio::sync::Mutex<SplitSink<WebSocket, Message>>,
}

impl WsSink {
    async fn send_text(&self, text: String) -> Result<(), Error> {
        self.sink
            .lock().await
            .send(Message::Text(text.into())).await
            .map_err(|e| Error::Transport(format!("WebSocket send failed: {}", e)))
    }

    async fn send_frame<T: Serialize>(&self, frame: &T) -> Result<(), Error> {
        self.send_text(serde_json::to_string(frame)?).await
    }

    async fn close(&self) -> Result<(), Error> {
        let frame = CloseFrame {
            code: close_code::NORMAL,
            reason: "server shutdown".into(),
        };
        self.sink
            .lock().await
            .send(Message::Close(Some(frame))).await
            .map_err(|e| Error::Transport(format!("WebSocket close failed: {}", e)))
    }
}

/// Response writer for protocol frames
struct WsWriter {
    sink: Arc<WsSink>,
}

#[async_trait]
impl ResponseWriter for WsWriter {
    async fn write_reply(&self, method: &str, reply: Reply) -> Result<(), Error> {
        let id = reply.id.clone();
        let envelope = reply.into_envelope();
        let frame = match envelope.error {
            Some(error) => Frame::from_error_data(id, error),
            None =>
                Frame {
                    frame_type: Frame::response_type(method),
                    payload: envelope.result.unwrap_or(Value::Null),
                    id,
                },
        };
        self.sink.send_frame(&frame).await
    }

    async fn write_stream_chunk(
        &self,
        id: Option<&RequestId>,
        _method: &str,
        chunk: &StreamChunk
    ) -> Result<(), Error> {
        self.sink.send_frame(
            &(StreamFrame {
                frame_type: STREAM_FRAME_TYPE,
                id,
                payload: chunk,
            })
        ).await
    }

    async fn write_notification(&self, notification: &Envelope) -> Result<(), Error> {
        let frame = Frame::new(
            notification.method.clone().unwrap_or_default(),
            notification.params.clone().unwrap_or(Value::Null)
        );
        self.sink.send_frame(&frame).await
    }

    fn supports_streaming(&self) -> bool {
        true
    }
}

struct ClientHandle {
    tx: mpsc::Sender<Frame>,
    sink: Arc<WsSink>,
}

type ClientMap = Mutex<HashMap<String, ClientHandle>>;
type HandlerMap = RwLock<HashMap<String, FrameHandler>>;

#[derive(Clone)]
struct AppState {
    dispatcher: Arc<Dispatcher>,
    clients: Arc<ClientMap>,
    handlers: Arc<HandlerMap>,
    options: WebSocketServerOptions,
    closing: CancellationToken,
    sockets: TaskTracker,
}

/// Server-side implementation of the WebSocket transport using Axum
pub struct WebSocketServerTransport {
    options: WebSocketServerOptions,
    clients: Arc<ClientMap>,
    handlers: Arc<HandlerMap>,
    local_addr: Option<SocketAddr>,
    shutdown: CancellationToken,
    closing: CancellationToken,
    sockets: TaskTracker,
    task: Option<JoinHandle<Result<(), Error>>>,
}

impl Default for WebSocketServerTransport {
    fn default() -> Self {
        Self::new(WebSocketServerOptions::default())
    }
}

impl WebSocketServerTransport {
    pub fn new(options: WebSocketServerOptions) -> Self {
        Self {
            options,
            clients: Arc::new(Mutex::new(HashMap::new())),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            local_addr: None,
            shutdown: CancellationToken::new(),
            closing: CancellationToken::new(),
            sockets: TaskTracker::new(),
            task: None,
        }
    }

    /// Route frames of `frame_type` to `handler`; a returned frame is sent
    /// back on the same socket
    pub fn register_handler<F, Fut>(&self, frame_type: impl Into<String>, handler: F)
        where
            F: Fn(Frame) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = Result<Option<Frame>, Error>> + Send + 'static
    {
        let handler: FrameHandler = Arc::new(move |frame| handler(frame).boxed());
        self.handlers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(frame_type.into(), handler);
    }

    /// Queue `frame` on every open socket; returns how many accepted it
    pub fn broadcast(&self, frame: &Frame) -> usize {
        let clients = self.clients.lock().unwrap_or_else(|p| p.into_inner());
        let mut delivered = 0;
        for (client_id, client) in clients.iter() {
            match client.tx.try_send(frame.clone()) {
                Ok(()) => {
                    delivered += 1;
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(client_id = %client_id, "Broadcast buffer full, frame dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    /// Get the number of connected clients
    pub fn connected_clients(&self) -> usize {
        self.clients.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn router(&self, dispatcher: Arc<Dispatcher>) -> Router {
        let state = AppState {
            dispatcher,
            clients: self.clients.clone(),
            handlers: self.handlers.clone(),
            options: self.options.clone(),
            closing: self.closing.clone(),
            sockets: self.sockets.clone(),
        };
        Router::new()
            .route(&self.options.path, get(ws_handler))
            .layer(cors_layer(self.options.allowed_origins.as_deref()))
            .with_state(state)
    }
}

/// WebSocket connection handler
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let open = state.clients.lock().unwrap_or_else(|p| p.into_inner()).len();
    if open >= state.options.max_connections || state.closing.is_cancelled() {
        warn!("Maximum client connections reached");
        return (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response();
    }
    let sockets = state.sockets.clone();
    ws.on_upgrade(move |socket| sockets.track_future(handle_socket(socket, state)))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let client_id = uuid::Uuid::new_v4().to_string();
    let (sink, mut stream) = socket.split();
    let sink = Arc::new(WsSink { sink: tokio::sync::Mutex::new(sink) });
    let (tx, mut rx) = mpsc::channel::<Frame>(state.options.broadcast_buffer.max(1));

    state.clients
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .insert(client_id.clone(), ClientHandle { tx, sink: sink.clone() });
    info!("New WebSocket client connected: {}", client_id);

    let _cleanup = scopeguard::guard((state.clients.clone(), client_id.clone()), |(clients, id)| {
        if clients.lock().unwrap_or_else(|p| p.into_inner()).remove(&id).is_some() {
            info!("WebSocket client disconnected: {}", id);
        }
    });

    let connection = Connection::new(
        state.dispatcher.clone(),
        format!("ws-{}", client_id),
        Arc::new(WsWriter { sink: sink.clone() })
    );
    let broadcaster = {
        let sink = sink.clone();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if sink.send_frame(&frame).await.is_err() {
                    break;
                }
            }
        })
    };
    let frames = TaskTracker::new();

    loop {
        let message = tokio::select! {
            _ = state.closing.cancelled() => None,
            message = stream.next() => message,
        };
        let Some(message) = message else {
            break;
        };
        match message {
            Ok(Message::Text(text)) => {
                handle_text(&state, &connection, &sink, &frames, text.as_str()).await;
            }
            Ok(Message::Binary(data)) =>
                match std::str::from_utf8(&data) {
                    Ok(text) => handle_text(&state, &connection, &sink, &frames, text).await,
                    Err(_) => {
                        let error = Error::Protocol("binary frame is not UTF-8".to_string());
                        send_or_log(&sink, &Frame::error(None, &error)).await;
                    }
                }
            Ok(Message::Close(_)) => {
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!("WebSocket error: {}", e);
                break;
            }
        }
    }

    frames.close();
    if tokio::time::timeout(state.options.close_grace, frames.wait()).await.is_err() {
        debug!(client_id = %client_id, "Frame handlers still running at close");
    }
    connection.shutdown().await;
    broadcaster.abort();
}

async fn handle_text(
    state: &AppState,
    connection: &Connection<WsWriter>,
    sink: &Arc<WsSink>,
    frames: &TaskTracker,
    text: &str
) {
    let frame = match serde_json::from_str::<Frame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!("Failed to parse frame: {}", e);
            let error = Error::Protocol(format!("malformed frame: {}", e));
            send_or_log(sink, &Frame::error(None, &error)).await;
            return;
        }
    };

    if let Some(method) = Method::parse(&frame.frame_type) {
        let params = if frame.payload.is_null() { None } else { Some(frame.payload) };
        connection.handle(Envelope::request(frame.id, method.as_str(), params)).await;
        return;
    }

    let handler = state.handlers
        .read()
        .unwrap_or_else(|p| p.into_inner())
        .get(&frame.frame_type)
        .cloned();
    let Some(handler) = handler else {
        let error = Error::HandlerNotRegistered(frame.frame_type.clone());
        send_or_log(sink, &Frame::error(frame.id, &error)).await;
        return;
    };

    let sink = sink.clone();
    frames.spawn(async move {
        let id = frame.id.clone();
        let reply = match handler(frame).await {
            Ok(Some(reply)) => reply,
            Ok(None) => {
                return;
            }
            Err(e) => Frame::error(id, &e),
        };
        send_or_log(&sink, &reply).await;
    });
}

async fn send_or_log(sink: &WsSink, frame: &Frame) {
    if let Err(e) = sink.send_frame(frame).await {
        debug!("Failed to send frame: {}", e);
    }
}

#[async_trait]
impl Transport for WebSocketServerTransport {
    async fn start(&mut self, dispatcher: Arc<Dispatcher>) -> Result<(), Error> {
        if self.task.is_some() {
            return Err(Error::InvalidState("WebSocket server already running".to_string()));
        }
        let router = self.router(dispatcher);
        let (addr, task) = spawn_server(router, &self.options.bind_address, self.shutdown.clone()).await?;
        info!("WebSocket server started at ws://{}{}", addr, self.options.path);
        self.local_addr = Some(addr);
        self.task = Some(task);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), Error> {
        info!("WebSocket server transport closing");
        self.shutdown.cancel();

        let sinks: Vec<Arc<WsSink>> = self.clients
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .map(|client| client.sink.clone())
            .collect();
        for sink in &sinks {
            if let Err(e) = sink.close().await {
                debug!("{}", e);
            }
        }

        self.sockets.close();
        if tokio::time::timeout(self.options.close_grace, self.sockets.wait()).await.is_err() {
            warn!(open = self.connected_clients(), "Close grace elapsed, dropping sockets");
        }
        self.closing.cancel();

        stop_server(self.task.take(), &self.shutdown, self.options.close_grace).await?;
        info!("WebSocket server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamPipe;

    #[test]
    fn frames_use_the_type_field() {
        let frame: Frame = serde_json::from_str(r#"{"type":"echo","payload":{"n":3}}"#).unwrap();
        assert_eq!(frame, Frame::new("echo", json!({"n": 3})));
        assert_eq!(
            serde_json::to_value(Frame::new("callTool", json!({})).with_id(4i64)).unwrap(),
            json!({"type": "callTool", "payload": {}, "id": 4})
        );
    }

    #[test]
    fn error_frames_carry_code_and_message() {
        let frame = Frame::error(Some(RequestId::from(1i64)), &Error::rpc(418, "teapot"));
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"type": "error", "payload": {"code": 418, "message": "teapot"}, "id": 1})
        );
        assert_eq!(frame.as_error(), Some(ErrorData::new(418, "teapot")));
        assert_eq!(Frame::new("echo", json!({})).as_error(), None);
    }

    #[tokio::test]
    async fn stream_frames_keep_data_verbatim() {
        let (writer, mut reader) = StreamPipe::new(4);
        writer.write_json_bytes(br#"{"z":0,"a":1}"#).await.unwrap();
        let chunk = reader.recv().await.unwrap();
        let id = RequestId::from("r1");
        let text = serde_json
            ::to_string(
                &(StreamFrame {
                    frame_type: STREAM_FRAME_TYPE,
                    id: Some(&id),
                    payload: &chunk,
                })
            )
            .unwrap();
        insta::assert_snapshot!(text, @r#"{"type":"stream","id":"r1","payload":{"type":"data","data":{"z":0,"a":1}}}"#);
    }
}
