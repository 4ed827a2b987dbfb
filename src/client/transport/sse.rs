//! SSE Client Transport
//!
//! Two clients live here:
//!
//! - [`SseClient`] talks to a broadcast endpoint: `GET /` streams events
//!   (resuming after `Last-Event-ID`), `POST /` publishes, `DELETE /` closes
//!   every stream.
//! - [`SseClientTransport`] speaks MCP over SSE: `GET /sse` opens the stream,
//!   whose first `endpoint` event names the URL requests are posted to.
//!   Responses come back as `message` events; stream chunks arrive as events
//!   named after the chunk type.

use async_trait::async_trait;
use futures::Stream;
use futures_util::stream::StreamExt;
use reqwest::header::{ ACCEPT, CONTENT_TYPE };
use serde::Serialize;
use serde_json::{ Value, json };
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{ debug, info, warn };
use url::Url;

use crate::client::transport::http::ServerUrl;
use crate::client::transport::{ ClientTransport, Pending, wait };
use crate::errors::{ Error, ErrorData };
use crate::messages::{ Envelope, RequestId };
use crate::protocol::{ LAST_EVENT_ID_HEADER, SESSION_ID_HEADER };

/// Buffer size for forwarded events
const CHANNEL_BUFFER_SIZE: usize = 100;

/// Event carrying protocol envelopes
const MESSAGE_EVENT: &str = "message";

/// First event of an MCP stream, naming the message endpoint
const ENDPOINT_EVENT: &str = "endpoint";

/// One parsed server-sent event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseMessage {
    pub id: Option<String>,
    /// Event name, `message` when the server gave none
    pub event: String,
    pub data: String,
}

impl SseMessage {
    /// Decode the data as JSON
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, Error> {
        Ok(serde_json::from_str(&self.data)?)
    }
}

/// Incremental `text/event-stream` decoder
#[derive(Debug, Default)]
struct SseParser {
    buffer: Vec<u8>,
    id: Option<String>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    /// Feed raw bytes and return every event completed by them
    fn feed(&mut self, bytes: &[u8]) -> Vec<SseMessage> {
        self.buffer.extend_from_slice(bytes);
        let mut messages = Vec::new();
        while let Some(end) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=end).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(message) = self.line(line) {
                messages.push(message);
            }
        }
        messages
    }

    fn line(&mut self, line: &str) -> Option<SseMessage> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => {
                self.event = Some(value.to_string());
            }
            "data" => self.data.push(value.to_string()),
            "id" => {
                self.id = Some(value.to_string());
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseMessage> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        Some(SseMessage {
            id: self.id.clone(),
            event: event.unwrap_or_else(|| MESSAGE_EVENT.to_string()),
            data: std::mem::take(&mut self.data).join("\n"),
        })
    }
}

/// Decoded events of an open stream
pub type SseStream = Pin<Box<dyn Stream<Item = Result<SseMessage, Error>> + Send>>;

fn event_stream(response: reqwest::Response) -> SseStream {
    let mut bytes = response.bytes_stream();
    Box::pin(
        async_stream::try_stream! {
            let mut parser = SseParser::default();
            while let Some(chunk) = bytes.next().await {
                let chunk = chunk.map_err(|e| Error::Transport(format!("SSE stream failed: {}", e)))?;
                for message in parser.feed(&chunk) {
                    yield message;
                }
            }
        }
    )
}

/// Error carried by a failed HTTP response
async fn error_from(response: reqwest::Response) -> Error {
    let status = response.status();
    let body = match response.bytes().await {
        Ok(body) => body,
        Err(e) => {
            return Error::Transport(format!("Failed to read response: {}", e));
        }
    };
    match serde_json::from_slice::<Envelope>(&body) {
        Ok(Envelope { error: Some(error), .. }) => Error::Rpc(error),
        _ => Error::Rpc(ErrorData::new(i32::from(status.as_u16()), String::from_utf8_lossy(&body))),
    }
}

async fn open_stream(
    client: &reqwest::Client,
    url: Url,
    last_event_id: Option<&str>
) -> Result<reqwest::Response, Error> {
    let mut request = client.get(url).header(ACCEPT, "text/event-stream");
    if let Some(id) = last_event_id {
        request = request.header(LAST_EVENT_ID_HEADER, id);
    }
    let response = request
        .send().await
        .map_err(|e| Error::Transport(format!("Failed to open SSE stream: {}", e)))?;
    if !response.status().is_success() {
        return Err(error_from(response).await);
    }
    Ok(response)
}

/// An open broadcast stream and the session it was assigned
pub struct SseSubscription {
    pub session_id: Option<String>,
    pub events: SseStream,
}

/// Client of a broadcast event endpoint
pub struct SseClient {
    client: reqwest::Client,
    base: ServerUrl,
    session_id: Option<String>,
}

impl SseClient {
    pub fn new(base_url: &str) -> Result<Self, Error> {
        Ok(Self {
            client: reqwest::Client::new(),
            base: ServerUrl::parse(base_url)?,
            session_id: None,
        })
    }

    /// Publish as the owner of a stream's session
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Open a stream. With `last_event_id`, stored events after it are
    /// replayed first.
    pub async fn subscribe(&self, last_event_id: Option<&str>) -> Result<SseSubscription, Error> {
        let response = open_stream(&self.client, self.base.join("")?, last_event_id).await?;
        let session_id = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok(SseSubscription {
            session_id,
            events: event_stream(response),
        })
    }

    /// Publish `{type, data}`; returns the server's reply, null for 202
    pub async fn publish<T: Serialize>(&self, event_type: &str, data: &T) -> Result<Value, Error> {
        let mut request = self.client
            .post(self.base.join("")?)
            .json(&json!({ "type": event_type, "data": data }));
        if let Some(session_id) = &self.session_id {
            request = request.header(SESSION_ID_HEADER, session_id);
        }
        let response = request
            .send().await
            .map_err(|e| Error::Transport(format!("Failed to publish: {}", e)))?;
        if !response.status().is_success() {
            return Err(error_from(response).await);
        }
        if response.status() == reqwest::StatusCode::ACCEPTED {
            return Ok(Value::Null);
        }
        response.json().await.map_err(|e| Error::Transport(format!("Invalid publish reply: {}", e)))
    }

    /// Close every stream on the server; returns how many were closed
    pub async fn close_all(&self) -> Result<usize, Error> {
        let response = self.client
            .delete(self.base.join("")?)
            .send().await
            .map_err(|e| Error::Transport(format!("Failed to close streams: {}", e)))?;
        if !response.status().is_success() {
            return Err(error_from(response).await);
        }
        let body: Value = response
            .json().await
            .map_err(|e| Error::Transport(format!("Invalid close reply: {}", e)))?;
        Ok(
            body
                .get("closed")
                .and_then(Value::as_u64)
                .unwrap_or(0) as usize
        )
    }
}

/// MCP client transport over an SSE stream and a message endpoint
pub struct SseClientTransport {
    client: reqwest::Client,
    message_url: Url,
    pending: Arc<Pending>,
    events: std::sync::Mutex<Option<mpsc::Receiver<SseMessage>>>,
    reader_task: JoinHandle<()>,
}

impl SseClientTransport {
    /// Open `GET <base>/sse` and wait for the endpoint event
    pub async fn connect(base_url: &str) -> Result<Self, Error> {
        let base = ServerUrl::parse(base_url)?;
        let client = reqwest::Client::new();
        let response = open_stream(&client, base.join("sse")?, None).await?;
        let mut events = event_stream(response);

        let endpoint = loop {
            match events.next().await {
                Some(Ok(message)) if message.event == ENDPOINT_EVENT => {
                    break message.data;
                }
                Some(Ok(message)) => debug!(event = %message.event, "Event before endpoint ignored"),
                Some(Err(e)) => {
                    return Err(e);
                }
                None => {
                    return Err(Error::Transport("SSE stream ended before the endpoint event".to_string()));
                }
            }
        };
        let message_url = base.join(&endpoint)?;
        info!("SSE connected, posting messages to {}", message_url);

        let pending = Arc::new(Pending::default());
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let reader_task = tokio::spawn(read_loop(events, pending.clone(), tx));
        Ok(Self {
            client,
            message_url,
            pending,
            events: std::sync::Mutex::new(Some(rx)),
            reader_task,
        })
    }

    /// Stream chunks and server notifications; can be taken once
    pub fn take_events(&self) -> Option<mpsc::Receiver<SseMessage>> {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).take()
    }

    async fn post(&self, envelope: &Envelope) -> Result<(), Error> {
        let response = self.client
            .post(self.message_url.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(serde_json::to_vec(envelope)?)
            .send().await
            .map_err(|e| Error::Transport(format!("Failed to post message: {}", e)))?;
        if !response.status().is_success() {
            return Err(error_from(response).await);
        }
        Ok(())
    }
}

async fn read_loop(mut events: SseStream, pending: Arc<Pending>, forward: mpsc::Sender<SseMessage>) {
    while let Some(message) = events.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                warn!("{}", e);
                break;
            }
        };
        if message.event == MESSAGE_EVENT {
            match message.json::<Envelope>() {
                Ok(envelope) => {
                    if pending.resolve(envelope).is_none() {
                        continue;
                    }
                }
                Err(e) => {
                    warn!("Failed to parse message event: {}", e);
                    continue;
                }
            }
        }
        if forward.try_send(message).is_err() {
            debug!("Event dropped");
        }
    }
    debug!("SSE stream ended");
    pending.close_all(|_| Err(Error::StreamClosed));
}

#[async_trait]
impl ClientTransport for SseClientTransport {
    async fn request(&self, id: RequestId, method: &str, params: Option<Value>) -> Result<Value, Error> {
        let rx = self.pending.register(&id, method)?;
        let _forget = scopeguard::guard(&id, |id| {
            self.pending.remove(id);
        });
        self.post(&Envelope::request(Some(id.clone()), method, params)).await?;
        wait(rx).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), Error> {
        self.post(&Envelope::notification(method, params)).await
    }

    async fn close(&self) -> Result<(), Error> {
        self.reader_task.abort();
        self.pending.close_all(|_| Err(Error::StreamClosed));
        Ok(())
    }
}

impl Drop for SseClientTransport {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}
