//! Transport module for MCP communication
//!
//! This module defines the [`Transport`] and [`ResponseWriter`] traits and
//! their implementations for stdio, HTTP, SSE, streamable HTTP and WebSocket.
//! Every transport decodes envelopes, hands them to the shared
//! [`connection::Connection`] driver (or straight to the dispatcher for
//! one-shot HTTP requests) and encodes what comes back.

use async_trait::async_trait;
use std::sync::Arc;

use crate::errors::Error;
use crate::messages::{ Envelope, RequestId };
use crate::server::dispatcher::{ Dispatcher, Reply };
use crate::stream::StreamChunk;

pub mod connection;
pub mod http;
pub mod hub;
pub mod sse;
pub mod stdio;
pub mod streamable;
pub mod websocket_server;

pub use connection::{ Connection, ConnectionOptions };
pub use http::{ HttpServerOptions, HttpTransport };
pub use hub::EventHub;
pub use sse::{ SseServerOptions, SseServerTransport };
pub use stdio::{ StdioOptions, StdioTransport };
pub use streamable::{ StreamableHttpOptions, StreamableHttpTransport };
pub use websocket_server::{ Frame, WebSocketServerOptions, WebSocketServerTransport };

/// A server-side transport
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start serving; returns once the transport accepts traffic
    async fn start(&mut self, dispatcher: Arc<Dispatcher>) -> Result<(), Error>;

    /// Stop accepting traffic, drain in-flight requests and close
    async fn stop(&mut self) -> Result<(), Error>;
}

/// The outbound side of one connection. Implementations serialize their
/// writes so frames never interleave.
#[async_trait]
pub trait ResponseWriter: Send + Sync + 'static {
    /// Write the reply to a request of `method`
    async fn write_reply(&self, method: &str, reply: Reply) -> Result<(), Error>;

    /// Write one stream chunk of the request `id`
    async fn write_stream_chunk(
        &self,
        id: Option<&RequestId>,
        method: &str,
        chunk: &StreamChunk
    ) -> Result<(), Error>;

    /// Write a server-initiated notification
    async fn write_notification(&self, notification: &Envelope) -> Result<(), Error>;

    /// Whether requests on this connection get a stream pipe
    fn supports_streaming(&self) -> bool {
        false
    }
}
