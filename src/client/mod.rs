//! MCP Client Implementation
//!
//! This module provides a Rust client for the Model Context Protocol (MCP):
//! a typed [`Client`] over any [`ClientTransport`], plus transports for
//! stdio, HTTP, WebSocket and SSE.

pub mod client;
pub mod transport;

pub use client::{ Client, ClientBuilder, ClientConfig };
pub use transport::{
    ClientTransport,
    HttpClientOptions,
    HttpClientTransport,
    HttpStyle,
    ServerUrl,
    SseClient,
    SseClientTransport,
    SseMessage,
    StdioClientTransport,
    WebSocketClientOptions,
    WebSocketClientTransport,
};

use crate::errors::Error;

/// Create a client over `transport` and complete the initialize handshake
pub async fn connect<T: ClientTransport>(transport: T) -> Result<Client<T>, Error> {
    let client = Client::new(transport);
    client.connect().await?;
    Ok(client)
}
