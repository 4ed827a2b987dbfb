//! MCP Rust Library
//!
//! This crate provides a Rust implementation of the Model Context Protocol (MCP):
//! a method dispatcher with sessions, progress tracking and streaming
//! responses, server transports for stdio, HTTP, SSE, streamable HTTP and
//! WebSocket, and a client for each of them.

pub mod client;
pub mod errors;
pub mod event_store;
pub mod messages;
pub mod progress;
pub mod protocol;
pub mod server;
pub mod stream;
pub mod transport;
pub mod types;

#[cfg(test)]
mod tests;

// Re-export commonly used items
pub use client::{ Client, ClientTransport };
pub use errors::{ Error, ErrorData };
pub use event_store::{ EventStore, InMemoryEventStore };
pub use messages::{ Envelope, RequestId };
pub use progress::{ Progress, ProgressState, ProgressTracker };
pub use protocol::Method;
pub use server::{ Dispatcher, Server, ServerBuilder };
pub use stream::{ StreamChunk, StreamPipe };
pub use transport::Transport;
