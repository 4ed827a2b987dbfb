//! Client transports
//!
//! This module defines the [`ClientTransport`] trait and its implementations
//! for stdio, HTTP, WebSocket and MCP over SSE. The client assigns request
//! ids; framed transports correlate responses back to callers through
//! [`Pending`].

pub mod http;
pub mod sse;
pub mod stdio;
pub mod websocket;

use async_trait::async_trait;
use serde_json::{ Value, json };
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;

use crate::errors::Error;
use crate::messages::{ Envelope, RequestId };
use crate::protocol::Method;
use crate::types::ResourceContent;

pub use http::{ HttpClientOptions, HttpClientTransport, HttpStyle, ServerUrl };
pub use sse::{ SseClient, SseClientTransport, SseMessage };
pub use stdio::StdioClientTransport;
pub use websocket::{ WebSocketClientOptions, WebSocketClientTransport };

/// The client side of one connection
#[async_trait]
pub trait ClientTransport: Send + Sync {
    /// Send a request and wait for its result
    async fn request(&self, id: RequestId, method: &str, params: Option<Value>) -> Result<Value, Error>;

    /// Send a notification
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), Error>;

    /// Read a resource; framed transports carry it as a resource chunk
    async fn read_resource(&self, id: RequestId, uri: &str) -> Result<ResourceContent, Error> {
        let chunk = self.request(id, Method::ReadResource.as_str(), Some(json!({ "uri": uri }))).await?;
        ResourceContent::from_chunk(&chunk)
    }

    /// Close the connection
    async fn close(&self) -> Result<(), Error>;
}

type Waiter = (String, oneshot::Sender<Result<Value, Error>>);

/// Requests written but not yet answered, keyed by id
#[derive(Default)]
pub(crate) struct Pending {
    waiters: Mutex<HashMap<String, Waiter>>,
}

impl Pending {
    /// Register a request before it is written
    pub(crate) fn register(
        &self,
        id: &RequestId,
        method: &str
    ) -> Result<oneshot::Receiver<Result<Value, Error>>, Error> {
        let mut waiters = self.lock();
        let key = id.key();
        if waiters.contains_key(&key) {
            return Err(Error::Conflict(format!("request id {} already pending", id)));
        }
        let (tx, rx) = oneshot::channel();
        waiters.insert(key, (method.to_string(), tx));
        Ok(rx)
    }

    /// Forget a request; true when it was still pending
    pub(crate) fn remove(&self, id: &RequestId) -> bool {
        self.lock().remove(&id.key()).is_some()
    }

    /// Complete the request a response belongs to. Anything that is not a
    /// response to a pending request is handed back.
    pub(crate) fn resolve(&self, envelope: Envelope) -> Option<Envelope> {
        if !envelope.is_response() {
            return Some(envelope);
        }
        let waiter = envelope.id.as_ref().and_then(|id| self.lock().remove(&id.key()));
        match waiter {
            Some((_, tx)) => {
                // The caller may have given up already
                let _ = tx.send(envelope.into_result());
                None
            }
            None => Some(envelope),
        }
    }

    /// Complete every pending request with `outcome(method)`
    pub(crate) fn close_all<F>(&self, outcome: F) where F: Fn(&str) -> Result<Value, Error> {
        let waiters: Vec<Waiter> = self
            .lock()
            .drain()
            .map(|(_, waiter)| waiter)
            .collect();
        for (method, tx) in waiters {
            let _ = tx.send(outcome(&method));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Waiter>> {
        self.waiters.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Wait for a registered request to complete
pub(crate) async fn wait(rx: oneshot::Receiver<Result<Value, Error>>) -> Result<Value, Error> {
    rx.await.map_err(|_| Error::StreamClosed)?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn responses_complete_their_request() {
        let pending = Pending::default();
        let rx = pending.register(&RequestId::from(1), "ping").unwrap();
        assert!(pending.register(&RequestId::from(1), "ping").is_err());

        let stray = Envelope::success(Some(RequestId::from(9)), json!(1));
        assert_eq!(pending.resolve(stray.clone()), Some(stray));
        assert!(pending.resolve(Envelope::success(Some(RequestId::from(1)), json!({}))).is_none());
        assert_eq!(wait(rx).await.unwrap(), json!({}));
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn string_ids_match_numeric_responses() {
        let pending = Pending::default();
        let rx = pending.register(&RequestId::from("5"), "ping").unwrap();
        pending.resolve(Envelope::failure(Some(RequestId::from(5)), &Error::rpc(418, "teapot")));
        match wait(rx).await {
            Err(Error::Rpc(data)) => assert_eq!((data.code, data.message.as_str()), (418, "teapot")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn close_all_applies_the_outcome() {
        let pending = Pending::default();
        let init = pending.register(&RequestId::from(1), "initialize").unwrap();
        let list = pending.register(&RequestId::from(2), "listTools").unwrap();
        pending.close_all(|method| {
            if method == "initialize" { Err(Error::StreamClosed) } else { Ok(Value::Null) }
        });
        assert!(wait(init).await.is_err());
        assert_eq!(wait(list).await.unwrap(), Value::Null);
    }
}
