//! MCP Client Core implementation
//!
//! [`Client`] wraps a [`ClientTransport`], assigns request ids, applies the
//! request timeout and decodes typed results for every protocol method.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{ Value, json };
use std::collections::HashMap;
use std::sync::atomic::{ AtomicI64, Ordering };
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{ debug, info, warn };

use crate::client::transport::ClientTransport;
use crate::errors::Error;
use crate::messages::RequestId;
use crate::protocol::{ Method, PROTOCOL_VERSION };
use crate::types::{
    CallToolParams,
    CancelParams,
    ClientCapabilities,
    GetPromptParams,
    GetPromptResult,
    Implementation,
    InitializeParams,
    InitializeResult,
    ListPromptsResult,
    ListResourceTemplatesResult,
    ListResourcesResult,
    ListToolsResult,
    ResourceContent,
};

/// Default request timeout in seconds
const DEFAULT_REQUEST_TIMEOUT: u64 = 30;

/// Configuration for the MCP client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Timeout for requests
    pub request_timeout: Duration,
    /// Sent as `clientInfo` on initialize
    pub client_info: Implementation,
    pub capabilities: ClientCapabilities,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT),
            client_info: Implementation::new("mcp-sdk-client", env!("CARGO_PKG_VERSION")),
            capabilities: ClientCapabilities::default(),
        }
    }
}

/// Builder for creating Client instances with custom configuration
pub struct ClientBuilder<T: ClientTransport> {
    transport: T,
    config: ClientConfig,
}

impl<T: ClientTransport> ClientBuilder<T> {
    /// Create a new client builder with the given transport
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            config: ClientConfig::default(),
        }
    }

    /// Set the request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Set the name and version reported to the server
    pub fn with_client_info(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.config.client_info = Implementation::new(name, version);
        self
    }

    pub fn with_capabilities(mut self, capabilities: ClientCapabilities) -> Self {
        self.config.capabilities = capabilities;
        self
    }

    /// Build the client
    pub fn build(self) -> Client<T> {
        Client::with_config(self.transport, self.config)
    }
}

/// MCP client over any transport
pub struct Client<T: ClientTransport> {
    transport: T,
    config: ClientConfig,
    next_id: AtomicI64,
    server: RwLock<Option<InitializeResult>>,
}

impl<T: ClientTransport> Client<T> {
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, ClientConfig::default())
    }

    pub fn with_config(transport: T, config: ClientConfig) -> Self {
        Self {
            transport,
            config,
            next_id: AtomicI64::new(1),
            server: RwLock::new(None),
        }
    }

    pub fn builder(transport: T) -> ClientBuilder<T> {
        ClientBuilder::new(transport)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Id the next request will carry
    pub fn next_request_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Send a request and decode its result
    pub async fn request<R>(&self, method: &str, params: Option<Value>) -> Result<R, Error>
        where R: DeserializeOwned
    {
        let id = self.next_request_id();
        let result = self.request_with_id(id, method, params).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Send a request under a caller-chosen id, so it can be cancelled
    pub async fn request_with_id(
        &self,
        id: RequestId,
        method: &str,
        params: Option<Value>
    ) -> Result<Value, Error> {
        debug!(%id, method, "Sending request");
        match timeout(self.config.request_timeout, self.transport.request(id.clone(), method, params)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(%id, method, "Request timed out");
                Err(Error::Timeout(format!("{} timed out after {:?}", method, self.config.request_timeout)))
            }
        }
    }

    /// Send a notification
    pub async fn notify<P: Serialize>(&self, method: &str, params: Option<P>) -> Result<(), Error> {
        let params = params.map(serde_json::to_value).transpose()?;
        self.transport.notify(method, params).await
    }

    /// Negotiate with the server and remember what it reported
    pub async fn initialize(&self) -> Result<InitializeResult, Error> {
        let params = InitializeParams::new(
            self.config.client_info.clone(),
            self.config.capabilities.clone()
        );
        let result: InitializeResult = self.request(
            Method::Initialize.as_str(),
            Some(serde_json::to_value(params)?)
        ).await?;
        if result.protocol_version != PROTOCOL_VERSION {
            warn!(
                "Server speaks protocol {}, client speaks {}",
                result.protocol_version,
                PROTOCOL_VERSION
            );
        }
        info!("Connected to {} {}", result.server_info.name, result.server_info.version);
        *self.server.write().await = Some(result.clone());
        Ok(result)
    }

    /// Tell the server initialization is complete
    pub async fn initialized(&self) -> Result<(), Error> {
        self.transport.notify(Method::Initialized.as_str(), None).await
    }

    /// `initialize` followed by `initialized`
    pub async fn connect(&self) -> Result<InitializeResult, Error> {
        let result = self.initialize().await?;
        self.initialized().await?;
        Ok(result)
    }

    /// What the server reported on initialize
    pub async fn server_info(&self) -> Option<InitializeResult> {
        self.server.read().await.clone()
    }

    pub async fn ping(&self) -> Result<(), Error> {
        let _: Value = self.request(Method::Ping.as_str(), None).await?;
        Ok(())
    }

    pub async fn list_tools(&self) -> Result<ListToolsResult, Error> {
        self.request(Method::ListTools.as_str(), None).await
    }

    /// Call a tool; returns whatever the tool produced
    pub async fn call_tool(&self, name: &str, args: Value) -> Result<Value, Error> {
        let params = serde_json::to_value(CallToolParams::new(name, args))?;
        self.request(Method::CallTool.as_str(), Some(params)).await
    }

    pub async fn list_prompts(&self) -> Result<ListPromptsResult, Error> {
        self.request(Method::ListPrompts.as_str(), None).await
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: HashMap<String, String>
    ) -> Result<GetPromptResult, Error> {
        let params = GetPromptParams {
            name: name.to_string(),
            arguments,
        };
        self.request(Method::GetPrompt.as_str(), Some(serde_json::to_value(params)?)).await
    }

    pub async fn list_resources(&self) -> Result<ListResourcesResult, Error> {
        self.request(Method::ListResources.as_str(), None).await
    }

    pub async fn list_resource_templates(&self) -> Result<ListResourceTemplatesResult, Error> {
        self.request(Method::ListResourceTemplates.as_str(), None).await
    }

    /// Read a resource's bytes and MIME type
    pub async fn read_resource(&self, uri: &str) -> Result<ResourceContent, Error> {
        let id = self.next_request_id();
        match timeout(self.config.request_timeout, self.transport.read_resource(id, uri)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!("readResource {} timed out", uri))),
        }
    }

    /// Ask the server to cancel an in-flight request
    pub async fn cancel(&self, id: &RequestId) -> Result<(), Error> {
        let params = serde_json::to_value(CancelParams { id: id.clone() })?;
        self.transport.notify(Method::Cancel.as_str(), Some(params)).await
    }

    pub async fn close(&self) -> Result<(), Error> {
        self.server.write().await.take();
        self.transport.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records calls and answers from a fixed table
    #[derive(Default)]
    struct Scripted {
        calls: Mutex<Vec<(String, Option<Value>)>>,
        answers: HashMap<&'static str, Value>,
    }

    #[async_trait]
    impl ClientTransport for Scripted {
        async fn request(&self, _id: RequestId, method: &str, params: Option<Value>) -> Result<Value, Error> {
            self.calls.lock().unwrap().push((method.to_string(), params));
            if method == "slow" {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            self.answers.get(method).cloned().ok_or_else(|| Error::rpc(404, "unknown"))
        }

        async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), Error> {
            self.calls.lock().unwrap().push((method.to_string(), params));
            Ok(())
        }

        async fn close(&self) -> Result<(), Error> {
            Ok(())
        }
    }

    fn client() -> Client<Scripted> {
        let mut transport = Scripted::default();
        transport.answers.insert(
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "serverInfo": {"name": "test", "version": "1"},
                "capabilities": {}
            })
        );
        transport.answers.insert("callTool", json!({"result": 5}));
        Client::builder(transport).with_request_timeout(Duration::from_secs(1)).build()
    }

    #[tokio::test]
    async fn connect_sends_initialize_then_initialized() {
        let client = client();
        let result = client.connect().await.unwrap();
        assert_eq!(result.server_info.name, "test");
        assert!(client.server_info().await.is_some());

        let calls = client.transport().calls.lock().unwrap().clone();
        assert_eq!(calls[0].0, "initialize");
        assert_eq!(calls[0].1.as_ref().unwrap()["clientInfo"]["name"], "mcp-sdk-client");
        assert_eq!(calls[1], ("initialized".to_string(), None));
    }

    #[tokio::test]
    async fn call_tool_sends_name_and_args() {
        let client = client();
        let result = client.call_tool("add", json!({"a": 2, "b": 3})).await.unwrap();
        assert_eq!(result, json!({"result": 5}));
        let calls = client.transport().calls.lock().unwrap().clone();
        assert_eq!(calls[0].1, Some(json!({"name": "add", "args": {"a": 2, "b": 3}})));
    }

    #[tokio::test]
    async fn errors_keep_their_code() {
        let err = client().list_tools().await.unwrap_err();
        assert_eq!(err.code(), 404);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_requests_time_out() {
        let err = client().request::<Value>("slow", None).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn cancel_names_the_request() {
        let client = client();
        client.cancel(&RequestId::from(9)).await.unwrap();
        let calls = client.transport().calls.lock().unwrap().clone();
        assert_eq!(calls[0], ("cancel".to_string(), Some(json!({"id": 9}))));
    }
}
