//! Handler Table
//!
//! Per-server registration of user callbacks for each protocol method. Typed
//! setters fix each handler's parameter and result types at compile time; the
//! table stores them type-erased behind [`MethodHandler`].

use async_trait::async_trait;
use serde::{ Serialize, de::DeserializeOwned };
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{ Arc, RwLock };

use crate::errors::Error;
use crate::protocol::Method;
use crate::server::context::RequestContext;
use crate::types::{
    CallToolParams,
    GetPromptParams,
    GetPromptResult,
    ListPromptsResult,
    ListResourceTemplatesResult,
    ListResourcesResult,
    ListToolsResult,
    ReadResourceParams,
    ResourceContent,
};

/// What a handler produced
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutput {
    /// A JSON result
    Json(Value),
    /// Raw resource bytes with a MIME type
    Resource(ResourceContent),
}

/// Handler trait for protocol methods
#[async_trait]
pub trait MethodHandler: Send + Sync {
    /// Handle a request with its context and raw parameters
    async fn handle(&self, ctx: RequestContext, params: Value) -> Result<HandlerOutput, Error>;
}

/// Type-safe wrapper for method handlers
struct TypedHandler<F, P, R> {
    handler: F,
    _marker: std::marker::PhantomData<fn(P) -> R>,
}

impl<F, P, R> TypedHandler<F, P, R> {
    fn new(handler: F) -> Self {
        Self {
            handler,
            _marker: std::marker::PhantomData,
        }
    }
}

fn decode_params<P: DeserializeOwned>(params: Value) -> Result<P, Error> {
    serde_json::from_value(params).map_err(|e| Error::InvalidParams(e.to_string()))
}

#[async_trait]
impl<F, Fut, P, R> MethodHandler
    for TypedHandler<F, P, R>
    where
        F: Fn(RequestContext, P) -> Fut + Send + Sync,
        Fut: Future<Output = Result<R, Error>> + Send + 'static,
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static
{
    async fn handle(&self, ctx: RequestContext, params: Value) -> Result<HandlerOutput, Error> {
        let params: P = decode_params(params)?;
        let result = (self.handler)(ctx, params).await?;
        Ok(HandlerOutput::Json(serde_json::to_value(result)?))
    }
}

/// Wrapper for the one handler that produces bytes instead of JSON
struct ResourceHandler<F> {
    handler: F,
}

#[async_trait]
impl<F, Fut> MethodHandler
    for ResourceHandler<F>
    where
        F: Fn(RequestContext, ReadResourceParams) -> Fut + Send + Sync,
        Fut: Future<Output = Result<ResourceContent, Error>> + Send + 'static
{
    async fn handle(&self, ctx: RequestContext, params: Value) -> Result<HandlerOutput, Error> {
        let params: ReadResourceParams = decode_params(params)?;
        let content = (self.handler)(ctx, params).await?;
        Ok(HandlerOutput::Resource(content))
    }
}

/// Method name to handler map
#[derive(Default)]
pub struct HandlerTable {
    handlers: RwLock<HashMap<String, Arc<dyn MethodHandler>>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look a handler up by method name
    pub fn get(&self, method: &str) -> Option<Arc<dyn MethodHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(method)
            .cloned()
    }

    pub fn contains(&self, method: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(method)
    }

    /// Register a type-erased handler, replacing any previous one
    pub fn insert(&self, method: impl Into<String>, handler: Arc<dyn MethodHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(method.into(), handler);
    }

    /// Register a typed handler under any method name
    pub fn set_handler<F, Fut, P, R>(&self, method: impl Into<String>, handler: F)
        where
            F: Fn(RequestContext, P) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = Result<R, Error>> + Send + 'static,
            P: DeserializeOwned + Send + 'static,
            R: Serialize + Send + 'static
    {
        self.insert(method, Arc::new(TypedHandler::new(handler)));
    }

    /// Hook run when the client sends `initialized`
    pub fn set_initialized_handler<F, Fut>(&self, handler: F)
        where
            F: Fn(RequestContext, Value) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = Result<(), Error>> + Send + 'static
    {
        self.set_handler(Method::Initialized.as_str(), handler);
    }

    pub fn set_ping_handler<F, Fut>(&self, handler: F)
        where
            F: Fn(RequestContext, Value) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = Result<Value, Error>> + Send + 'static
    {
        self.set_handler(Method::Ping.as_str(), handler);
    }

    pub fn set_list_tools_handler<F, Fut>(&self, handler: F)
        where
            F: Fn(RequestContext, Value) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = Result<ListToolsResult, Error>> + Send + 'static
    {
        self.set_handler(Method::ListTools.as_str(), handler);
    }

    /// The tool result is the handler's JSON, returned as-is
    pub fn set_call_tool_handler<F, Fut>(&self, handler: F)
        where
            F: Fn(RequestContext, CallToolParams) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = Result<Value, Error>> + Send + 'static
    {
        self.set_handler(Method::CallTool.as_str(), handler);
    }

    pub fn set_list_prompts_handler<F, Fut>(&self, handler: F)
        where
            F: Fn(RequestContext, Value) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = Result<ListPromptsResult, Error>> + Send + 'static
    {
        self.set_handler(Method::ListPrompts.as_str(), handler);
    }

    pub fn set_get_prompt_handler<F, Fut>(&self, handler: F)
        where
            F: Fn(RequestContext, GetPromptParams) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = Result<GetPromptResult, Error>> + Send + 'static
    {
        self.set_handler(Method::GetPrompt.as_str(), handler);
    }

    pub fn set_list_resources_handler<F, Fut>(&self, handler: F)
        where
            F: Fn(RequestContext, Value) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = Result<ListResourcesResult, Error>> + Send + 'static
    {
        self.set_handler(Method::ListResources.as_str(), handler);
    }

    pub fn set_read_resource_handler<F, Fut>(&self, handler: F)
        where
            F: Fn(RequestContext, ReadResourceParams) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = Result<ResourceContent, Error>> + Send + 'static
    {
        self.insert(Method::ReadResource.as_str(), Arc::new(ResourceHandler { handler }));
    }

    pub fn set_list_resource_templates_handler<F, Fut>(&self, handler: F)
        where
            F: Fn(RequestContext, Value) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = Result<ListResourceTemplatesResult, Error>> + Send + 'static
    {
        self.set_handler(Method::ListResourceTemplates.as_str(), handler);
    }
}
