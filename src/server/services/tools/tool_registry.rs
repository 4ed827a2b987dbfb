use futures::future::BoxFuture;
use serde::{ Serialize, de::DeserializeOwned };
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{ debug, info };

use crate::errors::Error;
use crate::server::context::RequestContext;
use crate::types::{ CallToolParams, ListToolsResult, Tool };

/// Handler type for in-process tools
pub type ToolHandler = Arc<
    dyn (Fn(RequestContext, Value) -> BoxFuture<'static, Result<Value, Error>>) + Send + Sync
>;

/// A registered tool with its handler
#[derive(Clone)]
pub struct ToolDefinition {
    pub tool: Tool,
    handler: ToolHandler,
}

impl ToolDefinition {
    pub fn new(tool: Tool, handler: ToolHandler) -> Self {
        Self { tool, handler }
    }

    /// Wrap an async function taking raw JSON arguments
    pub fn from_fn<F, Fut>(tool: Tool, handler: F) -> Self
        where
            F: Fn(RequestContext, Value) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = Result<Value, Error>> + Send + 'static
    {
        let handler: ToolHandler = Arc::new(
            move |ctx: RequestContext, args: Value| -> BoxFuture<'static, Result<Value, Error>> {
                Box::pin(handler(ctx, args))
            }
        );
        Self::new(tool, handler)
    }

    /// Wrap an async function with typed arguments and result
    pub fn typed<A, R, F, Fut>(tool: Tool, handler: F) -> Self
        where
            A: DeserializeOwned + Send + 'static,
            R: Serialize + Send + 'static,
            F: Fn(RequestContext, A) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = Result<R, Error>> + Send + 'static
    {
        let typed = Arc::new(handler);
        let handler: ToolHandler = Arc::new(
            move |ctx: RequestContext, args: Value| -> BoxFuture<'static, Result<Value, Error>> {
                let typed = typed.clone();
                Box::pin(async move {
                    let args: A = serde_json
                        ::from_value(args)
                        .map_err(|e| Error::InvalidParams(e.to_string()))?;
                    let result = typed(ctx, args).await?;
                    Ok(serde_json::to_value(result)?)
                })
            }
        );
        Self::new(tool, handler)
    }
}

/// Registry of tools in registration order
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<Vec<ToolDefinition>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool; names are unique within a server
    pub async fn register(&self, definition: ToolDefinition) -> Result<(), Error> {
        let mut tools = self.tools.write().await;

        // Prevent duplicate tools
        if tools.iter().any(|t| t.tool.name == definition.tool.name) {
            return Err(Error::Conflict(format!("Tool already exists: {}", definition.tool.name)));
        }

        info!(tool = %definition.tool.name, "Registered tool");
        tools.push(definition);
        Ok(())
    }

    /// Remove a tool; returns whether it existed
    pub async fn unregister(&self, name: &str) -> bool {
        let mut tools = self.tools.write().await;
        let before = tools.len();
        tools.retain(|t| t.tool.name != name);
        tools.len() != before
    }

    pub async fn is_empty(&self) -> bool {
        self.tools.read().await.is_empty()
    }

    /// All tools, for `listTools`
    pub async fn list(&self) -> ListToolsResult {
        let tools = self.tools.read().await;
        ListToolsResult {
            tools: tools
                .iter()
                .map(|t| t.tool.clone())
                .collect(),
        }
    }

    /// Run a tool, for `callTool`
    pub async fn call(&self, ctx: RequestContext, params: CallToolParams) -> Result<Value, Error> {
        let handler = {
            let tools = self.tools.read().await;
            tools
                .iter()
                .find(|t| t.tool.name == params.name)
                .map(|t| t.handler.clone())
                .ok_or_else(|| Error::NotFound(format!("Tool not found: {}", params.name)))?
        };
        debug!(tool = %params.name, "Calling tool");
        handler(ctx, params.args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct EchoArgs {
        message: String,
    }

    fn echo() -> ToolDefinition {
        ToolDefinition::typed(Tool::new("echo"), |_ctx, args: EchoArgs| async move {
            Ok(json!({"message": args.message, "echo": true}))
        })
    }

    #[tokio::test]
    async fn registered_tools_are_listed_and_called() {
        let registry = ToolRegistry::new();
        registry.register(echo()).await.unwrap();

        assert_eq!(registry.list().await.tools[0].name, "echo");
        let result = registry
            .call(
                RequestContext::detached("callTool"),
                CallToolParams::new("echo", json!({"message": "hi"}))
            ).await
            .unwrap();
        assert_eq!(result, json!({"message": "hi", "echo": true}));
    }

    #[tokio::test]
    async fn duplicate_names_conflict() {
        let registry = ToolRegistry::new();
        registry.register(echo()).await.unwrap();
        assert_eq!(registry.register(echo()).await.unwrap_err().code(), 409);
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let registry = ToolRegistry::new();
        let err = registry
            .call(RequestContext::detached("callTool"), CallToolParams::new("nope", json!({}))).await
            .unwrap_err();
        assert_eq!(err.code(), 404);
    }

    #[tokio::test]
    async fn typed_tools_reject_bad_arguments() {
        let registry = ToolRegistry::new();
        registry.register(echo()).await.unwrap();
        let err = registry
            .call(RequestContext::detached("callTool"), CallToolParams::new("echo", json!({"m": 1}))).await
            .unwrap_err();
        assert_eq!(err.code(), 400);
    }
}
