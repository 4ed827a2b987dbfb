//! Service provider for server components
//!
//! The service provider is a central registry of the tool, prompt and resource
//! registries. When a server registers tools, prompts or resources through its
//! builder, the provider installs default handlers that serve them.

pub mod prompts;
pub mod resources;
pub mod tools;

use serde_json::Value;
use std::sync::Arc;

use crate::protocol::Method;
use crate::server::context::RequestContext;
use crate::server::handlers::HandlerTable;
use crate::server::services::prompts::PromptRegistry;
use crate::server::services::resources::ResourceRegistry;
use crate::server::services::tools::ToolRegistry;
use crate::types::{ CallToolParams, GetPromptParams, ReadResourceParams };

/// Service provider for server handlers
#[derive(Clone, Default)]
pub struct ServiceProvider {
    /// Tool registry
    tool_registry: Arc<ToolRegistry>,

    /// Prompt registry
    prompt_registry: Arc<PromptRegistry>,

    /// Resource registry
    resource_registry: Arc<ResourceRegistry>,
}

impl ServiceProvider {
    /// Create a new service provider
    pub fn new(
        tool_registry: Arc<ToolRegistry>,
        prompt_registry: Arc<PromptRegistry>,
        resource_registry: Arc<ResourceRegistry>
    ) -> Self {
        Self {
            tool_registry,
            prompt_registry,
            resource_registry,
        }
    }

    /// Get the tool registry
    pub fn tool_registry(&self) -> &Arc<ToolRegistry> {
        &self.tool_registry
    }

    /// Get the prompt registry
    pub fn prompt_registry(&self) -> &Arc<PromptRegistry> {
        &self.prompt_registry
    }

    /// Get the resource registry
    pub fn resource_registry(&self) -> &Arc<ResourceRegistry> {
        &self.resource_registry
    }

    /// Install registry-backed handlers for every non-empty registry, leaving
    /// handlers the application set explicitly untouched
    pub async fn install(&self, table: &HandlerTable) {
        if !self.tool_registry.is_empty().await {
            if !table.contains(Method::ListTools.as_str()) {
                let tools = self.tool_registry.clone();
                table.set_list_tools_handler(move |_ctx: RequestContext, _params: Value| {
                    let tools = tools.clone();
                    async move { Ok(tools.list().await) }
                });
            }
            if !table.contains(Method::CallTool.as_str()) {
                let tools = self.tool_registry.clone();
                table.set_call_tool_handler(move |ctx, params: CallToolParams| {
                    let tools = tools.clone();
                    async move { tools.call(ctx, params).await }
                });
            }
        }

        if !self.prompt_registry.is_empty().await {
            if !table.contains(Method::ListPrompts.as_str()) {
                let prompts = self.prompt_registry.clone();
                table.set_list_prompts_handler(move |_ctx, _params: Value| {
                    let prompts = prompts.clone();
                    async move { Ok(prompts.list().await) }
                });
            }
            if !table.contains(Method::GetPrompt.as_str()) {
                let prompts = self.prompt_registry.clone();
                table.set_get_prompt_handler(move |ctx, params: GetPromptParams| {
                    let prompts = prompts.clone();
                    async move { prompts.get(ctx, params).await }
                });
            }
        }

        if !self.resource_registry.is_empty().await {
            if !table.contains(Method::ListResources.as_str()) {
                let resources = self.resource_registry.clone();
                table.set_list_resources_handler(move |_ctx, _params: Value| {
                    let resources = resources.clone();
                    async move { Ok(resources.list().await) }
                });
            }
            if !table.contains(Method::ReadResource.as_str()) {
                let resources = self.resource_registry.clone();
                table.set_read_resource_handler(move |_ctx, params: ReadResourceParams| {
                    let resources = resources.clone();
                    async move { resources.read(&params.uri).await }
                });
            }
            if !table.contains(Method::ListResourceTemplates.as_str()) {
                let resources = self.resource_registry.clone();
                table.set_list_resource_templates_handler(move |_ctx, _params: Value| {
                    let resources = resources.clone();
                    async move { Ok(resources.list_templates().await) }
                });
            }
        }
    }
}
