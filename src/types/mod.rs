//! MCP Type Definitions
//!
//! This module re-exports the parameter and result shapes of every protocol
//! method, organized into submodules for initialization, prompts, resources
//! and tools.

pub mod initialize;
pub mod prompts;
pub mod resources;
pub mod tools;

use serde::{ Deserialize, Serialize };

use crate::messages::RequestId;

// Re-export common types from each module
pub use initialize::{
    CapabilityFlags,
    ClientCapabilities,
    Implementation,
    InitializeParams,
    InitializeResult,
    ServerCapabilities,
};
pub use prompts::{
    GetPromptParams,
    GetPromptResult,
    ListPromptsResult,
    Prompt,
    PromptArgument,
    PromptContent,
    PromptMessage,
    Role,
};
pub use resources::{
    ListResourceTemplatesResult,
    ListResourcesResult,
    ReadResourceParams,
    Resource,
    ResourceContent,
    ResourceTemplate,
};
pub use tools::{ CallToolParams, ListToolsResult, Tool };

/// Parameters of the `cancel` notification
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CancelParams {
    /// Id of the request to cancel
    pub id: RequestId,
}
