//! Tool Support
//!
//! This module provides tool registration and execution for the default
//! `listTools` and `callTool` handlers.

pub mod tool_registry;

// Re-export commonly used types
pub use tool_registry::{ ToolDefinition, ToolHandler, ToolRegistry };
