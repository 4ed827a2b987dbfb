//! MCP Tool Types
//!
//! This module defines types related to tools, including `Tool` and
//! `CallToolParams`, which allow the AI application to perform actions or
//! computations via the server.

use schemars::JsonSchema;
use serde::{ Deserialize, Serialize };
use serde_json::{ json, Value };

/// Represents a tool advertised by a server
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Tool {
    /// Unique name of the tool
    pub name: String,
    /// Description of what the tool does
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema of the tool's arguments, opaque to the dispatcher
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

impl Tool {
    /// Create a tool accepting any object
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            input_schema: json!({ "type": "object" }),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Use a hand-written JSON schema for the arguments
    pub fn with_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    /// Derive the argument schema from a Rust type
    pub fn with_schema_for<T: JsonSchema>(mut self) -> Self {
        let schema = schemars::schema_for!(T);
        self.input_schema = serde_json::to_value(schema).unwrap_or_else(|_| json!({ "type": "object" }));
        self
    }
}

/// Parameters for `callTool`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CallToolParams {
    /// Name of the tool to call
    pub name: String,
    /// Arguments passed to the tool
    #[serde(default, alias = "arguments")]
    pub args: Value,
}

impl CallToolParams {
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

/// Result of `listTools`
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ListToolsResult {
    pub tools: Vec<Tool>,
}
