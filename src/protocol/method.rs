//! Type-safe definitions for the protocol method identifiers.
//! This module provides a structured representation of every method the
//! dispatcher knows how to route.

use serde::{ Deserialize, Serialize };
use std::fmt::{ self, Display };
use std::str::FromStr;

use crate::errors::Error;

/// Represents the methods defined by the protocol.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Method {
    /// Handshake creating a session
    #[serde(rename = "initialize")]
    Initialize,

    /// Notification that the client is ready
    #[serde(rename = "initialized")]
    Initialized,

    /// Simple ping to check connection
    #[serde(rename = "ping")]
    Ping,

    /// Request cancellation notification
    #[serde(rename = "cancel")]
    Cancel,

    /// List available tools
    #[serde(rename = "listTools")]
    ListTools,

    /// Call a tool
    #[serde(rename = "callTool")]
    CallTool,

    /// List available prompts
    #[serde(rename = "listPrompts")]
    ListPrompts,

    /// Get a specific prompt
    #[serde(rename = "getPrompt")]
    GetPrompt,

    /// List available resources
    #[serde(rename = "listResources")]
    ListResources,

    /// Read a specific resource
    #[serde(rename = "readResource")]
    ReadResource,

    /// List resource templates
    #[serde(rename = "listResourceTemplates")]
    ListResourceTemplates,
}

impl Method {
    /// Every method, in registry order
    pub const ALL: [Method; 11] = [
        Method::Initialize,
        Method::Initialized,
        Method::Ping,
        Method::Cancel,
        Method::ListTools,
        Method::CallTool,
        Method::ListPrompts,
        Method::GetPrompt,
        Method::ListResources,
        Method::ReadResource,
        Method::ListResourceTemplates,
    ];

    /// Get the string representation of the method
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Initialize => "initialize",
            Method::Initialized => "initialized",
            Method::Ping => "ping",
            Method::Cancel => "cancel",
            Method::ListTools => "listTools",
            Method::CallTool => "callTool",
            Method::ListPrompts => "listPrompts",
            Method::GetPrompt => "getPrompt",
            Method::ListResources => "listResources",
            Method::ReadResource => "readResource",
            Method::ListResourceTemplates => "listResourceTemplates",
        }
    }

    /// Look a method up by its wire name
    pub fn parse(name: &str) -> Option<Method> {
        Method::ALL.iter().copied().find(|m| m.as_str() == name)
    }

    /// Check if this method is a notification. Notifications are recognised by
    /// name, never by the absence of an id, and never produce a response.
    pub fn is_notification(&self) -> bool {
        matches!(self, Method::Initialized | Method::Cancel)
    }

    /// Check if this method is a request that requires a response
    pub fn is_request(&self) -> bool {
        !self.is_notification()
    }

    /// Methods that may run before the session is initialized
    pub fn allowed_before_initialize(&self) -> bool {
        matches!(self, Method::Initialize | Method::Ping | Method::Cancel)
    }

    /// Check if this method produces raw bytes instead of JSON
    pub fn returns_bytes(&self) -> bool {
        matches!(self, Method::ReadResource)
    }

    /// Check if this method is related to tools
    pub fn is_tool_method(&self) -> bool {
        matches!(self, Method::ListTools | Method::CallTool)
    }

    /// Check if this method is related to prompts
    pub fn is_prompt_method(&self) -> bool {
        matches!(self, Method::ListPrompts | Method::GetPrompt)
    }

    /// Check if this method is related to resources
    pub fn is_resource_method(&self) -> bool {
        matches!(
            self,
            Method::ListResources | Method::ReadResource | Method::ListResourceTemplates
        )
    }
}

impl Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Method::parse(s).ok_or_else(|| Error::HandlerNotRegistered(s.to_string()))
    }
}
