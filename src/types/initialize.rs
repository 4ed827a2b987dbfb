//! MCP Initialization Types
//!
//! This module defines types related to the initialization phase of the protocol,
//! such as `InitializeParams` and `InitializeResult`, and the capability sets the
//! two peers exchange during the handshake.

use schemars::JsonSchema;
use serde::{ Deserialize, Serialize };
use serde_json::{ Map, Value };

use crate::protocol::PROTOCOL_VERSION;

/// Information about an implementation (client or server)
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, JsonSchema)]
pub struct Implementation {
    /// Name of the implementation
    pub name: String,
    /// Version of the implementation
    pub version: String,
}

impl Implementation {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

/// Flags a capability sub-object may advertise. An empty object means the
/// capability is supported with defaults.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq, JsonSchema)]
pub struct CapabilityFlags {
    /// Peer emits list-changed notifications
    #[serde(rename = "listChanged", skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
    /// Peer supports subscriptions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<bool>,
}

impl CapabilityFlags {
    /// Supported with `listChanged: true`
    pub fn list_changed() -> Self {
        Self {
            list_changed: Some(true),
            subscribe: None,
        }
    }
}

/// Client capabilities
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, JsonSchema)]
pub struct ClientCapabilities {
    /// Root capabilities
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roots: Option<CapabilityFlags>,
    /// Sampling capabilities
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling: Option<CapabilityFlags>,
    /// Logging capabilities
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<CapabilityFlags>,
    /// Experimental capabilities
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<Map<String, Value>>,
}

/// Server capabilities
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, JsonSchema)]
pub struct ServerCapabilities {
    /// Tool capabilities
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<CapabilityFlags>,
    /// Prompt capabilities
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompts: Option<CapabilityFlags>,
    /// Resource capabilities
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<CapabilityFlags>,
    /// Logging capabilities
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<CapabilityFlags>,
    /// Experimental capabilities
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<Map<String, Value>>,
}

/// Parameters for the initialize request
#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema)]
pub struct InitializeParams {
    /// The version of the protocol the client speaks
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    /// Information about the client implementation
    #[serde(rename = "clientInfo")]
    pub client_info: Implementation,
    /// Client capabilities for feature negotiation
    #[serde(default)]
    pub capabilities: ClientCapabilities,
}

impl InitializeParams {
    pub fn new(client_info: Implementation, capabilities: ClientCapabilities) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            client_info,
            capabilities,
        }
    }
}

/// Result of the initialize request
#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema)]
pub struct InitializeResult {
    /// The protocol version spoken by the server
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    /// Information about the server implementation
    #[serde(rename = "serverInfo")]
    pub server_info: Implementation,
    /// Server capabilities for feature negotiation
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    /// Optional instructions for the client
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    /// Session id assigned by the server
    #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn initialize_params_parse_from_wire() {
        let params: InitializeParams = serde_json
            ::from_value(
                json!({
                "protocolVersion": "1.0",
                "clientInfo": {"name": "t", "version": "1"},
                "capabilities": {}
            })
            )
            .unwrap();
        assert_eq!(params.client_info, Implementation::new("t", "1"));
        assert_eq!(params.capabilities, ClientCapabilities::default());
    }

    #[test]
    fn absent_capabilities_are_not_serialized() {
        let caps = ServerCapabilities {
            tools: Some(CapabilityFlags::default()),
            ..Default::default()
        };
        assert_eq!(serde_json::to_value(&caps).unwrap(), json!({"tools": {}}));
    }
}
