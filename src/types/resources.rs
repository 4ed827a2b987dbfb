//! MCP Resource Types
//!
//! This module defines the resources a server exposes and the content returned
//! by `readResource`. Resource content is raw bytes plus a MIME type; HTTP
//! writes it as the response body, framed transports wrap it in a typed
//! `resource` chunk with a base64 `blob`.

use base64::{ Engine as _, engine::general_purpose::STANDARD as BASE64 };
use bytes::Bytes;
use serde::{ Deserialize, Serialize };
use serde_json::{ json, Value };

use crate::errors::Error;

/// MIME type used when none is given and none can be guessed
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// A resource advertised by a server
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Resource {
    /// URI of the resource
    pub uri: String,
    /// Human-readable name
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl Resource {
    pub fn new(uri: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            name: name.into(),
            description: None,
            mime_type: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }
}

/// A parameterized family of resources
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ResourceTemplate {
    /// RFC 6570 URI template
    #[serde(rename = "uriTemplate")]
    pub uri_template: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl ResourceTemplate {
    pub fn new(uri_template: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uri_template: uri_template.into(),
            name: name.into(),
            description: None,
            mime_type: None,
        }
    }
}

/// Parameters for `readResource`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ReadResourceParams {
    pub uri: String,
}

/// Result of `listResources`
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ListResourcesResult {
    pub resources: Vec<Resource>,
}

/// Result of `listResourceTemplates`
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ListResourceTemplatesResult {
    #[serde(rename = "resourceTemplates")]
    pub resource_templates: Vec<ResourceTemplate>,
}

/// Raw content of a resource
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceContent {
    pub uri: String,
    pub mime_type: String,
    pub bytes: Bytes,
}

impl ResourceContent {
    /// Content with a MIME type guessed from the URI
    pub fn new(uri: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        let uri = uri.into();
        let mime_type = guess_mime_type(&uri);
        Self {
            uri,
            mime_type,
            bytes: bytes.into(),
        }
    }

    /// Content with an explicit MIME type
    pub fn with_mime_type(
        uri: impl Into<String>,
        mime_type: impl Into<String>,
        bytes: impl Into<Bytes>
    ) -> Self {
        Self {
            uri: uri.into(),
            mime_type: mime_type.into(),
            bytes: bytes.into(),
        }
    }

    /// UTF-8 view of the bytes for textual MIME types
    pub fn text(&self) -> Option<&str> {
        if !is_textual(&self.mime_type) {
            return None;
        }
        std::str::from_utf8(&self.bytes).ok()
    }

    /// Wrap the content in a typed chunk for framed transports
    pub fn to_chunk(&self) -> Value {
        let mut chunk =
            json!({
            "type": "resource",
            "uri": self.uri,
            "mimeType": self.mime_type,
            "blob": BASE64.encode(&self.bytes),
        });
        if let Some(text) = self.text() {
            chunk["text"] = Value::String(text.to_string());
        }
        chunk
    }

    /// Recover content from a typed resource chunk
    pub fn from_chunk(chunk: &Value) -> Result<Self, Error> {
        if chunk.get("type").and_then(Value::as_str) != Some("resource") {
            return Err(Error::Protocol("expected a resource chunk".to_string()));
        }
        let uri = chunk
            .get("uri")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Protocol("resource chunk without uri".to_string()))?;
        let mime_type = chunk
            .get("mimeType")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_MIME_TYPE);
        let bytes = match chunk.get("blob").and_then(Value::as_str) {
            Some(blob) =>
                BASE64.decode(blob).map_err(|e|
                    Error::Protocol(format!("invalid resource blob: {}", e))
                )?,
            None =>
                chunk
                    .get("text")
                    .and_then(Value::as_str)
                    .map(|t| t.as_bytes().to_vec())
                    .unwrap_or_default(),
        };
        Ok(Self::with_mime_type(uri, mime_type, bytes))
    }
}

/// Guess a MIME type from the path part of a URI
pub fn guess_mime_type(uri: &str) -> String {
    let path = uri.split(['?', '#']).next().unwrap_or(uri);
    mime_guess::from_path(path).first_raw().unwrap_or(DEFAULT_MIME_TYPE).to_string()
}

fn is_textual(mime_type: &str) -> bool {
    mime_type.starts_with("text/") ||
        mime_type.ends_with("json") ||
        mime_type.ends_with("xml") ||
        mime_type == "application/javascript"
}
