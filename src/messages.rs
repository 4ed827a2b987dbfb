//! MCP Message Types
//!
//! This module defines the envelope that carries one protocol message on every
//! transport. A request or notification carries `method` and optional `params`;
//! a response carries exactly one of `result` or `error` and echoes the request
//! `id` when one was supplied.

use serde::{ Deserialize, Deserializer, Serialize };
use serde_json::Value;
use std::fmt;

use crate::errors::{ Error, ErrorData };

/// Correlation token for a request, either a number or a string
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl RequestId {
    /// String form used to match `cancel` notifications against in-flight requests
    pub fn key(&self) -> String {
        match self {
            RequestId::Number(n) => n.to_string(),
            RequestId::String(s) => s.clone(),
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        RequestId::Number(value)
    }
}

impl From<i32> for RequestId {
    fn from(value: i32) -> Self {
        RequestId::Number(value.into())
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        RequestId::String(value.to_string())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        RequestId::String(value)
    }
}

/// Keep an explicit `null` as `Some(Value::Null)` so that a success response
/// with a null result still has its `result` member
fn deserialize_some<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
    where D: Deserializer<'de>
{
    Value::deserialize(deserializer).map(Some)
}

/// The JSON object carrying one protocol message on the wire
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    /// Correlation id, echoed on the response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    /// Method name, present on requests and notifications
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Method parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Successful result
    #[serde(default, deserialize_with = "deserialize_some", skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorData>,
}

impl Envelope {
    /// Build a request envelope
    pub fn request(id: Option<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id,
            method: Some(method.into()),
            params,
            ..Default::default()
        }
    }

    /// Build a notification envelope
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::request(None, method, params)
    }

    /// Build a success response
    pub fn success(id: Option<RequestId>, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            ..Default::default()
        }
    }

    /// Build a failure response from any error
    pub fn failure(id: Option<RequestId>, error: &Error) -> Self {
        Self {
            id,
            error: Some(error.to_error_data()),
            ..Default::default()
        }
    }

    /// Whether this envelope is request-shaped (has a method)
    pub fn is_request(&self) -> bool {
        self.method.is_some()
    }

    /// Whether this envelope is a response
    pub fn is_response(&self) -> bool {
        self.method.is_none() && (self.result.is_some() || self.error.is_some())
    }

    /// Turn a response into the result it carries, re-raising a structured error
    pub fn into_result(self) -> Result<Value, Error> {
        if let Some(error) = self.error {
            return Err(Error::Rpc(error));
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}
