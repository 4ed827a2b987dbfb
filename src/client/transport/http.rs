//! HTTP Client Transport
//!
//! One POST per call, either to `<base>/mcp` with a full envelope or to
//! `<base>/<method>` with the parameters as body. The `Mcp-Session-Id`
//! returned by `initialize` is sent on every later request. Error bodies are
//! decoded back into the structured error the server produced.

use async_trait::async_trait;
use reqwest::header::{ CONTENT_TYPE, HeaderMap };
use serde::{ Deserialize, Serialize };
use serde_json::{ Value, json };
use std::fmt;
use std::sync::RwLock;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::client::transport::ClientTransport;
use crate::errors::{ Error, ErrorData };
use crate::messages::{ Envelope, RequestId };
use crate::protocol::{ Method, SESSION_ID_HEADER };
use crate::types::ResourceContent;

/// A server base URL. The scheme must be given explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerUrl(Url);

impl ServerUrl {
    pub fn parse(input: &str) -> Result<Self, Error> {
        if !(input.starts_with("http://") || input.starts_with("https://")) {
            return Err(
                Error::InvalidParams(
                    format!("server URL must start with http:// or https://: {}", input)
                )
            );
        }
        let mut url = Url::parse(input).map_err(|e|
            Error::InvalidParams(format!("invalid server URL {}: {}", input, e))
        )?;
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        Ok(Self(url))
    }

    /// URL of `path` below the base
    pub fn join(&self, path: &str) -> Result<Url, Error> {
        self.0
            .join(path.trim_start_matches('/'))
            .map_err(|e| Error::InvalidParams(format!("invalid path {}: {}", path, e)))
    }

    pub fn as_url(&self) -> &Url {
        &self.0
    }
}

impl fmt::Display for ServerUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// How calls are laid out on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum HttpStyle {
    /// `POST /mcp` with `{id, method, params}`
    #[default]
    Envelope,
    /// `POST /<method>` with the parameters as body
    PathPerMethod,
}

/// Options for the HTTP client transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpClientOptions {
    pub style: HttpStyle,
    /// Per-request timeout of the underlying HTTP client
    pub timeout: Duration,
}

impl Default for HttpClientOptions {
    fn default() -> Self {
        Self {
            style: HttpStyle::Envelope,
            timeout: Duration::from_secs(30),
        }
    }
}

pub struct HttpClientTransport {
    client: reqwest::Client,
    base: ServerUrl,
    options: HttpClientOptions,
    session_id: RwLock<Option<String>>,
}

impl HttpClientTransport {
    pub fn new(base_url: &str) -> Result<Self, Error> {
        Self::with_options(base_url, HttpClientOptions::default())
    }

    pub fn with_options(base_url: &str, options: HttpClientOptions) -> Result<Self, Error> {
        let client = reqwest::Client
            ::builder()
            .timeout(options.timeout)
            .build()
            .map_err(|e| Error::Transport(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base: ServerUrl::parse(base_url)?,
            options,
            session_id: RwLock::new(None),
        })
    }

    /// Session id returned by `initialize`
    pub fn session_id(&self) -> Option<String> {
        self.session_id
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Send one call and return the raw response
    async fn post(
        &self,
        id: Option<RequestId>,
        method: &str,
        params: Option<Value>
    ) -> Result<reqwest::Response, Error> {
        let request = match self.options.style {
            HttpStyle::Envelope => {
                let body = serde_json::to_vec(&Envelope::request(id, method, params))?;
                self.client.post(self.base.join("mcp")?).body(body)
            }
            HttpStyle::PathPerMethod => {
                let body = match params {
                    Some(params) => serde_json::to_vec(&params)?,
                    None => Vec::new(),
                };
                self.client.post(self.base.join(method)?).body(body)
            }
        };
        let mut request = request.header(CONTENT_TYPE, "application/json");
        if let Some(session_id) = self.session_id() {
            request = request.header(SESSION_ID_HEADER, session_id);
        }

        let response = request
            .send().await
            .map_err(|e| Error::Transport(format!("HTTP request failed: {}", e)))?;
        debug!(method, status = %response.status(), "HTTP response");

        if method == Method::Initialize.as_str() {
            self.remember_session(response.headers());
        }
        Ok(response)
    }

    fn remember_session(&self, headers: &HeaderMap) {
        let session_id = headers
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if session_id.is_some() {
            *self.session_id.write().unwrap_or_else(|p| p.into_inner()) = session_id;
        }
    }
}

/// Result of a JSON response, or the structured error it carries
async fn json_result(response: reqwest::Response) -> Result<Value, Error> {
    let status = response.status();
    if status == reqwest::StatusCode::ACCEPTED {
        return Ok(Value::Null);
    }
    let body = response
        .bytes().await
        .map_err(|e| Error::Transport(format!("Failed to read response: {}", e)))?;
    match serde_json::from_slice::<Envelope>(&body) {
        Ok(envelope) if envelope.error.is_some() || status.is_success() => envelope.into_result(),
        _ if status.is_success() => Err(Error::Protocol("response is not an envelope".to_string())),
        _ =>
            Err(
                Error::Rpc(
                    ErrorData::new(i32::from(status.as_u16()), String::from_utf8_lossy(&body))
                )
            ),
    }
}

#[async_trait]
impl ClientTransport for HttpClientTransport {
    async fn request(&self, id: RequestId, method: &str, params: Option<Value>) -> Result<Value, Error> {
        let response = self.post(Some(id), method, params).await?;
        json_result(response).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), Error> {
        let response = self.post(None, method, params).await?;
        json_result(response).await.map(|_| ())
    }

    /// `readResource` answers with the raw bytes and their content type. Only
    /// failures carry an envelope; a 2xx body is the resource itself, JSON
    /// resources included.
    async fn read_resource(&self, id: RequestId, uri: &str) -> Result<ResourceContent, Error> {
        let response = self.post(Some(id), Method::ReadResource.as_str(), Some(json!({ "uri": uri }))).await?;
        if !response.status().is_success() {
            return json_result(response).await.and_then(|chunk| ResourceContent::from_chunk(&chunk));
        }
        let mime_type = response.headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes().await
            .map_err(|e| Error::Transport(format!("Failed to read resource: {}", e)))?;
        Ok(match mime_type {
            Some(mime_type) => ResourceContent::with_mime_type(uri, mime_type, bytes),
            None => ResourceContent::new(uri, bytes),
        })
    }

    async fn close(&self) -> Result<(), Error> {
        self.session_id.write().unwrap_or_else(|p| p.into_inner()).take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_need_an_explicit_scheme() {
        assert!(ServerUrl::parse("localhost:8080").is_err());
        assert!(ServerUrl::parse("ftp://host").is_err());
        let url = ServerUrl::parse("http://127.0.0.1:8080/api").unwrap();
        assert_eq!(url.join("callTool").unwrap().as_str(), "http://127.0.0.1:8080/api/callTool");
        assert_eq!(url.join("/mcp").unwrap().as_str(), "http://127.0.0.1:8080/api/mcp");
    }
}
