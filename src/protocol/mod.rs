//! Protocol constants and the method registry

pub mod method;

pub use method::Method;

/// Protocol version exchanged in the `initialize` handshake
pub const PROTOCOL_VERSION: &str = "1.0";

/// HTTP header carrying the session id
pub const SESSION_ID_HEADER: &str = "Mcp-Session-Id";

/// HTTP header carrying the last event id seen by an SSE client
pub const LAST_EVENT_ID_HEADER: &str = "Last-Event-ID";

/// Server-to-client notification carrying progress snapshots
pub const PROGRESS_NOTIFICATION: &str = "progress";
