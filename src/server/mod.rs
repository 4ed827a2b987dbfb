//! Server module for request dispatch and business logic
//!
//! This module contains the dispatcher, the handler table, sessions and the
//! registries behind the default handlers.

pub mod context;
pub mod dispatcher;
pub mod handlers;
pub mod middleware;
pub mod server;
pub mod services;
pub mod session;

pub use context::{ ConnectionState, RequestContext };
pub use dispatcher::{ Dispatcher, Reply, ReplyBody, ServerInfo };
pub use handlers::{ HandlerOutput, HandlerTable, MethodHandler };
pub use server::{ Server, ServerBuilder };
pub use session::{ Session, SessionEvent, SessionHandle, SessionManager, SessionState };
