//! Server implementation
//!
//! The Server owns the dispatcher, the registries behind the default handlers
//! and the transports it was started on. It is configured through
//! [`ServerBuilder`].

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{ info, warn };

use crate::errors::Error;
use crate::protocol::{ Method, PROTOCOL_VERSION };
use crate::server::context::RequestContext;
use crate::server::dispatcher::{ Dispatcher, ServerInfo };
use crate::server::handlers::HandlerTable;
use crate::server::middleware::RateLimiter;
use crate::server::services::ServiceProvider;
use crate::server::services::prompts::PromptHandler;
use crate::server::services::resources::ResourceReader;
use crate::server::services::tools::ToolDefinition;
use crate::server::session::{ DEFAULT_SESSION_TTL, SessionManager };
use crate::transport::Transport;
use crate::transport::connection::ConnectionOptions;
use crate::types::{
    CapabilityFlags,
    GetPromptResult,
    Implementation,
    Prompt,
    Resource,
    ResourceTemplate,
    ServerCapabilities,
};

/// Server for the Model Context Protocol
///
/// Responsible for routing requests to handlers and for the transports that
/// carry them.
pub struct Server {
    dispatcher: Arc<Dispatcher>,
    services: ServiceProvider,
    transports: Vec<Box<dyn Transport>>,
    sweeper: JoinHandle<()>,
}

impl Server {
    /// Create a new server builder
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// The dispatcher every transport routes through
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    pub fn services(&self) -> &ServiceProvider {
        &self.services
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        self.dispatcher.sessions()
    }

    /// Register a tool after build; the default tool handlers are installed
    /// on first use
    pub async fn register_tool(&self, definition: ToolDefinition) -> Result<(), Error> {
        self.services.tool_registry().register(definition).await?;
        self.services.install(self.dispatcher.handlers()).await;
        Ok(())
    }

    /// Register a resource after build
    pub async fn register_resource<R>(&self, resource: Resource, reader: R) -> Result<(), Error>
        where R: ResourceReader
    {
        self.services.resource_registry().register_resource(resource, reader).await?;
        self.services.install(self.dispatcher.handlers()).await;
        Ok(())
    }

    /// Serve URIs that match no resource or template from `reader`
    pub async fn set_fallback_reader<R>(&self, reader: R) where R: ResourceReader {
        self.services.resource_registry().set_fallback_reader(reader).await;
        self.services.install(self.dispatcher.handlers()).await;
    }

    /// Start serving on `transport`. The server keeps the transport until
    /// [`Server::shutdown`].
    pub async fn start<T>(&mut self, mut transport: T) -> Result<(), Error>
        where T: Transport + 'static
    {
        info!("Starting transport");
        transport.start(self.dispatcher.clone()).await?;
        self.transports.push(Box::new(transport));
        Ok(())
    }

    /// Stop every transport, draining in-flight requests
    pub async fn shutdown(&mut self) {
        for mut transport in self.transports.drain(..) {
            if let Err(e) = transport.stop().await {
                warn!("Error shutting down transport: {}", e);
            }
        }
        self.sweeper.abort();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

/// Builder for configuring and creating a Server
pub struct ServerBuilder {
    /// Server name
    server_name: Option<String>,

    /// Server version
    server_version: Option<String>,

    /// Protocol version
    protocol_version: String,

    /// Instructions
    instructions: Option<String>,

    /// Capabilities advertised instead of the computed ones
    capabilities: Option<ServerCapabilities>,

    /// Session lifetime
    session_ttl: Duration,

    /// Token bucket capacity and refill rate
    rate_limit: Option<(u32, f64)>,

    /// Defaults for every connection the transports open
    connection_options: ConnectionOptions,

    /// Handlers set explicitly
    handlers: HandlerTable,

    /// Tools to register during build
    tools: Vec<ToolDefinition>,

    /// Prompts to register during build
    prompts: Vec<(Prompt, PromptHandler)>,

    /// Resources to register during build
    resources: Vec<(Resource, Arc<dyn ResourceReader>)>,

    /// Resource templates to register during build
    templates: Vec<(ResourceTemplate, Arc<dyn ResourceReader>)>,

    /// Reader for URIs nothing else matches
    fallback_reader: Option<Arc<dyn ResourceReader>>,
}

impl ServerBuilder {
    /// Create a new server builder
    pub fn new() -> Self {
        Self {
            server_name: None,
            server_version: None,
            protocol_version: PROTOCOL_VERSION.to_string(),
            instructions: None,
            capabilities: None,
            session_ttl: DEFAULT_SESSION_TTL,
            rate_limit: None,
            connection_options: ConnectionOptions::default(),
            handlers: HandlerTable::new(),
            tools: Vec::new(),
            prompts: Vec::new(),
            resources: Vec::new(),
            templates: Vec::new(),
            fallback_reader: None,
        }
    }

    /// Set the server name
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Set the server version
    pub fn with_server_version(mut self, version: impl Into<String>) -> Self {
        self.server_version = Some(version.into());
        self
    }

    /// Set the instructions
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Set the protocol version
    pub fn with_protocol_version(mut self, version: impl Into<String>) -> Self {
        self.protocol_version = version.into();
        self
    }

    /// Advertise these capabilities instead of the ones derived from the
    /// registered handlers
    pub fn with_capabilities(mut self, capabilities: ServerCapabilities) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    /// Admit at most `capacity` requests in a burst, refilled at `per_second`
    pub fn with_rate_limit(mut self, capacity: u32, per_second: f64) -> Self {
        self.rate_limit = Some((capacity, per_second));
        self
    }

    /// Handle each connection's requests one at a time, in arrival order
    pub fn with_sequential_handling(mut self, sequential: bool) -> Self {
        self.connection_options.sequential = sequential;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.connection_options.request_timeout = Some(timeout);
        self
    }

    /// Refuse server notifications until the client sent `initialized`
    pub fn with_gated_notifications(mut self, gate: bool) -> Self {
        self.connection_options.gate_notifications = gate;
        self
    }

    /// How long connections wait for in-flight handlers on shutdown
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.connection_options.drain_timeout = timeout;
        self
    }

    /// The handler table for setting handlers directly
    pub fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    /// Set handlers on the table through a closure, keeping the builder chain
    pub fn with_handlers<F>(self, configure: F) -> Self where F: FnOnce(&HandlerTable) {
        configure(&self.handlers);
        self
    }

    /// Register a tool to be added during build
    pub fn register_tool(mut self, definition: ToolDefinition) -> Self {
        self.tools.push(definition);
        self
    }

    /// Register a prompt to be added during build
    pub fn register_prompt<F, Fut>(mut self, prompt: Prompt, handler: F) -> Self
        where
            F: Fn(RequestContext, HashMap<String, String>) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = Result<GetPromptResult, Error>> + Send + 'static
    {
        let handler: PromptHandler = Arc::new(
            move |
                ctx: RequestContext,
                args: HashMap<String, String>
            | -> BoxFuture<'static, Result<GetPromptResult, Error>> {
                Box::pin(handler(ctx, args))
            }
        );
        self.prompts.push((prompt, handler));
        self
    }

    /// Register a resource to be added during build
    pub fn register_resource<R>(mut self, resource: Resource, reader: R) -> Self
        where R: ResourceReader
    {
        self.resources.push((resource, Arc::new(reader)));
        self
    }

    /// Register a resource template to be added during build
    pub fn register_resource_template<R>(mut self, template: ResourceTemplate, reader: R) -> Self
        where R: ResourceReader
    {
        self.templates.push((template, Arc::new(reader)));
        self
    }

    /// Reader for URIs that match no registered resource or template
    pub fn with_fallback_reader<R>(mut self, reader: R) -> Self where R: ResourceReader {
        self.fallback_reader = Some(Arc::new(reader));
        self
    }

    /// Build the server with the configured options
    pub async fn build(self) -> Result<Server, Error> {
        let services = ServiceProvider::default();
        for tool in self.tools {
            info!("Registering tool: {}", tool.tool.name);
            services.tool_registry().register(tool).await?;
        }
        for (prompt, handler) in self.prompts {
            services.prompt_registry().register_handler(prompt, handler).await?;
        }
        for (resource, reader) in self.resources {
            services.resource_registry().register_resource(resource, reader).await?;
        }
        for (template, reader) in self.templates {
            services.resource_registry().register_template(template, reader).await?;
        }
        if let Some(reader) = self.fallback_reader {
            services.resource_registry().set_fallback_reader(reader).await;
        }

        let handlers = Arc::new(self.handlers);
        services.install(&handlers).await;

        let capabilities = match self.capabilities {
            Some(capabilities) => capabilities,
            None => derive_capabilities(&handlers),
        };
        let info = ServerInfo {
            implementation: Implementation::new(
                self.server_name.unwrap_or_else(|| "Rust Server".to_string()),
                self.server_version.unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string())
            ),
            capabilities,
            instructions: self.instructions,
            protocol_version: self.protocol_version,
        };

        let sessions = Arc::new(SessionManager::new(self.session_ttl));
        let sweeper = sessions.spawn_sweeper(sweep_interval(self.session_ttl));

        let mut dispatcher = Dispatcher::new(handlers, sessions, info).with_connection_options(
            self.connection_options
        );
        if let Some((capacity, per_second)) = self.rate_limit {
            dispatcher = dispatcher.with_rate_limiter(RateLimiter::new(capacity, per_second));
        }

        Ok(Server {
            dispatcher: Arc::new(dispatcher),
            services,
            transports: Vec::new(),
            sweeper,
        })
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Capabilities by presence of the handlers that serve them
fn derive_capabilities(handlers: &HandlerTable) -> ServerCapabilities {
    let any = |methods: &[Method]| methods.iter().any(|m| handlers.contains(m.as_str()));
    ServerCapabilities {
        tools: any(&[Method::ListTools, Method::CallTool]).then(CapabilityFlags::default),
        prompts: any(&[Method::ListPrompts, Method::GetPrompt]).then(CapabilityFlags::default),
        resources: any(
            &[Method::ListResources, Method::ReadResource, Method::ListResourceTemplates]
        ).then(CapabilityFlags::default),
        ..Default::default()
    }
}

fn sweep_interval(ttl: Duration) -> Duration {
    (ttl / 4).clamp(Duration::from_millis(100), Duration::from_secs(60))
}
