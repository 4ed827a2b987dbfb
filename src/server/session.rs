//! Session Management
//!
//! A session records what was negotiated by `initialize` on one connection:
//! the client's implementation info and capabilities, the protocol version,
//! and the lifecycle state. Sessions are bound to their connection and are
//! evicted from the [`SessionManager`] when that connection closes or their
//! TTL elapses.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{ Arc, RwLock, RwLockReadGuard, RwLockWriteGuard };
use std::time::{ Duration, SystemTime };
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{ debug, info };

use crate::errors::Error;
use crate::server::context::InFlight;
use crate::types::{ ClientCapabilities, Implementation, InitializeParams };

/// Default session lifetime
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No `initialize` seen yet
    NotInitialized,

    /// `initialize` is being processed
    Initializing,

    /// Handshake complete, methods may be served
    Initialized,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::NotInitialized => write!(f, "NotInitialized"),
            SessionState::Initializing => write!(f, "Initializing"),
            SessionState::Initialized => write!(f, "Initialized"),
        }
    }
}

/// Per-connection record of a negotiated client/server pair
#[derive(Debug)]
pub struct Session {
    id: String,
    created_at: SystemTime,
    started: Instant,
    expires_at: Instant,
    client_info: Option<Implementation>,
    client_capabilities: ClientCapabilities,
    protocol_version: Option<String>,
    state: SessionState,
    ready: bool,
    in_flight: Arc<InFlight>,
}

impl Session {
    /// Create a session with a random id and the given lifetime
    pub fn new(ttl: Duration) -> Self {
        Self::with_in_flight(ttl, Arc::new(InFlight::default()))
    }

    pub(crate) fn with_in_flight(ttl: Duration, in_flight: Arc<InFlight>) -> Self {
        let now = Instant::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: SystemTime::now(),
            started: now,
            expires_at: now + ttl,
            client_info: None,
            client_capabilities: ClientCapabilities::default(),
            protocol_version: None,
            state: SessionState::NotInitialized,
            ready: false,
            in_flight,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Time since creation
    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn client_info(&self) -> Option<&Implementation> {
        self.client_info.as_ref()
    }

    pub fn client_capabilities(&self) -> &ClientCapabilities {
        &self.client_capabilities
    }

    pub fn protocol_version(&self) -> Option<&str> {
        self.protocol_version.as_deref()
    }

    /// Whether the client confirmed readiness with `initialized`
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub(crate) fn in_flight(&self) -> Arc<InFlight> {
        self.in_flight.clone()
    }

    /// NotInitialized to Initializing, capturing what the client sent
    pub fn begin_initialize(&mut self, params: &InitializeParams) -> Result<(), Error> {
        if self.state != SessionState::NotInitialized {
            return Err(Error::AlreadyInitialized);
        }
        self.client_info = Some(params.client_info.clone());
        self.client_capabilities = params.capabilities.clone();
        self.protocol_version = Some(params.protocol_version.clone());
        self.state = SessionState::Initializing;
        Ok(())
    }

    /// Initializing to Initialized
    pub fn finish_initialize(&mut self) -> Result<(), Error> {
        if self.state != SessionState::Initializing {
            return Err(Error::InvalidState(format!("cannot finish initialize from {}", self.state)));
        }
        self.state = SessionState::Initialized;
        Ok(())
    }

    /// Record the `initialized` notification
    pub fn mark_ready(&mut self) -> Result<(), Error> {
        if self.state != SessionState::Initialized {
            return Err(Error::NotInitialized);
        }
        self.ready = true;
        Ok(())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Reset the deadline to `duration` from now
    pub fn extend(&mut self, duration: Duration) {
        self.expires_at = Instant::now() + duration;
    }

    /// Time left before expiry
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    /// True iff every member present in `required` is advertised by the client
    /// with the same value. Experimental keys are checked the same way.
    pub fn check_client_capability(&self, required: &Value) -> bool {
        match serde_json::to_value(&self.client_capabilities) {
            Ok(advertised) => is_subset(required, &advertised),
            Err(_) => false,
        }
    }
}

/// Recursive presence check: objects must contain every required member,
/// leaves must be equal
fn is_subset(required: &Value, advertised: &Value) -> bool {
    match (required, advertised) {
        (Value::Object(req), Value::Object(adv)) => {
            req.iter().all(|(key, value)| {
                adv.get(key).is_some_and(|present| is_subset(value, present))
            })
        }
        (req, adv) => req == adv,
    }
}

/// Shared handle to one session; each session has its own lock
#[derive(Debug, Clone)]
pub struct SessionHandle(Arc<RwLock<Session>>);

impl SessionHandle {
    pub fn new(session: Session) -> Self {
        Self(Arc::new(RwLock::new(session)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Session> {
        self.0.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Session> {
        self.0.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn id(&self) -> String {
        self.read().id.clone()
    }
}

/// Session lifecycle events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A session finished `initialize`
    Created(String),

    /// A session was evicted (disconnect, expiry or explicit removal)
    Removed(String),
}

/// Type for session event handlers
pub type SessionEventHandler = Box<dyn Fn(SessionEvent) + Send + Sync>;

/// Id to session map kept for HTTP session headers and observability
pub struct SessionManager {
    sessions: RwLock<HashMap<String, SessionHandle>>,
    event_handlers: RwLock<Vec<SessionEventHandler>>,
    ttl: Duration,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TTL)
    }
}

impl SessionManager {
    /// Create a manager whose sessions live for `ttl`
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            event_handlers: RwLock::new(Vec::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Register a handler for session events
    pub fn register_event_handler<F>(&self, handler: F)
        where F: Fn(SessionEvent) + Send + Sync + 'static
    {
        self.event_handlers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(Box::new(handler));
    }

    /// Create an uninitialized session sharing the connection's in-flight set
    pub(crate) fn create(&self, in_flight: Arc<InFlight>) -> SessionHandle {
        SessionHandle::new(Session::with_in_flight(self.ttl, in_flight))
    }

    /// Track an initialized session
    pub fn insert(&self, session: SessionHandle) {
        let id = session.id();
        self.write_map().insert(id.clone(), session);
        info!(session_id = %id, "Session created");
        self.notify(SessionEvent::Created(id));
    }

    /// Look a live session up; expired sessions are evicted and reported as 404
    pub fn get(&self, id: &str) -> Result<SessionHandle, Error> {
        let session = self
            .read_map()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::SessionExpired(id.to_string()))?;
        if session.read().is_expired() {
            self.remove(id);
            return Err(Error::SessionExpired(id.to_string()));
        }
        Ok(session)
    }

    /// Evict a session; returns whether it was tracked
    pub fn remove(&self, id: &str) -> bool {
        let removed = self.write_map().remove(id).is_some();
        if removed {
            debug!(session_id = %id, "Session removed");
            self.notify(SessionEvent::Removed(id.to_string()));
        }
        removed
    }

    /// Number of tracked sessions
    pub fn len(&self) -> usize {
        self.read_map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of tracked sessions
    pub fn session_ids(&self) -> Vec<String> {
        self.read_map().keys().cloned().collect()
    }

    /// Evict every expired session; returns how many were removed
    pub fn sweep_expired(&self) -> usize {
        let expired: Vec<String> = self
            .read_map()
            .iter()
            .filter(|(_, s)| s.read().is_expired())
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .iter()
            .filter(|id| self.remove(id))
            .count()
    }

    /// Sweep expired sessions every `interval` until the handle is aborted
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                let swept = manager.sweep_expired();
                if swept > 0 {
                    debug!(swept, "Swept expired sessions");
                }
            }
        })
    }

    fn read_map(&self) -> RwLockReadGuard<'_, HashMap<String, SessionHandle>> {
        self.sessions.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_map(&self) -> RwLockWriteGuard<'_, HashMap<String, SessionHandle>> {
        self.sessions.write().unwrap_or_else(|p| p.into_inner())
    }

    fn notify(&self, event: SessionEvent) {
        let handlers = self.event_handlers.read().unwrap_or_else(|p| p.into_inner());
        for handler in handlers.iter() {
            handler(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CapabilityFlags;
    use serde_json::{ Map, json };
    use std::sync::atomic::{ AtomicUsize, Ordering };

    fn params(capabilities: ClientCapabilities) -> InitializeParams {
        InitializeParams::new(Implementation::new("t", "1"), capabilities)
    }

    #[test]
    fn state_advances_monotonically() {
        let mut session = Session::new(DEFAULT_SESSION_TTL);
        assert_eq!(session.state(), SessionState::NotInitialized);
        assert!(session.mark_ready().is_err());

        session.begin_initialize(&params(ClientCapabilities::default())).unwrap();
        assert_eq!(session.state(), SessionState::Initializing);
        session.finish_initialize().unwrap();
        assert_eq!(session.state(), SessionState::Initialized);

        let err = session.begin_initialize(&params(ClientCapabilities::default())).unwrap_err();
        assert_eq!(err.code(), 400);
        assert_eq!(err.message(), "already initialized");

        session.mark_ready().unwrap();
        assert!(session.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_and_extend() {
        let mut session = Session::new(Duration::from_secs(10));
        assert!(!session.is_expired());
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(session.is_expired());
        session.extend(Duration::from_secs(10));
        assert!(!session.is_expired());
        assert_eq!(session.remaining(), Duration::from_secs(10));
    }

    #[test]
    fn capability_gating_by_presence() {
        let mut session = Session::new(DEFAULT_SESSION_TTL);
        session
            .begin_initialize(
                &params(ClientCapabilities {
                    roots: Some(CapabilityFlags::default()),
                    ..Default::default()
                })
            )
            .unwrap();

        assert!(session.check_client_capability(&json!({"roots": {}})));
        assert!(!session.check_client_capability(&json!({"roots": {"listChanged": true}})));
        assert!(!session.check_client_capability(&json!({"sampling": {}})));
    }

    #[test]
    fn capability_gating_includes_experimental_keys() {
        let mut experimental = Map::new();
        experimental.insert("streaming".to_string(), json!({"chunked": true}));
        let mut session = Session::new(DEFAULT_SESSION_TTL);
        session
            .begin_initialize(
                &params(ClientCapabilities {
                    roots: Some(CapabilityFlags::list_changed()),
                    experimental: Some(experimental),
                    ..Default::default()
                })
            )
            .unwrap();

        assert!(session.check_client_capability(&json!({"roots": {"listChanged": true}})));
        assert!(
            session.check_client_capability(&json!({"experimental": {"streaming": {"chunked": true}}}))
        );
        assert!(!session.check_client_capability(&json!({"experimental": {"batch": {}}})));
    }

    #[tokio::test(start_paused = true)]
    async fn manager_evicts_expired_sessions() {
        let manager = SessionManager::new(Duration::from_secs(5));
        let session = manager.create(Arc::new(InFlight::default()));
        let id = session.id();
        manager.insert(session);
        assert!(manager.get(&id).is_ok());

        tokio::time::advance(Duration::from_secs(6)).await;
        let err = manager.get(&id).unwrap_err();
        assert_eq!(err.code(), 404);
        assert!(manager.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_reports_events() {
        let manager = SessionManager::new(Duration::from_secs(5));
        let removed = Arc::new(AtomicUsize::new(0));
        let counter = removed.clone();
        manager.register_event_handler(move |event| {
            if let SessionEvent::Removed(_) = event {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        for _ in 0..3 {
            manager.insert(manager.create(Arc::new(InFlight::default())));
        }
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(manager.sweep_expired(), 3);
        assert_eq!(removed.load(Ordering::SeqCst), 3);
    }
}
