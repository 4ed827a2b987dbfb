//! Event hub shared by the SSE and streamable HTTP transports
//!
//! The hub keeps one bounded queue per subscribed client. Publishing stores
//! the event (when an [`EventStore`] is configured) and fans it out; a client
//! whose queue is full is disconnected. Subscribing with a last-seen id first
//! replays the stored events that came after it, then switches to live
//! events without duplicates.

use axum::response::sse::Event;
use futures::Stream;
use std::collections::HashMap;
use std::sync::{ Arc, RwLock };
use tokio::sync::mpsc;
use tracing::{ debug, warn };

use crate::errors::Error;
use crate::event_store::{ EventStore, StoredEvent };

/// Default number of events queued per client
pub const DEFAULT_CLIENT_BUFFER: usize = 256;

/// One server-sent event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event id, present for stored events
    pub id: Option<String>,
    /// Event name
    pub event: String,
    /// Payload, one JSON text
    pub data: String,
    /// Store timestamp, used to skip live events already replayed
    timestamp: Option<u64>,
}

impl SseEvent {
    /// An event that is not stored
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            id: None,
            event: event.into(),
            data: data.into(),
            timestamp: None,
        }
    }

    /// Axum representation
    pub fn to_event(&self) -> Event {
        let event = Event::default().event(&self.event).data(&self.data);
        match &self.id {
            Some(id) => event.id(id),
            None => event,
        }
    }
}

impl From<StoredEvent> for SseEvent {
    fn from(stored: StoredEvent) -> Self {
        Self {
            id: Some(stored.id),
            event: stored.event_type,
            data: stored.data,
            timestamp: Some(stored.timestamp),
        }
    }
}

struct HubClient {
    tx: mpsc::Sender<SseEvent>,
    session_id: Option<String>,
}

/// A registered client: the events to replay and the live queue
pub struct Subscription {
    pub client_id: String,
    replay: Vec<SseEvent>,
    rx: mpsc::Receiver<SseEvent>,
}

impl Subscription {
    /// Replayed events followed by live ones. The stream ends when the hub
    /// drops the client.
    pub fn into_stream(self) -> impl Stream<Item = SseEvent> + Send + 'static {
        let Subscription { replay, mut rx, .. } = self;
        async_stream::stream! {
            let mut last_replayed = None;
            for event in replay {
                last_replayed = event.timestamp;
                yield event;
            }
            while let Some(event) = rx.recv().await {
                if let (Some(seen), Some(ts)) = (last_replayed, event.timestamp) {
                    if ts <= seen {
                        continue;
                    }
                }
                yield event;
            }
        }
    }
}

/// Fan-out of events to subscribed clients
pub struct EventHub {
    clients: RwLock<HashMap<String, HubClient>>,
    store: Option<Arc<dyn EventStore>>,
    client_buffer: usize,
}

impl EventHub {
    pub fn new(client_buffer: usize, store: Option<Arc<dyn EventStore>>) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            store,
            client_buffer: client_buffer.max(1),
        }
    }

    pub fn store(&self) -> Option<&Arc<dyn EventStore>> {
        self.store.as_ref()
    }

    /// Register a client. With `last_event_id`, stored events after it are
    /// replayed first.
    pub async fn subscribe(
        &self,
        session_id: Option<String>,
        last_event_id: Option<&str>
    ) -> Result<Subscription, Error> {
        let client_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(self.client_buffer);
        // Register before reading the store so nothing published in between is lost
        self.write_clients().insert(client_id.clone(), HubClient { tx, session_id });

        let replay = match (&self.store, last_event_id) {
            (Some(store), Some(last)) =>
                match store.get_events(Some(last)).await {
                    Ok(events) => events.into_iter().map(SseEvent::from).collect(),
                    Err(e) => {
                        self.remove(&client_id);
                        return Err(e);
                    }
                }
            _ => Vec::new(),
        };
        debug!(client_id = %client_id, replayed = replay.len(), "SSE client subscribed");

        Ok(Subscription { client_id, replay, rx })
    }

    /// Store (when configured) and broadcast an event; returns its id
    pub async fn publish(&self, event_type: &str, data: String) -> Result<Option<String>, Error> {
        let event = match &self.store {
            Some(store) => SseEvent::from(store.store_event(event_type, &data).await?),
            None => SseEvent::new(event_type, data),
        };
        let id = event.id.clone();
        let targets: Vec<String> = self.read_clients().keys().cloned().collect();
        for client_id in targets {
            self.deliver(&client_id, event.clone());
        }
        Ok(id)
    }

    /// Queue an event for one client
    pub fn send_to(&self, client_id: &str, event: SseEvent) -> Result<(), Error> {
        if self.deliver(client_id, event) {
            Ok(())
        } else {
            Err(Error::StreamClosed)
        }
    }

    /// Whether `session_id` belongs to a live client
    pub fn has_session(&self, session_id: &str) -> bool {
        self.read_clients()
            .values()
            .any(|c| c.session_id.as_deref() == Some(session_id))
    }

    /// Disconnect one client
    pub fn remove(&self, client_id: &str) -> bool {
        let removed = self.write_clients().remove(client_id).is_some();
        if removed {
            debug!(client_id, "SSE client removed");
        }
        removed
    }

    /// Disconnect every client; returns how many there were
    pub fn close_all(&self) -> usize {
        let mut clients = self.write_clients();
        let count = clients.len();
        clients.clear();
        count
    }

    pub fn client_count(&self) -> usize {
        self.read_clients().len()
    }

    /// Non-blocking send; a full or closed queue drops the client
    fn deliver(&self, client_id: &str, event: SseEvent) -> bool {
        let result = match self.read_clients().get(client_id) {
            Some(client) => client.tx.try_send(event),
            None => {
                return false;
            }
        };
        match result {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(client_id, "SSE client too slow, disconnecting");
                self.remove(client_id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.remove(client_id);
                false
            }
        }
    }

    fn read_clients(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, HubClient>> {
        self.clients.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_clients(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, HubClient>> {
        self.clients.write().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::InMemoryEventStore;
    use futures::StreamExt;

    fn hub(buffer: usize) -> EventHub {
        EventHub::new(buffer, Some(Arc::new(InMemoryEventStore::new())))
    }

    #[tokio::test]
    async fn resume_replays_later_events_then_live() {
        let hub = hub(16);
        let e1 = hub.publish("message", "1".into()).await.unwrap().unwrap();
        let e2 = hub.publish("message", "2".into()).await.unwrap().unwrap();
        let e3 = hub.publish("message", "3".into()).await.unwrap().unwrap();

        let subscription = hub.subscribe(None, Some(&e1)).await.unwrap();
        hub.publish("message", "4".into()).await.unwrap();
        let events: Vec<SseEvent> = subscription.into_stream().take(3).collect().await;

        let ids: Vec<_> = events.iter().map(|e| e.id.clone().unwrap()).collect();
        assert_eq!(&ids[..2], &[e2, e3]);
        assert_eq!(events[2].data, "4");
    }

    #[tokio::test]
    async fn slow_clients_are_disconnected() {
        let hub = EventHub::new(2, None);
        let subscription = hub.subscribe(None, None).await.unwrap();
        for i in 0..3 {
            hub.publish("message", i.to_string()).await.unwrap();
        }
        assert_eq!(hub.client_count(), 0);

        // Buffered events still drain, then the stream ends
        let events: Vec<SseEvent> = subscription.into_stream().collect().await;
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn close_all_ends_every_stream() {
        let hub = EventHub::new(4, None);
        let a = hub.subscribe(Some("s1".into()), None).await.unwrap();
        let _b = hub.subscribe(None, None).await.unwrap();
        assert!(hub.has_session("s1"));
        assert_eq!(hub.close_all(), 2);
        assert_eq!(a.into_stream().count().await, 0);
    }

    #[test]
    fn stored_events_carry_their_id() {
        let stored = StoredEvent {
            id: "00000000000000000001".into(),
            event_type: "message".into(),
            data: "{}".into(),
            timestamp: 1,
        };
        let event = SseEvent::from(stored);
        assert_eq!(event.id.as_deref(), Some("00000000000000000001"));
        assert_eq!(event.event, "message");
    }
}
