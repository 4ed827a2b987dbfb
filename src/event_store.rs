//! Event Store
//!
//! An append-only ordered log of broadcast events used by the SSE and
//! streamable HTTP transports to replay missed events after a reconnect.
//! [`InMemoryEventStore`] is the reference implementation: all mutations are
//! serialized under one lock and timestamps are strictly monotonic per store.

use async_trait::async_trait;
use serde::{ Deserialize, Serialize };
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{ Duration, SystemTime, UNIX_EPOCH };
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::errors::Error;

/// One stored event
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StoredEvent {
    /// Event id, unique and monotonically assigned per store
    pub id: String,
    /// Event type, used as the SSE `event:` name
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event payload
    pub data: String,
    /// Microseconds since the Unix epoch
    pub timestamp: u64,
}

/// Storage for resumable event delivery
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append an event, assigning its id and timestamp
    async fn store_event(&self, event_type: &str, data: &str) -> Result<StoredEvent, Error>;

    /// Every event strictly after the timestamp of `since`, ascending. An unknown
    /// or absent `since` returns every retained event.
    async fn get_events(&self, since: Option<&str>) -> Result<Vec<StoredEvent>, Error>;

    /// Look one event up by id
    async fn get_event(&self, id: &str) -> Result<StoredEvent, Error>;

    /// Remove one event
    async fn delete_event(&self, id: &str) -> Result<(), Error>;

    /// Remove every event older than `older_than`; returns how many were removed
    async fn purge_events(&self, older_than: Duration) -> Result<usize, Error>;
}

#[derive(Default)]
struct Log {
    by_timestamp: BTreeMap<u64, StoredEvent>,
    last_timestamp: u64,
}

/// In-memory event store
#[derive(Default, Clone)]
pub struct InMemoryEventStore {
    log: Arc<RwLock<Log>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of retained events
    pub async fn len(&self) -> usize {
        self.log.read().await.by_timestamp.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Run `purge_events(ttl)` every `interval` until the handle is aborted
    pub fn spawn_purge_task(&self, ttl: Duration, interval: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Ok(purged) = store.purge_events(ttl).await {
                    if purged > 0 {
                        debug!(purged, "Purged expired events");
                    }
                }
            }
        })
    }
}

/// Ids are the zero-padded timestamp so they also sort lexicographically
fn event_id(timestamp: u64) -> String {
    format!("{:020}", timestamp)
}

fn parse_event_id(id: &str) -> Option<u64> {
    id.parse().ok()
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn store_event(&self, event_type: &str, data: &str) -> Result<StoredEvent, Error> {
        let mut log = self.log.write().await;
        // Bump on collision so timestamps stay strictly increasing
        let timestamp = now_micros().max(log.last_timestamp + 1);
        log.last_timestamp = timestamp;

        let event = StoredEvent {
            id: event_id(timestamp),
            event_type: event_type.to_string(),
            data: data.to_string(),
            timestamp,
        };
        log.by_timestamp.insert(timestamp, event.clone());
        Ok(event)
    }

    async fn get_events(&self, since: Option<&str>) -> Result<Vec<StoredEvent>, Error> {
        let log = self.log.read().await;
        let after = since
            .and_then(parse_event_id)
            .filter(|ts| log.by_timestamp.contains_key(ts));
        let events = match after {
            Some(ts) =>
                log.by_timestamp
                    .range(ts + 1..)
                    .map(|(_, e)| e.clone())
                    .collect(),
            None => log.by_timestamp.values().cloned().collect(),
        };
        Ok(events)
    }

    async fn get_event(&self, id: &str) -> Result<StoredEvent, Error> {
        let log = self.log.read().await;
        parse_event_id(id)
            .and_then(|ts| log.by_timestamp.get(&ts))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("event {}", id)))
    }

    async fn delete_event(&self, id: &str) -> Result<(), Error> {
        let mut log = self.log.write().await;
        parse_event_id(id)
            .and_then(|ts| log.by_timestamp.remove(&ts))
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("event {}", id)))
    }

    async fn purge_events(&self, older_than: Duration) -> Result<usize, Error> {
        let cutoff = now_micros().saturating_sub(older_than.as_micros() as u64);
        let mut log = self.log.write().await;
        let keep = log.by_timestamp.split_off(&cutoff);
        let purged = log.by_timestamp.len();
        log.by_timestamp = keep;
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn publish(store: &InMemoryEventStore, n: usize) -> Vec<StoredEvent> {
        let mut events = Vec::new();
        for i in 0..n {
            events.push(store.store_event("message", &format!("E{}", i + 1)).await.unwrap());
        }
        events
    }

    #[tokio::test]
    async fn timestamps_are_strictly_monotonic() {
        let store = InMemoryEventStore::new();
        let events = publish(&store, 100).await;
        for pair in events.windows(2) {
            assert!(pair[0].timestamp < pair[1].timestamp);
            assert!(pair[0].id < pair[1].id);
        }
    }

    #[tokio::test]
    async fn replay_returns_strictly_later_events_in_order() {
        let store = InMemoryEventStore::new();
        let events = publish(&store, 5).await;
        let replay = store.get_events(Some(&events[1].id)).await.unwrap();
        let data: Vec<_> = replay
            .iter()
            .map(|e| e.data.as_str())
            .collect();
        assert_eq!(data, vec!["E3", "E4", "E5"]);
    }

    #[tokio::test]
    async fn unknown_since_replays_everything() {
        let store = InMemoryEventStore::new();
        publish(&store, 3).await;
        assert_eq!(store.get_events(Some("nope")).await.unwrap().len(), 3);
        assert_eq!(store.get_events(None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn get_and_delete_by_id() {
        let store = InMemoryEventStore::new();
        let events = publish(&store, 2).await;
        assert_eq!(store.get_event(&events[0].id).await.unwrap(), events[0]);
        store.delete_event(&events[0].id).await.unwrap();
        assert_eq!(store.get_event(&events[0].id).await.unwrap_err().code(), 404);
        assert_eq!(store.delete_event(&events[0].id).await.unwrap_err().code(), 404);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn purge_removes_only_old_events() {
        let store = InMemoryEventStore::new();
        publish(&store, 3).await;
        assert_eq!(store.purge_events(Duration::from_secs(3600)).await.unwrap(), 0);
        assert_eq!(store.purge_events(Duration::ZERO).await.unwrap(), 3);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn concurrent_writers_never_share_an_id() {
        let store = InMemoryEventStore::new();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { publish(&store, 25).await }));
        }
        let mut ids = Vec::new();
        for handle in handles {
            ids.extend(handle.await.unwrap().into_iter().map(|e| e.id));
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 200);
    }
}
