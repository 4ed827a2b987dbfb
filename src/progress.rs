//! MCP Progress Tracking
//!
//! This module provides progress reporting for long-running handlers. A tracker
//! records a time-ordered sequence of snapshots and fans them out to any number
//! of subscribers. Emission never blocks: a subscriber whose buffer is full at
//! emission time is dropped.

use futures::Stream;
use serde::{ Deserialize, Serialize };
use std::sync::{ Arc, Mutex };
use std::time::{ SystemTime, UNIX_EPOCH };
use tokio::sync::mpsc;
use tracing::{ debug, warn };

use crate::errors::Error;

/// Default per-subscriber buffer
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 32;

/// State of a progress operation
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ProgressState {
    /// Operation has started
    Started,

    /// Operation is in progress
    InProgress,

    /// Operation has completed successfully
    Completed,

    /// Operation has failed
    Failed,
}

impl ProgressState {
    /// Completed and Failed are terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressState::Completed | ProgressState::Failed)
    }
}

/// A snapshot of a long-running operation
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Progress {
    /// Stable id generated by `start`
    pub id: String,
    pub state: ProgressState,
    pub message: String,
    /// Percentage in [0, 100]
    pub percentage: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
}

struct Inner {
    current: Option<Progress>,
    subscribers: Vec<mpsc::Sender<Progress>>,
}

/// Tracker for one long-running operation
#[derive(Clone)]
pub struct ProgressTracker {
    inner: Arc<Mutex<Inner>>,
    buffer: usize,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    /// Create a new tracker
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_SUBSCRIBER_BUFFER)
    }

    /// Create a tracker whose subscribers buffer up to `buffer` snapshots
    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            inner: Arc::new(
                Mutex::new(Inner {
                    current: None,
                    subscribers: Vec::new(),
                })
            ),
            buffer: buffer.max(1),
        }
    }

    /// Enter Started with percentage 0
    pub fn start(&self, message: impl Into<String>) -> Result<Progress, Error> {
        self.transition(|current| {
            if current.is_some() {
                return Err(Error::Conflict("progress already started".to_string()));
            }
            Ok(Progress {
                id: uuid::Uuid::new_v4().to_string(),
                state: ProgressState::Started,
                message: message.into(),
                percentage: 0.0,
                error: None,
                timestamp: now_millis(),
            })
        })
    }

    /// Enter InProgress; rejects percentages outside [0, 100]
    pub fn update(&self, percentage: f64, message: impl Into<String>) -> Result<Progress, Error> {
        if !(0.0..=100.0).contains(&percentage) {
            return Err(
                Error::InvalidParams(format!("percentage {} out of range [0, 100]", percentage))
            );
        }
        self.transition(|current| {
            let previous = active(current)?;
            Ok(Progress {
                state: ProgressState::InProgress,
                message: message.into(),
                percentage,
                timestamp: now_millis(),
                ..previous.clone()
            })
        })
    }

    /// Terminal success
    pub fn complete(&self, message: impl Into<String>) -> Result<Progress, Error> {
        self.transition(|current| {
            let previous = active(current)?;
            Ok(Progress {
                state: ProgressState::Completed,
                message: message.into(),
                percentage: 100.0,
                timestamp: now_millis(),
                ..previous.clone()
            })
        })
    }

    /// Terminal failure
    pub fn fail(&self, error: impl Into<String>) -> Result<Progress, Error> {
        self.transition(|current| {
            let previous = active(current)?;
            let error = error.into();
            Ok(Progress {
                state: ProgressState::Failed,
                message: error.clone(),
                error: Some(error),
                timestamp: now_millis(),
                ..previous.clone()
            })
        })
    }

    /// Latest snapshot, if started
    pub fn current(&self) -> Option<Progress> {
        self.lock().current.clone()
    }

    /// Snapshots in emission order, starting with the current one if any.
    /// The stream ends after a terminal snapshot.
    pub fn subscribe(&self) -> impl Stream<Item = Progress> + Send + 'static {
        let (tx, mut rx) = mpsc::channel(self.buffer);
        {
            let mut inner = self.lock();
            let terminal = match &inner.current {
                Some(current) => {
                    let _ = tx.try_send(current.clone());
                    current.state.is_terminal()
                }
                None => false,
            };
            if !terminal {
                inner.subscribers.push(tx);
            }
        }

        async_stream::stream! {
            while let Some(progress) = rx.recv().await {
                yield progress;
            }
        }
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves the snapshot intact
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transition<F>(&self, next: F) -> Result<Progress, Error>
        where F: FnOnce(&Option<Progress>) -> Result<Progress, Error>
    {
        let mut inner = self.lock();
        let progress = next(&inner.current)?;
        inner.current = Some(progress.clone());

        let before = inner.subscribers.len();
        inner.subscribers.retain(|tx| {
            match tx.try_send(progress.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => false,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
        let dropped = before - inner.subscribers.len();
        if dropped > 0 {
            warn!(progress_id = %progress.id, dropped, "Dropped slow or closed progress subscribers");
        }

        if progress.state.is_terminal() {
            // Closing the senders ends every subscription stream
            inner.subscribers.clear();
        }
        debug!(
            progress_id = %progress.id,
            state = ?progress.state,
            percentage = progress.percentage,
            "Progress emitted"
        );
        Ok(progress)
    }
}

fn active(current: &Option<Progress>) -> Result<&Progress, Error> {
    match current {
        None => Err(Error::InvalidState("progress not started".to_string())),
        Some(p) if p.state.is_terminal() => {
            Err(Error::Conflict("progress already finished".to_string()))
        }
        Some(p) => Ok(p),
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn subscribers_observe_emission_order() {
        let tracker = ProgressTracker::new();
        let first = tracker.subscribe();
        let second = tracker.subscribe();

        tracker.start("working").unwrap();
        tracker.update(10.0, "ten").unwrap();
        tracker.update(40.0, "forty").unwrap();
        tracker.update(80.0, "eighty").unwrap();
        tracker.complete("done").unwrap();

        for stream in [first.boxed(), second.boxed()] {
            let seen: Vec<(ProgressState, f64)> = stream
                .map(|p| (p.state, p.percentage))
                .collect().await;
            assert_eq!(
                seen,
                vec![
                    (ProgressState::Started, 0.0),
                    (ProgressState::InProgress, 10.0),
                    (ProgressState::InProgress, 40.0),
                    (ProgressState::InProgress, 80.0),
                    (ProgressState::Completed, 100.0)
                ]
            );
        }
    }

    #[tokio::test]
    async fn late_subscriber_starts_from_current_snapshot() {
        let tracker = ProgressTracker::new();
        tracker.start("go").unwrap();
        tracker.update(25.0, "").unwrap();
        tracker.update(50.0, "").unwrap();

        let late = tracker.subscribe();
        tracker.update(75.0, "").unwrap();
        tracker.update(100.0, "").unwrap();
        tracker.complete("done").unwrap();

        let seen: Vec<f64> = late.map(|p| p.percentage).collect().await;
        assert_eq!(seen, vec![50.0, 75.0, 100.0, 100.0]);
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped_without_blocking() {
        let tracker = ProgressTracker::with_buffer(1);
        let _slow = tracker.subscribe();
        tracker.start("go").unwrap();
        assert_eq!(tracker.subscriber_count(), 1);
        tracker.update(10.0, "").unwrap();
        assert_eq!(tracker.subscriber_count(), 0);
    }

    #[test]
    fn out_of_range_percentage_is_rejected() {
        let tracker = ProgressTracker::new();
        tracker.start("go").unwrap();
        assert_eq!(tracker.update(101.0, "").unwrap_err().code(), 400);
        assert_eq!(tracker.update(-1.0, "").unwrap_err().code(), 400);
        assert_eq!(tracker.current().unwrap().state, ProgressState::Started);
    }

    #[test]
    fn updates_after_terminal_state_are_rejected() {
        let tracker = ProgressTracker::new();
        let started = tracker.start("go").unwrap();
        let failed = tracker.fail("boom").unwrap();
        assert_eq!(failed.id, started.id);
        assert_eq!(failed.error.as_deref(), Some("boom"));
        assert_eq!(tracker.update(50.0, "").unwrap_err().code(), 409);
        assert_eq!(tracker.complete("").unwrap_err().code(), 409);
    }

    #[tokio::test]
    async fn subscription_after_terminal_yields_only_final_snapshot() {
        let tracker = ProgressTracker::new();
        tracker.start("go").unwrap();
        tracker.complete("done").unwrap();
        let seen: Vec<_> = tracker.subscribe().collect().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].state, ProgressState::Completed);
    }
}
