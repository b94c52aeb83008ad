//! Shared ingestor lifecycle state, counters, and the capability trait.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

use drawlatch_core::rfc3339_timestamp;
use drawlatch_proto::{IngestedEventRecord, WebhookOutcome};

use crate::ring::RingBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestorState {
    Starting,
    Connected,
    Reconnecting,
    Stopped,
    Error,
}

impl IngestorState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

/// Point-in-time snapshot exposed through `ingestor_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestorStatus {
    pub connection: String,
    pub state: IngestorState,
    pub total_events_received: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub buffered_events: usize,
}

struct CoreInner {
    ring: RingBuffer,
    /// Next id to assign. Survives ring eviction and explicit clears.
    next_id: u64,
    total_events_received: u64,
    last_event_at: Option<String>,
    state: IngestorState,
    error_message: Option<String>,
}

/// State shared by every ingestor variant: the ring buffer, the monotonic id
/// counter, lifecycle state, and an observer channel that carries the id of
/// the most recently pushed event (one producer, many observers, best
/// effort).
pub struct IngestorCore {
    connection_alias: String,
    inner: Mutex<CoreInner>,
    notify: watch::Sender<u64>,
}

impl IngestorCore {
    pub fn new(connection_alias: impl Into<String>, buffer_capacity: usize) -> Self {
        let (notify, _) = watch::channel(0);
        Self {
            connection_alias: connection_alias.into(),
            inner: Mutex::new(CoreInner {
                ring: RingBuffer::new(buffer_capacity),
                next_id: 0,
                total_events_received: 0,
                last_event_at: None,
                state: IngestorState::Stopped,
                error_message: None,
            }),
            notify,
        }
    }

    pub fn connection_alias(&self) -> &str {
        &self.connection_alias
    }

    /// Allocates the next id, timestamps the payload, appends it to the ring,
    /// and notifies observers.
    pub fn push_event(&self, event_type: &str, data: Value) -> IngestedEventRecord {
        let mut inner = self.lock();
        let event = IngestedEventRecord {
            id: inner.next_id,
            received_at: rfc3339_timestamp(),
            source: self.connection_alias.clone(),
            event_type: event_type.to_string(),
            data,
        };
        inner.next_id = inner.next_id.saturating_add(1);
        inner.total_events_received = inner.total_events_received.saturating_add(1);
        inner.last_event_at = Some(event.received_at.clone());
        inner.ring.push(event.clone());
        drop(inner);
        let _ = self.notify.send(event.id);
        event
    }

    /// Negative cursor returns the full buffer; otherwise events with
    /// `id > after_id` in ascending id order.
    pub fn get_events(&self, after_id: i64) -> Vec<IngestedEventRecord> {
        let inner = self.lock();
        if after_id < 0 {
            inner.ring.to_vec()
        } else {
            inner.ring.since(after_id)
        }
    }

    /// Drops buffered events without resetting the id counter.
    pub fn clear_events(&self) {
        self.lock().ring.clear();
    }

    pub fn buffer_capacity(&self) -> usize {
        self.lock().ring.capacity()
    }

    pub fn state(&self) -> IngestorState {
        self.lock().state
    }

    pub fn set_state(&self, state: IngestorState) {
        let mut inner = self.lock();
        inner.state = state;
        if state != IngestorState::Error {
            inner.error_message = None;
        }
    }

    pub fn set_error(&self, message: impl Into<String>) {
        let mut inner = self.lock();
        inner.state = IngestorState::Error;
        inner.error_message = Some(message.into());
    }

    pub fn status(&self) -> IngestorStatus {
        let inner = self.lock();
        IngestorStatus {
            connection: self.connection_alias.clone(),
            state: inner.state,
            total_events_received: inner.total_events_received,
            last_event_at: inner.last_event_at.clone(),
            error_message: inner.error_message.clone(),
            buffered_events: inner.ring.len(),
        }
    }

    /// Observer handle carrying the id of the latest pushed event.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.notify.subscribe()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CoreInner> {
        // A poisoned lock means a panic mid-push; the buffer is still usable.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Capability surface shared by every ingestor variant. Protocol logic lives
/// in the concrete types; lifecycle state and buffered events live in the
/// shared [`IngestorCore`].
#[async_trait]
pub trait Ingestor: Send + Sync {
    /// Transitions `stopped -> starting -> connected` (or `error`).
    async fn start(&self) -> anyhow::Result<()>;

    /// Transitions any state to `stopped`.
    async fn stop(&self);

    fn core(&self) -> &IngestorCore;

    fn status(&self) -> IngestorStatus {
        self.core().status()
    }

    fn get_events(&self, after_id: i64) -> Vec<IngestedEventRecord> {
        self.core().get_events(after_id)
    }

    /// Webhook receivers advertise the path they serve; active ingestors
    /// return `None`.
    fn webhook_path(&self) -> Option<&str> {
        None
    }

    /// Synchronous relative to the delivering HTTP request.
    fn handle_webhook(
        &self,
        _headers: &BTreeMap<String, String>,
        _raw_body: &[u8],
    ) -> WebhookOutcome {
        WebhookOutcome::rejected("not a webhook ingestor")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_push_event_assigns_monotonic_ids_and_counters() {
        let core = IngestorCore::new("github", 8);
        let first = core.push_event("push", serde_json::json!({"n": 1}));
        let second = core.push_event("push", serde_json::json!({"n": 2}));
        assert_eq!(first.id, 0);
        assert_eq!(second.id, 1);

        let status = core.status();
        assert_eq!(status.total_events_received, 2);
        assert_eq!(status.buffered_events, 2);
        assert_eq!(status.last_event_at, Some(second.received_at));
    }

    #[test]
    fn regression_ids_keep_increasing_across_clear() {
        let core = IngestorCore::new("github", 4);
        core.push_event("a", Value::Null);
        core.push_event("b", Value::Null);
        core.clear_events();
        let next = core.push_event("c", Value::Null);
        assert_eq!(next.id, 2);
        assert_eq!(core.get_events(-1).len(), 1);
    }

    #[test]
    fn unit_get_events_honors_negative_and_positive_cursors() {
        let core = IngestorCore::new("github", 4);
        for n in 0..3 {
            core.push_event("tick", serde_json::json!({"n": n}));
        }
        assert_eq!(core.get_events(-1).len(), 3);
        let newer: Vec<u64> = core.get_events(0).iter().map(|event| event.id).collect();
        assert_eq!(newer, vec![1, 2]);
    }

    #[test]
    fn unit_set_state_clears_stale_error_message() {
        let core = IngestorCore::new("poll", 4);
        core.set_error("upstream returned 500");
        assert_eq!(core.status().state, IngestorState::Error);
        assert!(core.status().error_message.is_some());
        core.set_state(IngestorState::Connected);
        assert_eq!(core.status().state, IngestorState::Connected);
        assert!(core.status().error_message.is_none());
    }

    #[tokio::test]
    async fn functional_observers_see_latest_pushed_id() {
        let core = IngestorCore::new("github", 4);
        let mut observer = core.subscribe();
        core.push_event("a", Value::Null);
        core.push_event("b", Value::Null);
        observer.changed().await.expect("observer alive");
        assert_eq!(*observer.borrow(), 1);
    }
}
