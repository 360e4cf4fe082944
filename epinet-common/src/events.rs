//! Load progress events
//!
//! Aggregation runs publish their lifecycle on a broadcast [`EventBus`] so
//! that SSE clients and dashboards can show staleness without polling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// How much of the window a run reprocesses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Rebuild only the active hour bucket
    CurrentHour,
    /// Backfill the whole requested window, recent hours first
    FullRange,
}

/// Epinet aggregation events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EpinetEvent {
    /// A tenant run passed the throttle/loading guards and began
    LoadStarted {
        run_id: Uuid,
        tenant_id: String,
        mode: RunMode,
        hours: usize,
        timestamp: DateTime<Utc>,
    },

    /// One (funnel, chunk) pair was merged
    ///
    /// `completed`/`total` count funnels; `percent_complete` counts merged
    /// chunks.
    LoadProgress {
        run_id: Uuid,
        tenant_id: String,
        completed: usize,
        total: usize,
        percent_complete: u8,
        current_funnel_id: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// Run merged its results and trimmed stale hours
    LoadCompleted {
        run_id: Uuid,
        tenant_id: String,
        hours: usize,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// Run aborted; already merged chunks stay in the store
    LoadFailed {
        run_id: Uuid,
        tenant_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl EpinetEvent {
    /// Event name used as the SSE `event:` field
    pub fn event_type(&self) -> &'static str {
        match self {
            EpinetEvent::LoadStarted { .. } => "LoadStarted",
            EpinetEvent::LoadProgress { .. } => "LoadProgress",
            EpinetEvent::LoadCompleted { .. } => "LoadCompleted",
            EpinetEvent::LoadFailed { .. } => "LoadFailed",
        }
    }

    pub fn tenant_id(&self) -> &str {
        match self {
            EpinetEvent::LoadStarted { tenant_id, .. }
            | EpinetEvent::LoadProgress { tenant_id, .. }
            | EpinetEvent::LoadCompleted { tenant_id, .. }
            | EpinetEvent::LoadFailed { tenant_id, .. } => tenant_id,
        }
    }
}

/// Broadcast channel for [`EpinetEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EpinetEvent>,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// Slow subscribers lose the oldest events once `capacity` is exceeded.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<EpinetEvent> {
        self.tx.subscribe()
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: EpinetEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(tenant: &str) -> EpinetEvent {
        EpinetEvent::LoadFailed {
            run_id: Uuid::new_v4(),
            tenant_id: tenant.to_string(),
            error: "boom".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_emit_without_subscribers_is_harmless() {
        let bus = EventBus::new(8);
        bus.emit_lossy(failed("t1"));
        assert_eq!(bus.subscriber_count(), 0);

        let _rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_subscriber_receives_event() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.emit_lossy(failed("acme"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type(), "LoadFailed");
        assert_eq!(event.tenant_id(), "acme");
    }

    #[test]
    fn test_serialized_event_is_tagged() {
        let json = serde_json::to_value(EpinetEvent::LoadStarted {
            run_id: Uuid::nil(),
            tenant_id: "default".to_string(),
            mode: RunMode::CurrentHour,
            hours: 1,
            timestamp: Utc::now(),
        })
        .unwrap();
        assert_eq!(json["type"], "LoadStarted");
        assert_eq!(json["mode"], "current_hour");
    }
}
