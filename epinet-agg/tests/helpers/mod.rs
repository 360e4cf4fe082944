//! Shared fakes for epinet-agg integration tests
//!
//! `FakeSource` keeps funnels and raw events in memory and filters them by
//! time range the way the SQL source does. Hooks let tests block a run
//! (`gate`), fail queries for older chunks (`fail_before`) or panic while
//! loading funnels (`panic_on_load`). Every event query is recorded.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::AtomicBool;
use epinet_agg::aggregate::MatchCriteria;
use epinet_agg::funnel::StoredFunnel;
use epinet_agg::orchestrator::LoadOrchestrator;
use epinet_agg::source::{ActionEvent, BeliefEvent, ContentMap, EpinetSource, SourceProvider};
use epinet_agg::store::MemoryStore;
use epinet_common::config::AggregationConfig;
use epinet_common::events::{EpinetEvent, EventBus};
use epinet_common::time::{Clock, ManualClock};
use epinet_common::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};

pub const TENANT: &str = "default";

pub fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
}

pub fn funnel_row(id: &str, payload: &str) -> StoredFunnel {
    StoredFunnel {
        id: id.to_string(),
        title: format!("Funnel {id}"),
        options_payload: Some(payload.to_string()),
    }
}

/// `[belief("Yes"), commitmentAction("CLICKED", objectType = "Pane")]`
pub fn belief_then_click(id: &str) -> StoredFunnel {
    funnel_row(
        id,
        r#"[
            {"gateType": "belief", "values": ["Yes"]},
            {"gateType": "commitmentAction", "values": ["CLICKED"], "objectType": "Pane"}
        ]"#,
    )
}

pub fn belief(visitor: &str, verb: &str, when: DateTime<Utc>) -> BeliefEvent {
    BeliefEvent {
        updated_at: when,
        fingerprint_id: visitor.to_string(),
        verb: verb.to_string(),
        object: None,
        belief_id: "belief-1".to_string(),
    }
}

pub fn click(visitor: &str, pane: &str, when: DateTime<Utc>) -> ActionEvent {
    ActionEvent {
        created_at: when,
        object_id: pane.to_string(),
        object_type: "Pane".to_string(),
        fingerprint_id: visitor.to_string(),
        verb: "CLICKED".to_string(),
    }
}

#[derive(Default)]
pub struct FakeSource {
    pub funnels: Mutex<Vec<StoredFunnel>>,
    pub beliefs: Mutex<Vec<BeliefEvent>>,
    pub actions: Mutex<Vec<ActionEvent>>,
    pub content: Mutex<ContentMap>,
    /// Event queries whose window starts before this instant fail
    pub fail_before: Mutex<Option<DateTime<Utc>>>,
    /// When set, each funnel load waits for one permit
    pub gate: Mutex<Option<Arc<Semaphore>>>,
    pub panic_on_load: AtomicBool,
    pub funnel_loads: AtomicUsize,
    pub belief_queries: Mutex<Vec<EventQuery>>,
    pub action_queries: Mutex<Vec<EventQuery>>,
}

/// One recorded event query
#[derive(Debug, Clone, PartialEq)]
pub struct EventQuery {
    pub criteria: MatchCriteria,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl FakeSource {
    pub fn with_funnels(funnels: Vec<StoredFunnel>) -> Self {
        let source = Self::default();
        *source.funnels.lock().unwrap() = funnels;
        source
    }

    pub fn push_belief(&self, event: BeliefEvent) {
        self.beliefs.lock().unwrap().push(event);
    }

    pub fn push_action(&self, event: ActionEvent) {
        self.actions.lock().unwrap().push(event);
    }

    pub fn runs(&self) -> usize {
        self.funnel_loads.load(Ordering::SeqCst)
    }

    pub fn belief_queries(&self) -> Vec<EventQuery> {
        self.belief_queries.lock().unwrap().clone()
    }

    pub fn action_queries(&self) -> Vec<EventQuery> {
        self.action_queries.lock().unwrap().clone()
    }

    fn check_failure(&self, start: DateTime<Utc>) -> Result<()> {
        match *self.fail_before.lock().unwrap() {
            Some(limit) if start < limit => Err(Error::Internal("event store unreachable".into())),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl EpinetSource for FakeSource {
    async fn load_funnel_rows(&self) -> Result<Vec<StoredFunnel>> {
        self.funnel_loads.fetch_add(1, Ordering::SeqCst);
        if self.panic_on_load.load(Ordering::SeqCst) {
            panic!("funnel storage blew up");
        }
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|e| Error::Internal(e.to_string()))?;
            permit.forget();
        }
        Ok(self.funnels.lock().unwrap().clone())
    }

    async fn belief_events(
        &self,
        criteria: &MatchCriteria,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<BeliefEvent>> {
        self.belief_queries.lock().unwrap().push(EventQuery {
            criteria: criteria.clone(),
            start,
            end,
        });
        self.check_failure(start)?;
        Ok(self
            .beliefs
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.updated_at >= start && e.updated_at < end)
            .cloned()
            .collect())
    }

    async fn action_events(
        &self,
        criteria: &MatchCriteria,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ActionEvent>> {
        self.action_queries.lock().unwrap().push(EventQuery {
            criteria: criteria.clone(),
            start,
            end,
        });
        self.check_failure(start)?;
        Ok(self
            .actions
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.created_at >= start && e.created_at < end)
            .cloned()
            .collect())
    }

    async fn content_titles(&self) -> Result<ContentMap> {
        Ok(self.content.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct FakeProvider {
    pub sources: HashMap<String, Arc<FakeSource>>,
}

#[async_trait]
impl SourceProvider for FakeProvider {
    async fn source_for(&self, tenant_id: &str) -> Result<Arc<dyn EpinetSource>> {
        self.sources
            .get(tenant_id)
            .map(|s| Arc::clone(s) as Arc<dyn EpinetSource>)
            .ok_or_else(|| Error::NotFound(format!("Unknown tenant: {tenant_id}")))
    }
}

/// Small windows so chunking is visible: 24 hours, recent chunk of 4,
/// historical chunks of 8, no pause between chunks
pub fn test_config() -> AggregationConfig {
    AggregationConfig {
        max_hours: 24,
        throttle_secs: 60,
        recent_chunk_hours: 4,
        historical_chunk_hours: 8,
        chunk_yield_ms: 0,
        refresh_interval_secs: 300,
        tenants: vec![TENANT.to_string()],
    }
}

pub struct Harness {
    pub orchestrator: Arc<LoadOrchestrator>,
    pub source: Arc<FakeSource>,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub event_bus: EventBus,
}

impl Harness {
    pub fn new(source: FakeSource, now: DateTime<Utc>) -> Self {
        Self::with_config(source, now, test_config())
    }

    pub fn with_config(source: FakeSource, now: DateTime<Utc>, config: AggregationConfig) -> Self {
        let source = Arc::new(source);
        let provider = FakeProvider {
            sources: HashMap::from([(TENANT.to_string(), Arc::clone(&source))]),
        };
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(now));
        let event_bus = EventBus::new(1000);

        let orchestrator = Arc::new(LoadOrchestrator::new(
            Arc::new(provider),
            store.clone(),
            clock.clone() as Arc<dyn Clock>,
            event_bus.clone(),
            config,
        ));

        Self {
            orchestrator,
            source,
            store,
            clock,
            event_bus,
        }
    }

    /// Move past the throttle interval without leaving the hour
    pub fn step_past_throttle(&self) {
        self.clock.advance(chrono::Duration::seconds(61));
    }

    /// Poll until the tenant's load finishes
    pub async fn wait_idle(&self) {
        for _ in 0..500 {
            if !self.orchestrator.status(TENANT).loading {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("load did not finish");
    }
}

/// Drain everything currently buffered on a subscription
pub fn drain(rx: &mut broadcast::Receiver<EpinetEvent>) -> Vec<EpinetEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
