//! Incremental load orchestrator
//!
//! Drives one aggregation run per tenant:
//! plan → load funnels → per chunk (recent first): query, classify, infer
//! transitions, merge → trim (full range only) → record metadata.
//!
//! Each (funnel, chunk) result is merged as soon as it is complete, so recent
//! hours become readable while older history is still being backfilled, and
//! a failing run leaves everything merged before the failure in place.
//!
//! A started run always ends in `idle` or `idle with error`: if its future is
//! dropped early (task panic, cancelled caller) its `RunGuard` records the
//! abort.

mod load_state;
mod planner;

pub use load_state::{LoadProgress, LoadStateRegistry, LoadStatus, ProgressStatus, RefreshOutcome};
pub use planner::{chunk_hour_keys, plan_refresh, RefreshPlan};

use chrono::{DateTime, Utc};
use epinet_common::config::AggregationConfig;
use epinet_common::events::{EpinetEvent, EventBus, RunMode};
use epinet_common::hour_key::{hour_keys_for_range, range_bounds};
use epinet_common::time::Clock;
use epinet_common::{HourKey, Result};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::aggregate::{aggregate_funnel, fetch_chunk_events, MatchCriteria};
use crate::funnel::Funnel;
use crate::source::{ContentMap, EpinetSource, SourceProvider};
use crate::store::{merge_funnel_hours, trim_outside_window, EpinetStore, TenantMeta};

/// Per-tenant aggregation driver
pub struct LoadOrchestrator {
    sources: Arc<dyn SourceProvider>,
    store: Arc<dyn EpinetStore>,
    clock: Arc<dyn Clock>,
    event_bus: EventBus,
    config: AggregationConfig,
    states: Arc<LoadStateRegistry>,
}

/// Error recorded when a run's future is dropped before it finishes
pub const RUN_ABORTED: &str = "Load aborted before completion";

/// Owns the `loading` state of one started run
///
/// Dropping the guard without [`RunGuard::finish`] returns the tenant to idle
/// with [`RUN_ABORTED`] and publishes `LoadFailed`.
struct RunGuard {
    tenant: String,
    run_id: Uuid,
    states: Arc<LoadStateRegistry>,
    event_bus: EventBus,
    clock: Arc<dyn Clock>,
    finished: bool,
}

impl RunGuard {
    fn finish(mut self, error: Option<String>) {
        self.finished = true;
        self.states.finish(&self.tenant, error);
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        error!(tenant_id = %self.tenant, run_id = %self.run_id, "Epinet load aborted");
        self.states.finish(&self.tenant, Some(RUN_ABORTED.to_string()));
        self.event_bus.emit_lossy(EpinetEvent::LoadFailed {
            run_id: self.run_id,
            tenant_id: self.tenant.clone(),
            error: RUN_ABORTED.to_string(),
            timestamp: self.clock.now(),
        });
    }
}

/// Everything a chunk needs that stays fixed for the whole run
struct RunContext<'a> {
    tenant: &'a str,
    run_id: Uuid,
    source: &'a dyn EpinetSource,
    funnels: &'a [Funnel],
    criteria: &'a MatchCriteria,
    content: &'a ContentMap,
}

impl LoadOrchestrator {
    pub fn new(
        sources: Arc<dyn SourceProvider>,
        store: Arc<dyn EpinetStore>,
        clock: Arc<dyn Clock>,
        event_bus: EventBus,
        config: AggregationConfig,
    ) -> Self {
        Self {
            sources,
            store,
            clock,
            event_bus,
            config,
            states: Arc::new(LoadStateRegistry::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn EpinetStore> {
        &self.store
    }

    pub fn sources(&self) -> &Arc<dyn SourceProvider> {
        &self.sources
    }

    pub fn config(&self) -> &AggregationConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Load status for `tenant`
    pub fn status(&self, tenant: &str) -> LoadStatus {
        self.states.status(tenant)
    }

    /// Refresh `tenant` and wait for the run to finish
    ///
    /// Throttled and duplicate calls return immediately. A failed run is not
    /// an error to the caller; it is recorded in [`LoadOrchestrator::status`].
    pub async fn refresh(&self, tenant: &str) -> RefreshOutcome {
        match self.begin(tenant) {
            Ok(guard) => {
                self.run(guard).await;
                RefreshOutcome::Started
            }
            Err(outcome) => outcome,
        }
    }

    /// Refresh `tenant` in a background task
    ///
    /// The guards are evaluated before returning, so the outcome is exact.
    pub fn trigger_refresh(self: &Arc<Self>, tenant: &str) -> RefreshOutcome {
        match self.begin(tenant) {
            Ok(guard) => {
                let orchestrator = Arc::clone(self);
                tokio::spawn(async move {
                    orchestrator.run(guard).await;
                });
                RefreshOutcome::Started
            }
            Err(outcome) => outcome,
        }
    }

    /// Enter `loading` for `tenant`, or report why the run is skipped
    fn begin(&self, tenant: &str) -> std::result::Result<RunGuard, RefreshOutcome> {
        let outcome = self
            .states
            .try_begin(tenant, self.clock.now(), self.config.throttle());
        if outcome != RefreshOutcome::Started {
            debug!(tenant_id = %tenant, ?outcome, "Refresh skipped");
            return Err(outcome);
        }
        Ok(RunGuard {
            tenant: tenant.to_string(),
            run_id: Uuid::new_v4(),
            states: Arc::clone(&self.states),
            event_bus: self.event_bus.clone(),
            clock: Arc::clone(&self.clock),
            finished: false,
        })
    }

    async fn run(&self, guard: RunGuard) {
        let tenant = guard.tenant.clone();
        let tenant = tenant.as_str();
        let run_id = guard.run_id;
        let started = Instant::now();

        match self.execute(tenant, run_id).await {
            Ok(hours) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                info!(tenant_id = %tenant, %run_id, hours, duration_ms, "Epinet load completed");
                guard.finish(None);
                self.event_bus.emit_lossy(EpinetEvent::LoadCompleted {
                    run_id,
                    tenant_id: tenant.to_string(),
                    hours,
                    duration_ms,
                    timestamp: self.clock.now(),
                });
            }
            Err(e) => {
                error!(tenant_id = %tenant, %run_id, error = %e, "Epinet load failed");
                guard.finish(Some(e.to_string()));
                self.event_bus.emit_lossy(EpinetEvent::LoadFailed {
                    run_id,
                    tenant_id: tenant.to_string(),
                    error: e.to_string(),
                    timestamp: self.clock.now(),
                });
            }
        }
    }

    /// The run body; returns the number of hours processed
    async fn execute(&self, tenant: &str, run_id: Uuid) -> Result<usize> {
        let now = self.clock.now();
        let source = self.sources.source_for(tenant).await?;

        let funnels: Vec<Funnel> = source
            .load_funnel_rows()
            .await?
            .iter()
            .map(Funnel::from_stored)
            .collect();
        if funnels.is_empty() {
            info!(tenant_id = %tenant, "No epinets defined, nothing to aggregate");
            return Ok(0);
        }

        let has_data = self.store.has_data(tenant).await?;
        let meta = self.store.tenant_meta(tenant).await?;
        let plan = plan_refresh(has_data, &meta, now, self.config.max_hours);
        let keys = plan.hour_keys(now);
        let chunks = chunk_hour_keys(
            &keys,
            self.config.recent_chunk_hours,
            self.config.historical_chunk_hours,
        );

        info!(
            tenant_id = %tenant,
            %run_id,
            mode = ?plan.mode,
            hours = plan.hours,
            funnels = funnels.len(),
            chunks = chunks.len(),
            "Epinet load started"
        );
        self.states.set_plan(tenant, funnels.len(), chunks.len());
        self.event_bus.emit_lossy(EpinetEvent::LoadStarted {
            run_id,
            tenant_id: tenant.to_string(),
            mode: plan.mode,
            hours: plan.hours,
            timestamp: now,
        });

        let criteria = MatchCriteria::from_funnels(&funnels);
        let content = match source.content_titles().await {
            Ok(content) => content,
            Err(e) => {
                warn!(tenant_id = %tenant, error = %e, "Content titles unavailable, using placeholders");
                ContentMap::new()
            }
        };

        let ctx = RunContext {
            tenant,
            run_id,
            source: source.as_ref(),
            funnels: &funnels,
            criteria: &criteria,
            content: &content,
        };

        for (i, chunk) in chunks.iter().enumerate() {
            if i > 0 {
                self.pause_between_chunks().await;
            }
            let last_chunk = i + 1 == chunks.len();
            self.process_chunk(&ctx, chunk, last_chunk).await?;
        }

        if plan.mode == RunMode::FullRange {
            let window = retention_window(now, self.config.max_hours);
            let removed = trim_outside_window(self.store.as_ref(), tenant, &window).await?;
            if removed > 0 {
                info!(tenant_id = %tenant, removed, "Trimmed hour buckets outside retention window");
            }
        }

        self.store
            .set_tenant_meta(
                tenant,
                TenantMeta {
                    last_full_hour: Some(HourKey::containing(now)),
                    last_update_time: Some(now),
                },
            )
            .await?;

        Ok(keys.len())
    }

    /// Query, aggregate and merge one chunk for every funnel
    async fn process_chunk(
        &self,
        ctx: &RunContext<'_>,
        chunk: &[HourKey],
        last_chunk: bool,
    ) -> Result<()> {
        let Some((start, end)) = range_bounds(chunk) else {
            return Ok(());
        };

        let events = fetch_chunk_events(ctx.source, ctx.criteria, start, end).await?;
        debug!(
            tenant_id = %ctx.tenant,
            %start,
            %end,
            beliefs = events.beliefs.len(),
            actions = events.actions.len(),
            "Fetched chunk events"
        );

        let hours: BTreeSet<HourKey> = chunk.iter().copied().collect();
        for funnel in ctx.funnels {
            self.states.funnel_started(ctx.tenant, &funnel.id);

            let aggregated = aggregate_funnel(funnel, &hours, &events, ctx.content);
            merge_funnel_hours(self.store.as_ref(), ctx.tenant, &funnel.id, chunk, aggregated)
                .await?;

            let progress = self.states.chunk_merged(ctx.tenant, last_chunk);
            self.event_bus.emit_lossy(EpinetEvent::LoadProgress {
                run_id: ctx.run_id,
                tenant_id: ctx.tenant.to_string(),
                completed: progress.completed,
                total: progress.total,
                percent_complete: progress.percent_complete(),
                current_funnel_id: Some(funnel.id.clone()),
                timestamp: self.clock.now(),
            });
        }
        Ok(())
    }

    async fn pause_between_chunks(&self) {
        let pause = self.config.chunk_yield();
        if pause.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(pause).await;
        }
    }
}

/// The `max_hours` hour keys ending at the current hour
fn retention_window(now: DateTime<Utc>, max_hours: usize) -> BTreeSet<HourKey> {
    hour_keys_for_range(now, max_hours).into_iter().collect()
}
