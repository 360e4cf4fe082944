//! Per-tenant load state
//!
//! State machine: `idle → loading → (idle | idle with error)`. The registry is
//! owned by the orchestrator and guarded by a plain mutex: every access is
//! short and never held across an await.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Outcome of a refresh request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshOutcome {
    /// Guards passed and a run began
    Started,
    /// A run for this tenant is already in progress
    AlreadyLoading,
    /// The previous attempt was too recent
    Throttled,
}

/// Run progress counters
///
/// `total` and `completed` count funnels; a funnel is completed once its last
/// chunk has been merged. The percentage is finer grained: it counts merged
/// (funnel, chunk) units.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadProgress {
    pub total: usize,
    pub completed: usize,
    pub current_funnel_id: Option<String>,
    units_total: usize,
    units_completed: usize,
}

impl LoadProgress {
    /// Rounded completion percentage, 0 when nothing is planned
    pub fn percent_complete(&self) -> u8 {
        let (done, total) = if self.units_total > 0 {
            (self.units_completed, self.units_total)
        } else {
            (self.completed, self.total)
        };
        if total == 0 {
            return 0;
        }
        let pct = (done as f64 / total as f64 * 100.0).round();
        pct.clamp(0.0, 100.0) as u8
    }
}

#[derive(Debug, Clone, Default)]
struct LoadState {
    loading: bool,
    last_attempt: Option<DateTime<Utc>>,
    error: Option<String>,
    progress: LoadProgress,
}

/// Progress section of [`LoadStatus`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressStatus {
    pub total: usize,
    pub completed: usize,
    pub current_funnel_id: Option<String>,
    pub percent_complete: u8,
}

/// Snapshot of a tenant's load state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadStatus {
    pub loading: bool,
    pub last_attempt: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub progress: ProgressStatus,
}

impl From<&LoadState> for LoadStatus {
    fn from(state: &LoadState) -> Self {
        Self {
            loading: state.loading,
            last_attempt: state.last_attempt,
            error: state.error.clone(),
            progress: ProgressStatus {
                total: state.progress.total,
                completed: state.progress.completed,
                current_funnel_id: state.progress.current_funnel_id.clone(),
                percent_complete: state.progress.percent_complete(),
            },
        }
    }
}

/// Load state of every tenant
#[derive(Debug, Default)]
pub struct LoadStateRegistry {
    states: Mutex<HashMap<String, LoadState>>,
}

impl LoadStateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, LoadState>> {
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Check both guards and, if they pass, enter `loading`
    ///
    /// The attempt time is recorded only when the run actually starts.
    pub fn try_begin(&self, tenant: &str, now: DateTime<Utc>, throttle: Duration) -> RefreshOutcome {
        let mut states = self.lock();
        let state = states.entry(tenant.to_string()).or_default();

        if state.loading {
            return RefreshOutcome::AlreadyLoading;
        }
        if let Some(last) = state.last_attempt {
            let elapsed = now.signed_duration_since(last);
            let within = chrono::Duration::from_std(throttle)
                .map(|throttle| elapsed < throttle)
                .unwrap_or(true);
            if within {
                return RefreshOutcome::Throttled;
            }
        }

        state.loading = true;
        state.last_attempt = Some(now);
        state.error = None;
        state.progress = LoadProgress::default();
        RefreshOutcome::Started
    }

    /// Reset progress for a run over `funnels` funnels in `chunks` chunks
    pub fn set_plan(&self, tenant: &str, funnels: usize, chunks: usize) {
        let mut states = self.lock();
        let state = states.entry(tenant.to_string()).or_default();
        state.progress = LoadProgress {
            total: funnels,
            units_total: funnels * chunks,
            ..LoadProgress::default()
        };
    }

    pub fn funnel_started(&self, tenant: &str, funnel_id: &str) {
        let mut states = self.lock();
        let state = states.entry(tenant.to_string()).or_default();
        state.progress.current_funnel_id = Some(funnel_id.to_string());
    }

    /// Count one merged (funnel, chunk) unit and return the new progress
    ///
    /// `last_chunk` marks the funnel itself as completed.
    pub fn chunk_merged(&self, tenant: &str, last_chunk: bool) -> LoadProgress {
        let mut states = self.lock();
        let progress = &mut states.entry(tenant.to_string()).or_default().progress;
        progress.units_completed = (progress.units_completed + 1).min(progress.units_total);
        if last_chunk {
            progress.completed = (progress.completed + 1).min(progress.total);
        }
        progress.clone()
    }

    /// Leave `loading`, keeping `error` for status queries
    pub fn finish(&self, tenant: &str, error: Option<String>) {
        let mut states = self.lock();
        let state = states.entry(tenant.to_string()).or_default();
        state.loading = false;
        state.error = error;
        state.progress.current_funnel_id = None;
    }

    /// Status of `tenant`; unknown tenants report idle
    pub fn status(&self, tenant: &str) -> LoadStatus {
        let states = self.lock();
        match states.get(tenant) {
            Some(state) => LoadStatus::from(state),
            None => LoadStatus::from(&LoadState::default()),
        }
    }
}
