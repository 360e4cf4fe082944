//! epinet-agg: hourly incremental funnel aggregation
//!
//! Raw belief and action events are classified against user-defined funnels
//! ("epinets"), aggregated into distinct visitors per node per hour, linked
//! into step-to-step transitions and served as Sankey views.

pub mod aggregate;
pub mod api;
pub mod classifier;
pub mod db;
pub mod error;
pub mod funnel;
pub mod orchestrator;
pub mod sankey;
pub mod source;
pub mod store;
pub mod transitions;

pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use chrono::{DateTime, Utc};
use epinet_common::events::EventBus;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::orchestrator::LoadOrchestrator;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<LoadOrchestrator>,
    /// Event bus for SSE broadcasting
    pub event_bus: EventBus,
    /// Node cap for Sankey views
    pub max_nodes: usize,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(orchestrator: Arc<LoadOrchestrator>, event_bus: EventBus, max_nodes: usize) -> Self {
        Self {
            orchestrator,
            event_bus,
            max_nodes,
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::get;

    Router::new()
        .merge(api::health_routes())
        .merge(api::epinet_routes())
        .route("/api/epinets/events", get(api::load_event_stream))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
