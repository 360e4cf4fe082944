//! Epinet load control and Sankey read endpoints

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ApiError, ApiResult};
use crate::funnel::StoredFunnel;
use crate::orchestrator::{LoadStatus, RefreshOutcome};
use crate::sankey::{compute_sankey, filtered_visitor_ids, HourWindow, SankeyView};
use crate::AppState;

/// Hours shown when a request names no window
pub const DEFAULT_VIEW_HOURS: usize = 168;

/// Hour window query parameters
///
/// Either `hours` (last N hours) or both `start_hour` and `end_hour`
/// ("hours ago" offsets, either order).
#[derive(Debug, Default, Deserialize)]
pub struct WindowQuery {
    pub hours: Option<usize>,
    pub start_hour: Option<u32>,
    pub end_hour: Option<u32>,
    /// Restrict the view to one visitor
    pub visitor: Option<String>,
}

impl WindowQuery {
    pub fn window(&self) -> ApiResult<HourWindow> {
        match (self.start_hour, self.end_hour) {
            (Some(start_hours_ago), Some(end_hours_ago)) => Ok(HourWindow::Between {
                start_hours_ago,
                end_hours_ago,
            }),
            (None, None) => match self.hours.unwrap_or(DEFAULT_VIEW_HOURS) {
                0 => Err(ApiError::BadRequest("hours must be at least 1".to_string())),
                hours => Ok(HourWindow::LastHours(hours)),
            },
            _ => Err(ApiError::BadRequest(
                "start_hour and end_hour must be given together".to_string(),
            )),
        }
    }
}

/// POST /api/epinets/:tenant/refresh response
#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    pub tenant_id: String,
    pub outcome: RefreshOutcome,
}

/// GET /api/epinets/:tenant/:funnel_id/sankey response
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum SankeyResponse {
    /// Stored data; `loading` flags a run still in progress
    Ready {
        #[serde(flatten)]
        view: SankeyView,
        loading: bool,
    },
    /// Nothing stored yet; a load is running
    Loading {
        status: &'static str,
        message: String,
        percent_complete: u8,
    },
}

#[derive(Debug, Serialize)]
pub struct VisitorsResponse {
    pub funnel_id: String,
    pub visitor_ids: Vec<String>,
}

/// GET /api/epinets/:tenant/status
pub async fn get_status(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
) -> Json<LoadStatus> {
    Json(state.orchestrator.status(&tenant))
}

/// POST /api/epinets/:tenant/refresh
///
/// Returns 202 at once; the run continues in the background.
pub async fn post_refresh(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
) -> ApiResult<(StatusCode, Json<RefreshResponse>)> {
    state.orchestrator.sources().source_for(&tenant).await?;

    let outcome = state.orchestrator.trigger_refresh(&tenant);
    info!(tenant_id = %tenant, ?outcome, "Refresh requested");

    Ok((
        StatusCode::ACCEPTED,
        Json(RefreshResponse {
            tenant_id: tenant,
            outcome,
        }),
    ))
}

async fn find_funnel(state: &AppState, tenant: &str, funnel_id: &str) -> ApiResult<StoredFunnel> {
    let source = state.orchestrator.sources().source_for(tenant).await?;
    source
        .load_funnel_rows()
        .await?
        .into_iter()
        .find(|f| f.id == funnel_id)
        .ok_or_else(|| ApiError::NotFound(format!("Epinet not found: {funnel_id}")))
}

/// GET /api/epinets/:tenant/:funnel_id/sankey
pub async fn get_sankey(
    State(state): State<AppState>,
    Path((tenant, funnel_id)): Path<(String, String)>,
    Query(query): Query<WindowQuery>,
) -> ApiResult<Json<SankeyResponse>> {
    let window = query.window()?;
    let funnel = find_funnel(&state, &tenant, &funnel_id).await?;

    let orchestrator = &state.orchestrator;
    let keys = window.hour_keys(orchestrator.clock().now(), orchestrator.config().max_hours);
    let store = orchestrator.store().as_ref();

    let view = compute_sankey(
        store,
        &tenant,
        &funnel.id,
        &funnel.title,
        &keys,
        query.visitor.as_deref(),
        state.max_nodes,
    )
    .await?;
    let status = orchestrator.status(&tenant);

    if let Some(view) = view {
        return Ok(Json(SankeyResponse::Ready {
            view,
            loading: status.loading,
        }));
    }

    // Loaded before and idle: the window simply has no matching activity
    let meta = store.tenant_meta(&tenant).await?;
    if meta.last_update_time.is_some() && !status.loading {
        return Ok(Json(SankeyResponse::Ready {
            view: SankeyView {
                id: funnel.id,
                title: funnel.title,
                nodes: Vec::new(),
                links: Vec::new(),
            },
            loading: false,
        }));
    }

    if !status.loading {
        orchestrator.trigger_refresh(&tenant);
    }
    let percent_complete = orchestrator.status(&tenant).progress.percent_complete;
    Ok(Json(SankeyResponse::Loading {
        status: "loading",
        message: "Epinet data is being computed".to_string(),
        percent_complete,
    }))
}

/// GET /api/epinets/:tenant/:funnel_id/visitors
pub async fn get_visitors(
    State(state): State<AppState>,
    Path((tenant, funnel_id)): Path<(String, String)>,
    Query(query): Query<WindowQuery>,
) -> ApiResult<Json<VisitorsResponse>> {
    let window = query.window()?;
    let funnel = find_funnel(&state, &tenant, &funnel_id).await?;

    let orchestrator = &state.orchestrator;
    let keys = window.hour_keys(orchestrator.clock().now(), orchestrator.config().max_hours);
    let visitor_ids =
        filtered_visitor_ids(orchestrator.store().as_ref(), &tenant, &funnel.id, &keys).await?;

    Ok(Json(VisitorsResponse {
        funnel_id: funnel.id,
        visitor_ids,
    }))
}

/// Build epinet routes
pub fn epinet_routes() -> Router<AppState> {
    Router::new()
        .route("/api/epinets/:tenant/status", get(get_status))
        .route("/api/epinets/:tenant/refresh", post(post_refresh))
        .route("/api/epinets/:tenant/:funnel_id/sankey", get(get_sankey))
        .route("/api/epinets/:tenant/:funnel_id/visitors", get(get_visitors))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_query_parsing() {
        assert_eq!(
            WindowQuery::default().window().unwrap(),
            HourWindow::LastHours(DEFAULT_VIEW_HOURS)
        );

        let query = WindowQuery {
            start_hour: Some(10),
            end_hour: Some(2),
            ..Default::default()
        };
        assert_eq!(
            query.window().unwrap(),
            HourWindow::Between {
                start_hours_ago: 10,
                end_hours_ago: 2
            }
        );

        let half = WindowQuery {
            start_hour: Some(10),
            ..Default::default()
        };
        assert!(matches!(half.window(), Err(ApiError::BadRequest(_))));

        let zero = WindowQuery {
            hours: Some(0),
            ..Default::default()
        };
        assert!(zero.window().is_err());
    }
}
