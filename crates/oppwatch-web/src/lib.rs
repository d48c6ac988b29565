//! Axum JSON API for Opportunity Watch: the read path that serves cached
//! opportunities while refreshes happen in the background.

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use oppwatch_core::EnrichedOpportunity;
use oppwatch_sync::{
    filter_opportunities, generate_alerts, live_opportunities, maybe_build_scheduler, AppContext,
    IngestConfig, OpportunityFilter,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "oppwatch-web";

#[derive(Clone)]
pub struct AppState {
    pub ctx: AppContext,
}

impl AppState {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }
}

#[derive(Debug, Deserialize, Default)]
struct OpportunitiesQuery {
    search: Option<String>,
    region: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    page: Option<usize>,
    per_page: Option<usize>,
    user: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
struct AlertsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OpportunityRow {
    pub id: i64,
    pub source_id: i64,
    pub title: String,
    pub company: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub region: String,
    pub deadline: String,
    pub url: String,
    pub summary: String,
    pub salary: String,
    pub duration: String,
    pub online: bool,
    pub source: String,
    pub category: String,
    pub relevance: u32,
}

impl From<EnrichedOpportunity> for OpportunityRow {
    fn from(enriched: EnrichedOpportunity) -> Self {
        let opp = enriched.opportunity;
        Self {
            id: opp.id,
            source_id: opp.source_id,
            title: opp.title,
            company: opp.company,
            kind: opp.kind,
            region: opp.region,
            deadline: opp.deadline,
            url: opp.url,
            summary: enriched.summary,
            salary: opp.salary,
            duration: opp.duration,
            online: opp.online,
            source: opp.source_name,
            category: enriched.category,
            relevance: enriched.relevance,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct OpportunitiesResponse {
    pub opportunities: Vec<OpportunityRow>,
    pub total_count: usize,
    pub total_available: usize,
    pub page: usize,
    pub total_pages: usize,
    pub regions: Vec<String>,
    pub types: Vec<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/opportunities", get(opportunities_handler))
        .route("/sources", get(sources_handler))
        .route("/refresh", post(refresh_handler))
        .route("/users/{id}/alerts", post(alerts_handler))
        .with_state(Arc::new(state))
}

/// Build state from the environment and serve until shutdown.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("OPPWATCH_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let ctx = oppwatch_sync::bootstrap(IngestConfig::from_env()).await?;

    // The scheduler, when enabled, shares the coordinator so scheduled and
    // read-triggered refreshes stay single-flight.
    let scheduler = maybe_build_scheduler(&ctx.config, Arc::clone(&ctx.coordinator)).await?;
    if let Some(scheduler) = &scheduler {
        scheduler.start().await?;
    }

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving");
    axum::serve(listener, app(AppState::new(ctx))).await?;
    drop(scheduler);
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let sources = match state.ctx.store.all_sources().await {
        Ok(sources) => sources,
        Err(err) => return server_error(err.to_string()),
    };
    let opportunities = match state.ctx.store.count_opportunities().await {
        Ok(count) => count,
        Err(err) => return server_error(err.to_string()),
    };
    Json(serde_json::json!({
        "sources": sources.len(),
        "opportunities": opportunities,
        "refreshing": state.ctx.coordinator.is_refreshing(),
    }))
    .into_response()
}

async fn opportunities_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OpportunitiesQuery>,
) -> Response {
    let all = match live_opportunities(&state.ctx, query.user, None).await {
        Ok(all) => all,
        Err(err) => return server_error(err.to_string()),
    };

    let filter = OpportunityFilter {
        query: query.search.clone().filter(|s| !s.is_empty()),
        region: query.region.clone().filter(|s| !s.is_empty()),
        kind: query.kind.clone().filter(|s| !s.is_empty()),
    };
    let filtered = filter_opportunities(&all, &filter);

    // Distinct values for the filter dropdowns, taken from the unfiltered
    // list the way the presentation layer expects them.
    let regions: Vec<String> = all
        .iter()
        .flat_map(|e| e.opportunity.region.split(','))
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let types: Vec<String> = all
        .iter()
        .map(|e| e.opportunity.kind.trim().to_string())
        .filter(|k| !k.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let per_page = query.per_page.unwrap_or(state.ctx.config.page_size).max(1);
    let total_count = filtered.len();
    let total_pages = total_count.max(1).div_ceil(per_page);
    let page = query.page.unwrap_or(1).clamp(1, total_pages);
    let start = (page - 1) * per_page;
    let rows: Vec<OpportunityRow> = filtered
        .into_iter()
        .skip(start)
        .take(per_page)
        .map(OpportunityRow::from)
        .collect();

    Json(OpportunitiesResponse {
        opportunities: rows,
        total_count,
        total_available: all.len(),
        page,
        total_pages,
        regions,
        types,
    })
    .into_response()
}

async fn sources_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.ctx.store.all_sources().await {
        Ok(sources) => Json(sources).into_response(),
        Err(err) => server_error(err.to_string()),
    }
}

/// Explicit trigger; answers immediately with whether a run started or one
/// was already in flight.
async fn refresh_handler(State(state): State<Arc<AppState>>) -> Response {
    let outcome = state.ctx.coordinator.request_refresh();
    Json(serde_json::json!({ "refresh": outcome.as_str() })).into_response()
}

async fn alerts_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(user_id): AxumPath<i64>,
    Query(query): Query<AlertsQuery>,
) -> Response {
    match generate_alerts(&state.ctx, user_id, query.limit.unwrap_or(20)).await {
        Ok(generated) => Json(serde_json::json!({
            "user_id": user_id,
            "generated": generated,
        }))
        .into_response(),
        Err(err) => server_error(err.to_string()),
    }
}

fn server_error(message: String) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}
