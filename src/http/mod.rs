//! axum router, request validation, and SSE event framing.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path as AxPath, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::catalog;
use crate::config::Config;
use crate::error::ApiError;
use crate::jobs::{JobManager, JobParams};
use crate::land::LandDataset;
use crate::overpass::OverpassClient;
use crate::preview;

const MAX_DETAILS_IDS: usize = 500;
const MAX_PREVIEW_IDS: usize = 400;
const MAX_LAND_PREVIEW_IDS: usize = 200;
const MAX_JOB_IDS: usize = 5000;

pub struct AppState {
    pub config: Arc<Config>,
    pub overpass: Arc<OverpassClient>,
    pub land: Arc<LandDataset>,
    pub jobs: Arc<JobManager>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/land-polygons/status", get(land_polygons_status))
        .route("/api/areas/search", post(search_areas))
        .route("/api/catalog/ids", post(catalog_ids))
        .route("/api/catalog/details", post(catalog_details))
        .route("/api/catalog/preview", post(catalog_preview))
        .route("/api/catalog/land-preview", post(catalog_land_preview))
        .route("/api/jobs", post(create_job))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/jobs/{id}/cancel", post(cancel_job))
        .route("/api/jobs/{id}/events", get(job_events))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "ok": true,
        "land_polygons_present": state.land.is_loaded() || state.land.zip_path().exists(),
        "active_jobs": state.jobs.active_job_count(),
    }))
}

async fn land_polygons_status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(crate::land::land_polygons_status(state.land.zip_path()))
}

#[derive(Debug, Deserialize)]
struct SearchAreasRequest {
    query: String,
    admin_level: Option<String>,
    #[serde(default = "default_search_limit")]
    limit: usize,
}

fn default_search_limit() -> usize {
    50
}

async fn search_areas(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SearchAreasRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let items = catalog::search_admin_areas(
        &state.overpass,
        &state.config.cache_dir(),
        &req.query,
        req.admin_level.as_deref(),
        req.limit,
        state.config.http_timeout_sec,
    )
    .await?;
    Ok(Json(json!({ "items": items })))
}

#[derive(Debug, Deserialize)]
struct CatalogIdsRequest {
    admin_level: String,
    parent_relation_id: Option<i64>,
}

fn requires_world_scope_at_level_two(admin_level: &str, parent_relation_id: Option<i64>) -> Result<(), ApiError> {
    let worldwide = parent_relation_id.unwrap_or(0) <= 0;
    if worldwide && admin_level != "2" {
        return Err(ApiError::BadRequest(
            "worldwide scope (no parent_relation_id) is only valid for admin_level 2".to_string(),
        ));
    }
    Ok(())
}

async fn catalog_ids(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CatalogIdsRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    requires_world_scope_at_level_two(&req.admin_level, req.parent_relation_id)?;
    let parent = req.parent_relation_id.filter(|id| *id > 0);

    let relation_ids = catalog::list_relation_ids(
        &state.overpass,
        &state.config.cache_dir(),
        &req.admin_level,
        parent,
        state.config.http_timeout_sec,
    )
    .await?;

    let items = if parent.is_none() {
        catalog::list_countries_items_fast(&state.overpass, &state.config.cache_dir(), state.config.http_timeout_sec)
            .await
            .ok()
    } else {
        catalog::list_parent_items_fast(
            &state.overpass,
            &state.config.cache_dir(),
            &req.admin_level,
            parent.unwrap(),
            state.config.http_timeout_sec,
        )
        .await
        .ok()
    };

    let count = relation_ids.len();
    Ok(Json(json!({
        "relation_ids": relation_ids,
        "count": count,
        "items": items,
    })))
}

#[derive(Debug, Deserialize)]
struct CatalogDetailsRequest {
    relation_ids: Vec<i64>,
}

async fn catalog_details(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CatalogDetailsRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if req.relation_ids.len() > MAX_DETAILS_IDS {
        return Err(ApiError::BadRequest(format!(
            "relation_ids exceeds the maximum of {MAX_DETAILS_IDS}"
        )));
    }
    let items = catalog::fetch_relation_details(&state.overpass, &req.relation_ids, state.config.http_timeout_sec).await;
    Ok(Json(json!({ "items": items })))
}

#[derive(Debug, Deserialize)]
struct CatalogPreviewRequest {
    relation_ids: Vec<i64>,
    admin_level: Option<String>,
    parent_relation_id: Option<i64>,
    #[serde(default)]
    fix_antimeridian: bool,
    overpass_url: Option<String>,
}

async fn catalog_preview(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CatalogPreviewRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if req.relation_ids.len() > MAX_PREVIEW_IDS {
        return Err(ApiError::BadRequest(format!(
            "relation_ids exceeds the maximum of {MAX_PREVIEW_IDS}"
        )));
    }
    let _ = req.fix_antimeridian;
    let adm_name = req.parent_relation_id.map(|r| format!("scope_r{r}"));
    let fc = preview::preview_features(
        &state.config,
        &state.overpass,
        &req.relation_ids,
        adm_name.as_deref(),
        req.admin_level.as_deref(),
        req.overpass_url.as_deref(),
        state.config.http_timeout_sec,
    )
    .await;
    Ok(Json(fc))
}

#[derive(Debug, Deserialize)]
struct CatalogLandPreviewRequest {
    relation_ids: Vec<i64>,
    admin_level: String,
    parent_relation_id: Option<i64>,
}

async fn catalog_land_preview(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CatalogLandPreviewRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if req.relation_ids.len() > MAX_LAND_PREVIEW_IDS {
        return Err(ApiError::BadRequest(format!(
            "relation_ids exceeds the maximum of {MAX_LAND_PREVIEW_IDS}"
        )));
    }
    let adm_name = req.parent_relation_id.map(|r| format!("scope_r{r}")).unwrap_or_else(|| "world".to_string());
    let fc = preview::land_preview_features(&state.config.geojson_dir(), &req.relation_ids, &adm_name, &req.admin_level);
    Ok(Json(fc))
}

#[derive(Debug, Deserialize)]
struct CreateJobRequest {
    admin_level: String,
    parent_relation_id: Option<i64>,
    selected_relation_ids: Vec<i64>,
    #[serde(default)]
    relation_names: HashMap<i64, String>,
    #[serde(default)]
    clip_land: bool,
    #[serde(default)]
    force_refresh_osm_source: bool,
    #[serde(default = "default_fix_antimeridian")]
    fix_antimeridian: bool,
    overpass_url: Option<String>,
}

fn default_fix_antimeridian() -> bool {
    true
}

#[derive(Debug, Serialize)]
struct CreateJobResponse {
    job_id: String,
    adm_name: String,
    admin_level: String,
}

async fn create_job(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateJobRequest>,
) -> Result<Json<CreateJobResponse>, ApiError> {
    requires_world_scope_at_level_two(&req.admin_level, req.parent_relation_id)?;
    if req.selected_relation_ids.len() > MAX_JOB_IDS {
        return Err(ApiError::BadRequest(format!(
            "selected_relation_ids exceeds the maximum of {MAX_JOB_IDS}"
        )));
    }
    if req.selected_relation_ids.is_empty() {
        return Err(ApiError::BadRequest("selected_relation_ids must not be empty".to_string()));
    }

    let adm_name = req
        .parent_relation_id
        .filter(|id| *id > 0)
        .map(|r| format!("scope_r{r}"))
        .unwrap_or_else(|| "world_GLOBAL_r0".to_string());

    let params = JobParams {
        adm_name: adm_name.clone(),
        admin_level: req.admin_level.clone(),
        relation_ids: req.selected_relation_ids,
        relation_names: req.relation_names,
        clip_land: req.clip_land,
        force_refresh_osm_source: req.force_refresh_osm_source,
        fix_antimeridian: req.fix_antimeridian,
        overpass_url: req.overpass_url,
    };
    let job = state.jobs.create_job(params);

    Ok(Json(CreateJobResponse {
        job_id: job.job_id.clone(),
        adm_name,
        admin_level: req.admin_level,
    }))
}

async fn get_job(
    State(state): State<Arc<AppState>>,
    AxPath(id): AxPath<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let job = state.jobs.get(&id).ok_or(ApiError::NotFound)?;
    Ok(Json(job.snapshot()))
}

async fn cancel_job(
    State(state): State<Arc<AppState>>,
    AxPath(id): AxPath<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if state.jobs.cancel(&id) {
        Ok(Json(json!({ "ok": true })))
    } else {
        Err(ApiError::NotFound)
    }
}

async fn job_events(
    State(state): State<Arc<AppState>>,
    AxPath(id): AxPath<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let job = state.jobs.get(&id).ok_or(ApiError::NotFound)?;
    let stream = async_stream::stream! {
        yield Ok(Event::default().event("hello").data("{}"));
        loop {
            match job.next_event().await {
                Some(event) => {
                    let data = serde_json::to_string(&event.data).unwrap_or_else(|_| "{}".to_string());
                    let is_final = event.event_type == "job_finished";
                    yield Ok(Event::default().event(event.event_type.clone()).data(data));
                    if is_final {
                        break;
                    }
                }
                None => break,
            }
        }
    };
    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new().interval(Duration::from_secs(15)).text("ping"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worldwide_scope_requires_admin_level_two() {
        assert!(requires_world_scope_at_level_two("2", None).is_ok());
        assert!(requires_world_scope_at_level_two("4", None).is_err());
        assert!(requires_world_scope_at_level_two("4", Some(0)).is_err());
        assert!(requires_world_scope_at_level_two("4", Some(51477)).is_ok());
    }

    #[test]
    fn default_search_limit_is_fifty() {
        assert_eq!(default_search_limit(), 50);
    }

    #[test]
    fn default_fix_antimeridian_is_true() {
        assert!(default_fix_antimeridian());
    }
}
