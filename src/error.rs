//! Per-subsystem error types and the HTTP-boundary error mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Failures talking to an Overpass endpoint.
#[derive(Debug, Error)]
pub enum OverpassError {
    #[error("Overpass request failed: {0}")]
    Transport(String),
    #[error("Overpass returned non-JSON body")]
    InvalidJson,
    #[error("Overpass error: {0}")]
    Remote(String),
    #[error("no Overpass endpoints configured")]
    NoEndpoints,
}

/// Failures assembling a relation's polygonal geometry.
#[derive(Debug, Error)]
pub enum GeometryError {
    #[error("Relation element not found")]
    RelationNotFound,
    #[error("Relation has no way geometry")]
    NoWayGeometry,
    #[error("Relation geometry merge failed")]
    MergeFailed,
}

/// Failures reading or writing the on-disk scope layout.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("json error at {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Failures obtaining or using the land-polygon dataset.
#[derive(Debug, Error)]
pub enum LandPolygonsError {
    #[error("no land-polygon URLs configured")]
    NoUrls,
    #[error("all land-polygon download URLs failed, last error: {0}")]
    DownloadFailed(String),
    #[error("land-polygon archive has no .shp member")]
    NoShapefile,
    #[error("shapefile read error: {0}")]
    ShapefileRead(String),
    #[error("land-polygons download cancelled")]
    Cancelled,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures that abort an entire job.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    LandPolygons(#[from] LandPolygonsError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("job was cancelled")]
    Cancelled,
}

/// Top-level error mapped to an HTTP response at the API boundary.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("not found")]
    NotFound,
    #[error(transparent)]
    Overpass(#[from] OverpassError),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not found".to_string()),
            ApiError::Overpass(e) => (StatusCode::BAD_GATEWAY, e.to_string()),
            ApiError::Internal(e) => {
                tracing::error!("internal error: {e:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
