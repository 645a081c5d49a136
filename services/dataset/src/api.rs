use crate::config::ApiConfig;
use crate::error::{DatasetError, DatasetResult};
use crate::join::JoinType;
use crate::metadata_store::FileRecord;
use crate::service::{DatasetService, MergeRequest, MergeSummary, PreviewPage, UploadRequest};
use anyhow::{Context, Result};
use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        DefaultBodyLimit, Multipart, Path, Query, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Room for multipart boundaries and the text fields around the file
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<DatasetService>,
    pub default_page_size: usize,
}

/// File list response
#[derive(Debug, Serialize)]
pub struct FileListResponse {
    pub files: Vec<FileRecord>,
}

/// Delete response
#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub deleted: bool,
    pub file_id: Uuid,
}

/// Merge request body
#[derive(Debug, Deserialize)]
pub struct MergeBody {
    pub left_id: Uuid,
    pub right_id: Uuid,
    pub join_column: String,
    #[serde(default = "default_join_type")]
    pub join_type: String,
}

fn default_join_type() -> String {
    JoinType::Inner.as_str().to_string()
}

/// Query parameters for a merge preview
#[derive(Debug, Deserialize)]
pub struct PreviewQuery {
    pub page: Option<usize>,
    pub page_size: Option<usize>,
}

/// Commit request body
#[derive(Debug, Deserialize)]
pub struct CommitBody {
    pub name: String,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    let body_limit = state
        .service
        .limits()
        .max_file_bytes
        .saturating_add(MULTIPART_OVERHEAD_BYTES);

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/files", post(upload_file).get(list_files))
        .route("/api/v1/files/:file_id", get(get_file).delete(delete_file))
        .route("/api/v1/files/:file_id/content", get(download_file))
        .route("/api/v1/merges", post(merge_files))
        .route("/api/v1/merges/:cache_key", get(preview_merge))
        .route("/api/v1/merges/:cache_key/commit", post(commit_merge))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "dataset-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.service.ready().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Upload a CSV or XLSX file from a multipart form
#[instrument(skip(state, multipart))]
async fn upload_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> DatasetResult<(StatusCode, Json<FileRecord>)> {
    let mut file: Option<(String, Vec<u8>)> = None;
    let mut uploaded_by = None;
    let mut description = None;

    while let Some(field) = multipart.next_field().await.map_err(invalid_multipart)? {
        let field_name = field.name().map(str::to_string);
        match field_name.as_deref() {
            Some("file") => {
                let name = field
                    .file_name()
                    .map(str::to_string)
                    .ok_or_else(|| {
                        DatasetError::InvalidRequest("file field has no file name".to_string())
                    })?;
                let bytes = field.bytes().await.map_err(invalid_multipart)?;
                file = Some((name, bytes.to_vec()));
            }
            Some("uploaded_by") => uploaded_by = Some(field.text().await.map_err(invalid_multipart)?),
            Some("description") => description = Some(field.text().await.map_err(invalid_multipart)?),
            other => warn!(field = ?other, "Ignoring unknown multipart field"),
        }
    }

    let (name, bytes) =
        file.ok_or_else(|| DatasetError::InvalidRequest("missing 'file' field".to_string()))?;

    let record = state
        .service
        .upload(UploadRequest {
            name,
            bytes,
            uploaded_by,
            description,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(record)))
}

async fn list_files(State(state): State<AppState>) -> DatasetResult<Json<FileListResponse>> {
    let files = state.service.list_files().await?;
    Ok(Json(FileListResponse { files }))
}

async fn get_file(
    State(state): State<AppState>,
    path: Result<Path<Uuid>, PathRejection>,
) -> DatasetResult<Json<FileRecord>> {
    let file_id = file_id_from(path)?;
    Ok(Json(state.service.get_file(file_id).await?))
}

/// Stream a stored file back with its content type
#[instrument(skip(state))]
async fn download_file(
    State(state): State<AppState>,
    path: Result<Path<Uuid>, PathRejection>,
) -> DatasetResult<Response> {
    let download = state.service.download(file_id_from(path)?).await?;

    let disposition = format!(
        "attachment; filename=\"{}\"",
        download.record.name.replace(['"', '\\', '\r', '\n'], "_")
    );

    Ok((
        [
            (header::CONTENT_TYPE, download.record.format.content_type().to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        download.bytes,
    )
        .into_response())
}

#[instrument(skip(state))]
async fn delete_file(
    State(state): State<AppState>,
    path: Result<Path<Uuid>, PathRejection>,
) -> DatasetResult<Json<DeleteResponse>> {
    let file_id = file_id_from(path)?;
    state.service.delete(file_id).await?;
    Ok(Json(DeleteResponse {
        deleted: true,
        file_id,
    }))
}

#[instrument(skip(state))]
async fn merge_files(
    State(state): State<AppState>,
    json: Result<Json<MergeBody>, JsonRejection>,
) -> DatasetResult<Json<MergeSummary>> {
    let body = body_from(json)?;
    let summary = state
        .service
        .merge(MergeRequest {
            left_id: body.left_id,
            right_id: body.right_id,
            join_column: body.join_column,
            join_type: body.join_type.parse()?,
        })
        .await?;

    Ok(Json(summary))
}

async fn preview_merge(
    State(state): State<AppState>,
    Path(cache_key): Path<String>,
    query: Result<Query<PreviewQuery>, QueryRejection>,
) -> DatasetResult<Json<PreviewPage>> {
    let Query(params) = query.map_err(|err| {
        debug!(error = ?err, "Invalid preview query");
        DatasetError::InvalidRequest(err.body_text())
    })?;

    let page = state
        .service
        .preview(
            &cache_key,
            params.page.unwrap_or(1),
            params.page_size.unwrap_or(state.default_page_size),
        )
        .await?;

    Ok(Json(page))
}

#[instrument(skip(state))]
async fn commit_merge(
    State(state): State<AppState>,
    Path(cache_key): Path<String>,
    json: Result<Json<CommitBody>, JsonRejection>,
) -> DatasetResult<(StatusCode, Json<FileRecord>)> {
    let body = body_from(json)?;
    let record = state.service.commit(&cache_key, &body.name).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// File ID from the URL path; malformed IDs are `InvalidRequest`
fn file_id_from(path: Result<Path<Uuid>, PathRejection>) -> DatasetResult<Uuid> {
    match path {
        Ok(Path(file_id)) => Ok(file_id),
        Err(err) => {
            debug!(error = ?err, "Invalid file ID in path");
            Err(DatasetError::InvalidRequest(err.body_text()))
        }
    }
}

fn body_from<T>(json: Result<Json<T>, JsonRejection>) -> DatasetResult<T> {
    match json {
        Ok(Json(body)) => Ok(body),
        Err(err) => {
            debug!(error = ?err, "Invalid JSON body");
            Err(DatasetError::InvalidRequest(err.body_text()))
        }
    }
}

fn invalid_multipart(err: axum::extract::multipart::MultipartError) -> DatasetError {
    DatasetError::InvalidRequest(format!("invalid multipart body: {}", err.body_text()))
}

/// Start the dataset API server; returns once `shutdown` is cancelled and
/// in-flight requests have finished
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting dataset API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}
