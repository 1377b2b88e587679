//! HTTP API server.
//!
//! Endpoints cover project management, scrape control, search, and document
//! retrieval. Errors follow one JSON shape everywhere:
//! `{"error": {"code": "...", "message": "..."}}`.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::error::{HarnessError, LifecycleError};
use crate::lifecycle::LifecycleManager;
use crate::models::ProjectConfigPatch;

type AppState = Arc<LifecycleManager>;

pub async fn serve(manager: Arc<LifecycleManager>) -> Result<()> {
    let bind_addr = manager.config().server.bind.clone();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(handle_health))
        .route("/api/projects", get(handle_list_projects).post(handle_create_project))
        .route(
            "/api/projects/{id}",
            get(handle_get_project)
                .patch(handle_update_project)
                .delete(handle_delete_project),
        )
        .route("/api/projects/{id}/scrape", post(handle_start_scrape))
        .route("/api/projects/{id}/status", get(handle_status))
        .route("/api/projects/{id}/cancel", post(handle_cancel))
        .route("/api/projects/{id}/search", post(handle_project_search))
        .route("/api/projects/{id}/documents", get(handle_list_documents))
        .route("/api/projects/{id}/documents/{path}", get(handle_get_document))
        .route("/api/search", post(handle_search))
        .layer(cors)
        .with_state(manager);

    info!(bind = %bind_addr, "HTTP server listening");
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {}", bind_addr))?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn handle_list_projects(
    State(manager): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let projects = manager.list_projects().await?;
    Ok(Json(serde_json::json!({ "projects": projects })))
}

#[derive(Deserialize)]
struct CreateProjectRequest {
    id: String,
    base_url: String,
    #[serde(default)]
    config: ProjectConfigPatch,
}

async fn handle_create_project(
    State(manager): State<AppState>,
    Json(req): Json<CreateProjectRequest>,
) -> Result<Response, AppError> {
    let project = manager
        .create_project(&req.id, &req.base_url, req.config)
        .await?;
    Ok((StatusCode::CREATED, Json(project)).into_response())
}

async fn handle_get_project(
    State(manager): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let status = manager.status(&id).await?;
    Ok(Json(status).into_response())
}

#[derive(Deserialize)]
struct UpdateProjectRequest {
    #[serde(default)]
    config: ProjectConfigPatch,
}

async fn handle_update_project(
    State(manager): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateProjectRequest>,
) -> Result<Response, AppError> {
    let project = manager.update_project(&id, req.config).await?;
    Ok(Json(project).into_response())
}

async fn handle_delete_project(
    State(manager): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    manager.delete_project(&id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn handle_start_scrape(
    State(manager): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, AppError> {
    let full = params
        .get("full")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);
    manager.start_scrape(&id, full).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "started", "project_id": id, "full": full })),
    )
        .into_response())
}

async fn handle_status(
    State(manager): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let status = manager.status(&id).await?;
    Ok(Json(status).into_response())
}

async fn handle_cancel(
    State(manager): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    manager.cancel_scrape(&id)?;
    Ok(Json(serde_json::json!({ "status": "cancelling", "project_id": id })).into_response())
}

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(default)]
    project: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
}

async fn handle_search(
    State(manager): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Response, AppError> {
    let response = crate::search::search(
        manager.pool(),
        manager.index(),
        &manager.config().search,
        &req.query,
        req.project.as_deref(),
        req.limit,
    )
    .await?;
    Ok(Json(response).into_response())
}

#[derive(Deserialize)]
struct ProjectSearchRequest {
    query: String,
    #[serde(default)]
    limit: Option<i64>,
}

async fn handle_project_search(
    State(manager): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ProjectSearchRequest>,
) -> Result<Response, AppError> {
    let response = crate::search::search(
        manager.pool(),
        manager.index(),
        &manager.config().search,
        &req.query,
        Some(&id),
        req.limit,
    )
    .await?;
    Ok(Json(response).into_response())
}

#[derive(Deserialize)]
struct ListDocumentsQuery {
    #[serde(default = "default_page")]
    page: i64,
    #[serde(default = "default_page_limit")]
    limit: i64,
}

fn default_page() -> i64 {
    1
}
fn default_page_limit() -> i64 {
    50
}

async fn handle_list_documents(
    State(manager): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<ListDocumentsQuery>,
) -> Result<Response, AppError> {
    let page = crate::store::list_documents(manager.pool(), &id, params.page, params.limit).await?;
    Ok(Json(page).into_response())
}

async fn handle_get_document(
    State(manager): State<AppState>,
    Path((id, path)): Path<(String, String)>,
) -> Result<Response, AppError> {
    match crate::store::get_document(manager.pool(), &id, &path).await? {
        Some(doc) => Ok(Json(doc).into_response()),
        None => Err(not_found(format!("document '{}' not found in '{}'", path, id))),
    }
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn conflict(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::CONFLICT,
        code: "conflict".to_string(),
        message: message.into(),
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn internal_error(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal_error".to_string(),
        message: message.into(),
    }
}

impl From<HarnessError> for AppError {
    fn from(err: HarnessError) -> Self {
        match &err {
            HarnessError::Lifecycle(LifecycleError::ProjectNotFound(_)) => {
                not_found(err.to_string())
            }
            HarnessError::Lifecycle(_) => conflict(err.to_string()),
            HarnessError::Config(_) => bad_request(err.to_string()),
            _ => internal_error(err.to_string()),
        }
    }
}

impl From<LifecycleError> for AppError {
    fn from(err: LifecycleError) -> Self {
        AppError::from(HarnessError::from(err))
    }
}
