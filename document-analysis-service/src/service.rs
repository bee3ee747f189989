use analysis_bridge::{AnalysisOrchestrator, AnalysisRecord, DocumentUpload, ScopedDocument};
use axum::{
    Router,
    extract::{DefaultBodyLimit, Multipart, Path, State, multipart::MultipartError},
    http::{HeaderValue, Request, StatusCode},
    middleware::{Next, from_fn},
    response::Json,
    routing::{get, post},
};
use serde_json::{Value, json};
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{Instrument, error, info, warn};
use uuid::Uuid;

use crate::{
    config::ServiceConfig,
    history::{HistoryStore, InMemoryHistoryStore},
    models::{AnalyzeResponse, DeleteResponse, HealthResponse, MAX_UPLOAD_BYTES},
};

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<Value>)>;
type ApiError = (StatusCode, Json<Value>);

fn bad_request_error(message: &str, details: &str) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "success": false,
            "error": message,
            "details": details
        })),
    )
}

fn not_found_error(message: &str, id: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "success": false,
            "error": message,
            "id": id
        })),
    )
}

fn internal_error(message: &str, details: &str) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "success": false,
            "error": message,
            "details": details
        })),
    )
}

fn upload_error(e: MultipartError) -> ApiError {
    warn!("Multipart upload rejected: {}", e);
    bad_request_error("File upload error", &e.body_text())
}

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<AnalysisOrchestrator>,
    pub history: Arc<dyn HistoryStore>,
    pub upload_dir: Arc<PathBuf>,
}

impl AppState {
    pub fn new(
        orchestrator: Arc<AnalysisOrchestrator>,
        history: Arc<dyn HistoryStore>,
        upload_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            orchestrator,
            history,
            upload_dir: Arc::new(upload_dir.into()),
        }
    }
}

pub async fn create_app(config: ServiceConfig) -> Router {
    let app_state = AppState::new(
        Arc::new(AnalysisOrchestrator::new(config.bridge)),
        Arc::new(InMemoryHistoryStore::new()),
        config.upload_dir,
    );

    warm_up(&app_state);
    build_router(app_state)
}

/// Start provisioning in the background so the first upload does not pay for it.
fn warm_up(state: &AppState) {
    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move {
        info!("Initializing analysis environment");
        if let Err(e) = orchestrator.ensure_ready().await {
            warn!("Failed to initialize analysis environment: {}", e);
        }
    });
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/api/health", get(health_check))
        .route("/api/analyze-pdf", post(analyze_pdf))
        .route("/api/history", get(list_history))
        .route(
            "/api/history/{id}",
            get(get_history_item).delete(delete_history_item),
        )
        .fallback(endpoint_not_found)
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES + 64 * 1024))
        .layer(from_fn(correlation_id_middleware))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

/// Tag every request with a correlation ID and run it inside a span carrying it
async fn correlation_id_middleware(
    mut request: Request<axum::body::Body>,
    next: Next,
) -> axum::response::Response {
    let correlation_id = Uuid::new_v4().to_string();

    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        request.headers_mut().insert("x-correlation-id", value);
    }

    let span = tracing::info_span!(
        "http_request",
        correlation_id = %correlation_id,
        method = %request.method(),
        path = %request.uri().path()
    );

    next.run(request).instrument(span).await
}

async fn root() -> Json<Value> {
    Json(json!({
        "service": "PDF RAG Summarizer API",
        "version": "1.0.0",
        "description": "Upload a PDF and receive a summary produced by an out-of-process analysis worker",
        "endpoints": {
            "POST /api/analyze-pdf": "Upload a PDF (multipart field `pdf`) and analyze it",
            "GET /api/history": "List past analyses, newest first",
            "GET /api/history/{id}": "Get one past analysis",
            "DELETE /api/history/{id}": "Delete a past analysis",
            "GET /api/health": "Health check"
        }
    }))
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "OK".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        service: "PDF RAG Summarizer API".to_string(),
        message: "Backend is running correctly".to_string(),
    })
}

async fn analyze_pdf(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<AnalyzeResponse> {
    let upload = receive_upload(&state.upload_dir, &mut multipart)
        .await?
        .ok_or_else(|| bad_request_error("No PDF file uploaded", "Expected a file in field `pdf`"))?;

    info!(
        "Processing PDF: {} ({})",
        upload.original_file_name,
        upload.path.display()
    );

    match state.orchestrator.process_upload(upload).await {
        Ok(record) => {
            info!(
                id = %record.id,
                summary_length = record.summary.len(),
                original_text_length = record.original_text.len(),
                "PDF analysis finished"
            );
            state.history.append(record.clone()).await;

            Ok(Json(AnalyzeResponse {
                success: true,
                message: "PDF analyzed successfully".to_string(),
                data: record,
            }))
        }
        Err(e) => {
            error!("Error processing PDF: {}", e);
            Err(internal_error("Failed to process PDF", &e.to_string()))
        }
    }
}

/// Stream the `pdf` field to a uniquely named file in `upload_dir`.
///
/// A partially written file is removed if the upload fails.
async fn receive_upload(
    upload_dir: &FsPath,
    multipart: &mut Multipart,
) -> Result<Option<DocumentUpload>, ApiError> {
    while let Some(mut field) = multipart.next_field().await.map_err(upload_error)? {
        if field.name() != Some("pdf") {
            continue;
        }

        let original_file_name = field.file_name().unwrap_or("document.pdf").to_string();
        if !is_pdf(field.content_type(), &original_file_name) {
            return Err(bad_request_error(
                "Invalid file type",
                "Please upload a PDF file",
            ));
        }

        tokio::fs::create_dir_all(upload_dir)
            .await
            .map_err(|e| internal_error("Failed to store upload", &e.to_string()))?;

        let guard = ScopedDocument::new(upload_dir.join(stored_file_name()));
        let mut file = tokio::fs::File::create(guard.path())
            .await
            .map_err(|e| internal_error("Failed to store upload", &e.to_string()))?;

        let mut size: u64 = 0;
        while let Some(chunk) = field.chunk().await.map_err(upload_error)? {
            size += chunk.len() as u64;
            if size > MAX_UPLOAD_BYTES as u64 {
                return Err(bad_request_error(
                    "File upload error",
                    "File too large (limit is 10 MB)",
                ));
            }
            file.write_all(&chunk)
                .await
                .map_err(|e| internal_error("Failed to store upload", &e.to_string()))?;
        }
        file.flush()
            .await
            .map_err(|e| internal_error("Failed to store upload", &e.to_string()))?;

        return Ok(Some(DocumentUpload::new(
            guard.into_path(),
            original_file_name,
            size,
        )));
    }

    Ok(None)
}

fn is_pdf(content_type: Option<&str>, file_name: &str) -> bool {
    content_type == Some("application/pdf") || file_name.to_ascii_lowercase().ends_with(".pdf")
}

/// `<millis>-<random>.pdf`; the client's file name never reaches the filesystem.
fn stored_file_name() -> String {
    format!(
        "{}-{}.pdf",
        chrono::Utc::now().timestamp_millis(),
        Uuid::new_v4().simple()
    )
}

async fn list_history(State(state): State<AppState>) -> Json<Vec<AnalysisRecord>> {
    Json(state.history.list().await)
}

async fn get_history_item(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<AnalysisRecord> {
    match state.history.get(&id).await {
        Some(record) => Ok(Json(record)),
        None => Err(not_found_error("History item not found", &id)),
    }
}

async fn delete_history_item(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<DeleteResponse> {
    if state.history.delete(&id).await {
        info!("Deleted history item {}", id);
        Ok(Json(DeleteResponse {
            success: true,
            message: format!("Item {} deleted", id),
        }))
    } else {
        Err(not_found_error("History item not found", &id))
    }
}

async fn endpoint_not_found() -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "success": false,
            "error": "Endpoint not found"
        })),
    )
}
