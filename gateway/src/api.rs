use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;
use upstream::prefetch::ChapterPrefetcher;
use upstream::search::{SearchCoordinator, SearchRequest};
use upstream::types::{ApiEnvelope, ChapterContent, DirectoryResult, SearchResult};

#[derive(Clone)]
pub struct AppState {
    pub search: Arc<SearchCoordinator>,
    pub prefetcher: Arc<ChapterPrefetcher>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/search", get(search))
        .route("/api/book/{book_id}/directory", get(directory))
        .route("/api/book/{book_id}/chapter/{chapter_id}", get(chapter))
        .route("/healthz", get(healthz))
        .with_state(state)
}

// Errors travel in the envelope with HTTP 200, matching the upstream's own
// convention, so clients only ever inspect `code`.

async fn search(
    State(state): State<AppState>,
    Query(request): Query<SearchRequest>,
) -> Json<ApiEnvelope<SearchResult>> {
    match state.search.search(request).await {
        Ok(result) => Json(ApiEnvelope::success(result)),
        Err(err) => Json(ApiEnvelope::failure(&err)),
    }
}

async fn directory(
    State(state): State<AppState>,
    Path(book_id): Path<String>,
) -> Json<ApiEnvelope<DirectoryResult>> {
    match state.search.directory(&book_id).await {
        Ok(result) => Json(ApiEnvelope::success(result)),
        Err(err) => Json(ApiEnvelope::failure(&err)),
    }
}

async fn chapter(
    State(state): State<AppState>,
    Path((book_id, chapter_id)): Path<(String, String)>,
) -> Json<ApiEnvelope<ChapterContent>> {
    match state.prefetcher.get_chapter(&book_id, &chapter_id).await {
        Ok(content) => Json(ApiEnvelope::success((*content).clone())),
        Err(err) => Json(ApiEnvelope::failure(&err)),
    }
}

async fn healthz() -> &'static str {
    "ok"
}
