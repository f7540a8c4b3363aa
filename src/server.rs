use std::sync::Arc;

use axum::extract::{Path, Query, State as AxumState};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use crate::assistant::{
    AssistantError, ChatMessage, ChatSession, Flashcard, Mindmap, NoteContext, NoteSummary,
    QuizQuestion,
};
use crate::notes::{Note, NoteError, NoteMetadata, NoteStore};
use crate::search::{fallback_search, SearchResult};
use crate::{save_settings, watcher, AppState, Settings};

pub type SharedState = Arc<AppState>;

const SERVER_NAME: &str = crate::APP_NAME;
const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

const DEFAULT_SEARCH_LIMIT: usize = 20;
const DEFAULT_FLASHCARD_COUNT: usize = 10;
const DEFAULT_QUIZ_COUNT: usize = 5;
const DEFAULT_CONTEXT_NOTES: usize = 4;
/// Chat sessions idle longer than this are swept on the next chat call.
const SESSION_IDLE_HOURS: i64 = 12;

// ── Error mapping ──────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<NoteError> for ApiError {
    fn from(err: NoteError) -> Self {
        let status = match err {
            NoteError::NotFound(_) => StatusCode::NOT_FOUND,
            NoteError::InvalidId(_) => StatusCode::BAD_REQUEST,
            NoteError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl From<AssistantError> for ApiError {
    fn from(err: AssistantError) -> Self {
        let status = match err {
            AssistantError::NotConfigured => StatusCode::SERVICE_UNAVAILABLE,
            AssistantError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            // Everything else is the upstream endpoint misbehaving.
            _ => StatusCode::BAD_GATEWAY,
        };
        Self::new(status, err.to_string())
    }
}

// ── Router and serve loop ──────────────────────────────────────────────────

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/api/settings", get(get_settings).put(update_settings))
        .route("/api/notes", get(list_notes).post(create_note))
        .route(
            "/api/notes/{id}",
            get(read_note).put(save_note).delete(delete_note),
        )
        .route("/api/notes/{id}/append", post(append_note))
        .route("/api/search", get(search_notes))
        .route("/api/assistant/summary", post(assistant_summary))
        .route("/api/assistant/flashcards", post(assistant_flashcards))
        .route("/api/assistant/quiz", post(assistant_quiz))
        .route("/api/assistant/mindmap", post(assistant_mindmap))
        .route("/api/assistant/sessions", post(create_session))
        .route("/api/assistant/sessions/{id}", delete(delete_session))
        .route("/api/assistant/chat", post(assistant_chat))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(state: SharedState, port: u16) -> anyhow::Result<()> {
    let app = router(state);
    let addr = format!("127.0.0.1:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

fn store(state: &AppState) -> Result<NoteStore, ApiError> {
    state
        .note_store()
        .ok_or_else(|| ApiError::bad_request("notes folder not set"))
}

/// Mirror a note write into the search index and metadata cache.
fn index_note(state: &AppState, note: &Note) {
    {
        let index = state.search.lock().expect("search index mutex");
        if let Some(ref index) = *index {
            if let Err(err) = index.upsert(&note.id, &note.title, &note.content, note.modified) {
                tracing::warn!(%err, id = note.id, "index update failed");
            }
        }
    }

    let mut cache = state.note_cache.write().expect("cache write lock");
    cache.insert(
        note.id.clone(),
        NoteMetadata {
            id: note.id.clone(),
            title: note.title.clone(),
            preview: crate::generate_preview(&note.content),
            modified: note.modified,
        },
    );
}

fn drop_note_from_index(state: &AppState, id: &str) {
    {
        let index = state.search.lock().expect("search index mutex");
        if let Some(ref index) = *index {
            if let Err(err) = index.remove(id) {
                tracing::warn!(%err, id, "index removal failed");
            }
        }
    }

    let mut cache = state.note_cache.write().expect("cache write lock");
    cache.remove(id);
}

// ── Health and settings ────────────────────────────────────────────────────

async fn handle_health(AxumState(state): AxumState<SharedState>) -> Json<Value> {
    let folder = {
        let settings = state.settings.read().expect("settings read lock");
        settings.notes_folder.clone()
    };
    let note_count = {
        let cache = state.note_cache.read().expect("cache read lock");
        cache.len()
    };

    Json(json!({
        "status": "ok",
        "server": SERVER_NAME,
        "version": SERVER_VERSION,
        "notesFolder": folder,
        "noteCount": note_count,
    }))
}

async fn get_settings(AxumState(state): AxumState<SharedState>) -> Json<Settings> {
    Json(state.settings.read().expect("settings read lock").clone())
}

async fn update_settings(
    AxumState(state): AxumState<SharedState>,
    Json(new_settings): Json<Settings>,
) -> Result<Json<Settings>, ApiError> {
    {
        let mut settings = state.settings.write().expect("settings write lock");
        *settings = new_settings;
    }

    let snapshot = state.settings.read().expect("settings read lock").clone();
    save_settings(&snapshot)
        .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;

    // The notes folder may have moved; rebuild the index and re-point the
    // watcher at the new location.
    state.init_search();
    if let Err(err) = watcher::restart(&state) {
        tracing::warn!(%err, "watcher restart failed");
    }

    Ok(Json(snapshot))
}

// ── Notes ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateNoteRequest {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WriteNoteRequest {
    content: String,
}

async fn list_notes(
    AxumState(state): AxumState<SharedState>,
) -> Result<Json<Vec<NoteMetadata>>, ApiError> {
    let notes = store(&state)?.list().await?;

    let mut cache = state.note_cache.write().expect("cache write lock");
    cache.clear();
    for note in &notes {
        cache.insert(note.id.clone(), note.clone());
    }

    Ok(Json(notes))
}

async fn create_note(
    AxumState(state): AxumState<SharedState>,
    body: Option<Json<CreateNoteRequest>>,
) -> Result<Json<Note>, ApiError> {
    let content = body.and_then(|Json(req)| req.content);
    let note = store(&state)?.create(content).await?;
    index_note(&state, &note);
    Ok(Json(note))
}

async fn read_note(
    AxumState(state): AxumState<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Note>, ApiError> {
    Ok(Json(store(&state)?.read(&id).await?))
}

async fn save_note(
    AxumState(state): AxumState<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<WriteNoteRequest>,
) -> Result<Json<Note>, ApiError> {
    let note = store(&state)?.save(&id, req.content).await?;
    index_note(&state, &note);
    Ok(Json(note))
}

async fn delete_note(
    AxumState(state): AxumState<SharedState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    store(&state)?.delete(&id).await?;
    drop_note_from_index(&state, &id);
    Ok(StatusCode::NO_CONTENT)
}

async fn append_note(
    AxumState(state): AxumState<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<WriteNoteRequest>,
) -> Result<Json<Note>, ApiError> {
    let note = store(&state)?.append(&id, &req.content).await?;
    index_note(&state, &note);
    Ok(Json(note))
}

// ── Search ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SearchParams {
    q: String,
    limit: Option<usize>,
}

async fn search_notes(
    AxumState(state): AxumState<SharedState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Vec<SearchResult>>, ApiError> {
    if params.q.trim().is_empty() {
        return Ok(Json(vec![]));
    }
    let limit = params.limit.unwrap_or(DEFAULT_SEARCH_LIMIT).clamp(1, 100);
    Ok(Json(run_search(&state, &params.q, limit)))
}

fn run_search(state: &AppState, query: &str, limit: usize) -> Vec<SearchResult> {
    if limit == 0 {
        return vec![];
    }
    let index = state.search.lock().expect("search index mutex");
    match *index {
        Some(ref index) => index.search(query, limit).unwrap_or_else(|err| {
            tracing::warn!(%err, "index search failed, using fallback");
            let cache = state.note_cache.read().expect("cache read lock");
            fallback_search(&cache, query, limit)
        }),
        None => {
            let cache = state.note_cache.read().expect("cache read lock");
            fallback_search(&cache, query, limit)
        }
    }
}

// ── Assistant features ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeatureRequest {
    note_id: Option<String>,
    content: Option<String>,
    count: Option<usize>,
}

/// Inline content wins over a note id; one of the two is required.
async fn resolve_content(state: &AppState, req: &FeatureRequest) -> Result<String, ApiError> {
    if let Some(content) = &req.content {
        return Ok(content.clone());
    }
    if let Some(id) = &req.note_id {
        return Ok(store(state)?.read(id).await?.content);
    }
    Err(ApiError::bad_request("noteId or content required"))
}

async fn assistant_summary(
    AxumState(state): AxumState<SharedState>,
    Json(req): Json<FeatureRequest>,
) -> Result<Json<NoteSummary>, ApiError> {
    let content = resolve_content(&state, &req).await?;
    let cfg = state.assistant_settings();
    Ok(Json(state.assistant.summarize(&cfg, &content).await?))
}

async fn assistant_flashcards(
    AxumState(state): AxumState<SharedState>,
    Json(req): Json<FeatureRequest>,
) -> Result<Json<Vec<Flashcard>>, ApiError> {
    let content = resolve_content(&state, &req).await?;
    let cfg = state.assistant_settings();
    let count = req.count.unwrap_or(DEFAULT_FLASHCARD_COUNT);
    Ok(Json(
        state.assistant.flashcards(&cfg, &content, count).await?,
    ))
}

async fn assistant_quiz(
    AxumState(state): AxumState<SharedState>,
    Json(req): Json<FeatureRequest>,
) -> Result<Json<Vec<QuizQuestion>>, ApiError> {
    let content = resolve_content(&state, &req).await?;
    let cfg = state.assistant_settings();
    let count = req.count.unwrap_or(DEFAULT_QUIZ_COUNT);
    Ok(Json(state.assistant.quiz(&cfg, &content, count).await?))
}

async fn assistant_mindmap(
    AxumState(state): AxumState<SharedState>,
    Json(req): Json<FeatureRequest>,
) -> Result<Json<Mindmap>, ApiError> {
    let content = resolve_content(&state, &req).await?;
    let cfg = state.assistant_settings();
    Ok(Json(state.assistant.mindmap(&cfg, &content).await?))
}

// ── Chat ───────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest {
    session_id: Option<String>,
    question: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatResponse {
    session_id: String,
    answer: String,
    /// Ids of the notes folded into context.
    sources: Vec<String>,
}

async fn create_session(AxumState(state): AxumState<SharedState>) -> Json<ChatSession> {
    Json(state.sessions.create())
}

async fn delete_session(
    AxumState(state): AxumState<SharedState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.sessions.evict(&id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AssistantError::SessionNotFound(id).into())
    }
}

async fn assistant_chat(
    AxumState(state): AxumState<SharedState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    if req.question.trim().is_empty() {
        return Err(ApiError::bad_request("question is empty"));
    }

    let swept = state
        .sessions
        .evict_idle(chrono::Duration::hours(SESSION_IDLE_HOURS));
    if swept > 0 {
        tracing::debug!(swept, "idle chat sessions evicted");
    }

    let session_id = match req.session_id {
        Some(id) => id,
        None => state.sessions.create().id,
    };
    let history = state.sessions.history(&session_id)?;

    let cfg = state.assistant_settings();
    let limit = cfg.max_context_notes.unwrap_or(DEFAULT_CONTEXT_NOTES);
    let hits = run_search(&state, &req.question, limit);

    let mut context = Vec::with_capacity(hits.len());
    let mut sources = Vec::with_capacity(hits.len());
    if let Ok(store) = store(&state) {
        for hit in &hits {
            if let Ok(note) = store.read(&hit.id).await {
                sources.push(note.id.clone());
                context.push(NoteContext {
                    title: note.title,
                    excerpt: note.content,
                });
            }
        }
    }

    let answer = state
        .assistant
        .chat(&cfg, &history, &req.question, &context)
        .await?;

    state
        .sessions
        .append(&session_id, ChatMessage::user(req.question))?;
    state
        .sessions
        .append(&session_id, ChatMessage::assistant(answer.clone()))?;

    Ok(Json(ChatResponse {
        session_id,
        answer,
        sources,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> SharedState {
        Arc::new(AppState::new(Settings::default()))
    }

    #[test]
    fn test_note_error_status_mapping() {
        assert_eq!(
            ApiError::from(NoteError::NotFound("x".to_string())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(NoteError::InvalidId("../x".to_string())).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_assistant_error_status_mapping() {
        assert_eq!(
            ApiError::from(AssistantError::NotConfigured).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::from(AssistantError::SessionNotFound("s".to_string())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(AssistantError::EmptyCompletion).status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[tokio::test]
    async fn test_health_reports_unset_folder() {
        let state = test_state();
        let Json(body) = handle_health(AxumState(state)).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["server"], "studypad");
        assert!(body["notesFolder"].is_null());
        assert_eq!(body["noteCount"], 0);
    }

    #[tokio::test]
    async fn test_notes_require_configured_folder() {
        let state = test_state();
        let err = list_notes(AxumState(state)).await.err().unwrap();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_note_crud_through_handlers() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state();
        {
            let mut settings = state.settings.write().unwrap();
            settings.notes_folder = Some(dir.path().to_string_lossy().into_owned());
        }

        let Json(created) = create_note(
            AxumState(state.clone()),
            Some(Json(CreateNoteRequest {
                content: Some("# Osmosis\n\nWater moves.".to_string()),
            })),
        )
        .await
        .unwrap();
        assert_eq!(created.title, "Osmosis");

        let Json(listed) = list_notes(AxumState(state.clone())).await.unwrap();
        assert_eq!(listed.len(), 1);

        // No tantivy index in this test; the fallback cache search serves.
        let Json(results) = search_notes(
            AxumState(state.clone()),
            Query(SearchParams {
                q: "osmosis".to_string(),
                limit: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, created.id);

        let status = delete_note(AxumState(state.clone()), Path(created.id.clone()))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);

        let err = read_note(AxumState(state), Path(created.id))
            .await
            .err()
            .unwrap();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_session_endpoints() {
        let state = test_state();
        let Json(session) = create_session(AxumState(state.clone())).await;

        let status = delete_session(AxumState(state.clone()), Path(session.id.clone()))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);

        let err = delete_session(AxumState(state), Path(session.id))
            .await
            .err()
            .unwrap();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_assistant_requires_note_or_content() {
        let state = test_state();
        let err = assistant_summary(
            AxumState(state),
            Json(FeatureRequest {
                note_id: None,
                content: None,
                count: None,
            }),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_router_builds() {
        let _ = router(test_state());
    }
}
