//! HTTP boundary: thin axum handlers over the producer and the read path.
//!
//! Writes answer `202 Accepted` with the request id as soon as the command
//! is on the broker. The caller identifies itself with an `X-User-Id`
//! header.

use std::sync::Arc;

use axum::async_trait;
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{
    MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer,
};
use tower_http::trace::TraceLayer;
use tracing::error;
use uuid::Uuid;

use notely_core::defaults::SEARCH_LIMIT;
use notely_core::{
    DomainError, Error, Note, NoteReader, NoteType, SearchIndex, Space, SpaceReader,
};

use crate::config::BuildInfo;
use crate::producer::{
    AddParticipantInput, CreateNoteInput, CreateSpaceInput, DeleteAllNotesInput,
    DeleteNoteInput, Producer, UpdateNoteInput,
};
use crate::services::CachedSpaceReader;

/// Header carrying the caller's internal user id.
pub const USER_ID_HEADER: &str = "x-user-id";

const MAX_SEARCH_LIMIT: usize = 100;
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub producer: Producer,
    pub notes: Arc<dyn NoteReader>,
    pub spaces: CachedSpaceReader,
    pub search: Arc<dyn SearchIndex>,
    pub build: BuildInfo,
}

/// Request ids for the `x-request-id` header, time-ordered like command ids.
#[derive(Clone, Default)]
struct MakeRequestUuidV7;

impl MakeRequestId for MakeRequestUuidV7 {
    fn make_request_id<B>(&mut self, _request: &axum::http::Request<B>) -> Option<RequestId> {
        let id = Uuid::now_v7().to_string().parse().ok()?;
        Some(RequestId::new(id))
    }
}

/// Build the application router with its middleware stack.
pub fn router(state: AppState, allowed_origins: &[String]) -> Router {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();

    Router::new()
        .route("/health", get(health))
        .route("/api/v1/notes", post(create_note))
        .route("/api/v1/notes/:note_id", get(get_note).patch(update_note))
        .route("/api/v1/spaces", post(create_space))
        .route("/api/v1/spaces/:space_id", get(get_space))
        .route(
            "/api/v1/spaces/:space_id/notes",
            get(list_notes).delete(delete_all_notes),
        )
        .route("/api/v1/spaces/:space_id/notes/search", get(search_notes))
        .route(
            "/api/v1/spaces/:space_id/notes/:note_id",
            delete(delete_note),
        )
        .route(
            "/api/v1/spaces/:space_id/participants",
            post(add_participant),
        )
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuidV7))
        .layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(origins))
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PATCH,
                    Method::DELETE,
                    Method::OPTIONS,
                ])
                .allow_headers([
                    header::CONTENT_TYPE,
                    header::ACCEPT,
                    HeaderName::from_static(USER_ID_HEADER),
                ])
                .max_age(std::time::Duration::from_secs(3600)),
        )
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

// =============================================================================
// EXTRACTORS & BODIES
// =============================================================================

/// The authenticated caller, taken from the `X-User-Id` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestUser(pub i64);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for RequestUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(USER_ID_HEADER)
            .ok_or_else(|| ApiError::Unauthorized("missing X-User-Id header".to_string()))?;
        raw.to_str()
            .ok()
            .and_then(|v| v.trim().parse::<i64>().ok())
            .filter(|id| *id > 0)
            .map(RequestUser)
            .ok_or_else(|| ApiError::Unauthorized("invalid X-User-Id header".to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct CreateNoteBody {
    space_id: Uuid,
    text: String,
    #[serde(rename = "type")]
    note_type: Option<NoteType>,
    #[serde(default)]
    file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpdateNoteBody {
    space_id: Uuid,
    text: String,
}

#[derive(Debug, Deserialize)]
struct CreateSpaceBody {
    name: String,
}

#[derive(Debug, Deserialize)]
struct AddParticipantBody {
    participant_id: i64,
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    #[serde(default)]
    q: String,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct Accepted {
    request_id: Uuid,
}

#[derive(Debug, Serialize)]
struct SearchResult {
    note: Note,
    score: f32,
}

fn accepted(request_id: Uuid) -> (StatusCode, Json<Accepted>) {
    (StatusCode::ACCEPTED, Json(Accepted { request_id }))
}

// =============================================================================
// HANDLERS
// =============================================================================

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": state.build.version,
        "git_sha": state.build.git_sha,
        "cache": state.spaces.stats(),
    }))
}

async fn create_note(
    State(state): State<AppState>,
    RequestUser(user_id): RequestUser,
    Json(body): Json<CreateNoteBody>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = state
        .producer
        .create_note(CreateNoteInput {
            user_id,
            space_id: body.space_id,
            text: body.text,
            note_type: body.note_type,
            file: body.file,
        })
        .await?;
    Ok(accepted(request_id))
}

async fn update_note(
    State(state): State<AppState>,
    RequestUser(user_id): RequestUser,
    Path(note_id): Path<Uuid>,
    Json(body): Json<UpdateNoteBody>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = state
        .producer
        .update_note(UpdateNoteInput {
            user_id,
            space_id: body.space_id,
            note_id,
            text: body.text,
        })
        .await?;
    Ok(accepted(request_id))
}

async fn delete_note(
    State(state): State<AppState>,
    RequestUser(user_id): RequestUser,
    Path((space_id, note_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = state
        .producer
        .delete_note(DeleteNoteInput {
            user_id,
            space_id,
            note_id,
        })
        .await?;
    Ok(accepted(request_id))
}

async fn delete_all_notes(
    State(state): State<AppState>,
    RequestUser(user_id): RequestUser,
    Path(space_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = state
        .producer
        .delete_all_notes(DeleteAllNotesInput { user_id, space_id })
        .await?;
    Ok(accepted(request_id))
}

async fn create_space(
    State(state): State<AppState>,
    RequestUser(user_id): RequestUser,
    Json(body): Json<CreateSpaceBody>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = state
        .producer
        .create_space(CreateSpaceInput {
            user_id,
            name: body.name,
        })
        .await?;
    Ok(accepted(request_id))
}

async fn add_participant(
    State(state): State<AppState>,
    RequestUser(user_id): RequestUser,
    Path(space_id): Path<Uuid>,
    Json(body): Json<AddParticipantBody>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = state
        .producer
        .add_participant(AddParticipantInput {
            user_id,
            space_id,
            participant_id: body.participant_id,
        })
        .await?;
    Ok(accepted(request_id))
}

/// Load a space the caller may read.
async fn readable_space(state: &AppState, space_id: Uuid, user_id: i64) -> Result<Space, ApiError> {
    let space = state
        .spaces
        .get_space(space_id)
        .await?
        .ok_or(DomainError::SpaceNotFound(space_id))?;
    if !state.spaces.is_participant(space_id, user_id).await? {
        return Err(DomainError::SpaceNotOwned { space_id, user_id }.into());
    }
    Ok(space)
}

async fn get_space(
    State(state): State<AppState>,
    RequestUser(user_id): RequestUser,
    Path(space_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let space = readable_space(&state, space_id, user_id).await?;
    Ok(Json(space))
}

async fn list_notes(
    State(state): State<AppState>,
    RequestUser(user_id): RequestUser,
    Path(space_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    readable_space(&state, space_id, user_id).await?;
    let notes = state.notes.get_all_notes_by_space_id(space_id).await?;
    Ok(Json(notes))
}

async fn get_note(
    State(state): State<AppState>,
    RequestUser(user_id): RequestUser,
    Path(note_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let note = state
        .notes
        .get_note_by_id(note_id)
        .await?
        .ok_or(DomainError::NoteNotFound(note_id))?;
    readable_space(&state, note.space_id, user_id).await?;
    Ok(Json(note))
}

async fn search_notes(
    State(state): State<AppState>,
    RequestUser(user_id): RequestUser,
    Path(space_id): Path<Uuid>,
    Query(params): Query<SearchParams>,
) -> Result<impl IntoResponse, ApiError> {
    let query = params.q.trim();
    if query.is_empty() {
        return Err(ApiError::BadRequest("query not filled".to_string()));
    }
    readable_space(&state, space_id, user_id).await?;

    let limit = params.limit.unwrap_or(SEARCH_LIMIT).clamp(1, MAX_SEARCH_LIMIT);
    let hits = state.search.search(space_id, query, limit).await?;

    // The index may briefly list notes the store no longer has.
    let mut results = Vec::with_capacity(hits.len());
    for hit in hits {
        if let Some(note) = state.notes.get_note_by_id(hit.note_id).await? {
            if note.space_id == space_id {
                results.push(SearchResult {
                    note,
                    score: hit.score,
                });
            }
        }
    }
    Ok(Json(results))
}

// =============================================================================
// ERROR HANDLING
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Internal(String),
}

impl From<DomainError> for ApiError {
    fn from(err: DomainError) -> Self {
        let msg = err.to_string();
        match err {
            DomainError::UnknownUser(_)
            | DomainError::SpaceNotFound(_)
            | DomainError::NoteNotFound(_) => ApiError::NotFound(msg),
            DomainError::SpaceNotOwned { .. } => ApiError::Forbidden(msg),
            DomainError::NoteNotInSpace { .. }
            | DomainError::NoteNotUpdatable(_)
            | DomainError::PersonalSpace(_)
            | DomainError::SelfParticipant => ApiError::BadRequest(msg),
            DomainError::AlreadyParticipant { .. }
            | DomainError::InvitationPending { .. }
            | DomainError::UserAlreadyExists(_) => ApiError::Conflict(msg),
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::Validation(e) => ApiError::BadRequest(e.to_string()),
            Error::Domain(e) => e.into(),
            e if e.is_transient() => ApiError::Unavailable(e.to_string()),
            e => ApiError::Internal(e.to_string()),
        }
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        if status.is_server_error() {
            error!(subsystem = "api", status = status.as_u16(), error = %self, "Request failed");
        }

        let body = Json(serde_json::json!({
            "error": self.to_string(),
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notely_core::ValidationError;

    #[test]
    fn test_validation_maps_to_bad_request() {
        let err = ApiError::from(Error::from(ValidationError::TextNotFilled));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.to_string(), "text not filled");
    }

    #[test]
    fn test_domain_status_codes() {
        let cases = [
            (DomainError::SpaceNotFound(Uuid::nil()), StatusCode::NOT_FOUND),
            (
                DomainError::SpaceNotOwned {
                    space_id: Uuid::nil(),
                    user_id: 1,
                },
                StatusCode::FORBIDDEN,
            ),
            (DomainError::SelfParticipant, StatusCode::BAD_REQUEST),
            (
                DomainError::NoteNotUpdatable(NoteType::Voice),
                StatusCode::BAD_REQUEST,
            ),
            (
                DomainError::InvitationPending {
                    space_id: Uuid::nil(),
                    user_id: 2,
                },
                StatusCode::CONFLICT,
            ),
        ];
        for (domain, status) in cases {
            assert_eq!(ApiError::from(Error::from(domain)).status(), status);
        }
    }

    #[test]
    fn test_infrastructure_maps_to_server_errors() {
        assert_eq!(
            ApiError::from(Error::Timeout("publish".to_string())).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::from(Error::Broker("down".to_string())).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::from(Error::Internal("bug".to_string())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
