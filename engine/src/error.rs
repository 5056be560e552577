use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::coordinator::CoordinatorError;
use crate::playlist::PlaylistError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    /// The external content source failed; the catalog was left untouched.
    #[error("{0}")]
    Upstream(String),
}

impl From<CoordinatorError> for ApiError {
    fn from(err: CoordinatorError) -> Self {
        match err {
            CoordinatorError::Playlist(PlaylistError::UnknownItem(id)) => {
                ApiError::NotFound(format!("item not found in playlist: {id}"))
            }
            e @ CoordinatorError::Playlist(PlaylistError::InvalidDuration)
            | e @ CoordinatorError::InvalidItem
            | e @ CoordinatorError::InvalidOffset => ApiError::BadRequest(e.to_string()),
            CoordinatorError::ContentSource(e) => ApiError::Upstream(format!("content source failed: {e}")),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Upstream(msg) => {
                tracing::warn!("upstream error: {msg}");
                StatusCode::BAD_GATEWAY
            }
        };
        let body = Json(json!({ "success": false, "error": self.to_string() }));
        (status, body).into_response()
    }
}
