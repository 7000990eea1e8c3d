//! HTTP surface - REST routes plus the WebSocket upgrade
//!
//! Every route sits behind bearer-token auth; the WebSocket upgrade
//! additionally enforces the Origin allow-list.

mod sessions;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use crate::auth::{AuthError, TokenValidator};
use crate::clients::Collaborators;
use crate::config::Config;
use crate::session::{RegistryError, SessionRegistry};
use crate::ws::handler::session_connect;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<SessionRegistry>,
    pub collaborators: Arc<Collaborators>,
    pub validator: Arc<TokenValidator>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/sessions",
            get(sessions::list_sessions).post(sessions::create_session),
        )
        .route(
            "/sessions/:id",
            get(sessions::get_session)
                .patch(sessions::update_session)
                .delete(sessions::delete_session),
        )
        .route("/sessions/:id/connect", get(session_connect))
        .route("/healthz", get(sessions::health))
        .with_state(state)
}

/// Error envelope for every REST handler.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("{0}")]
    BadRequest(String),

    #[error("access denied")]
    Forbidden,

    #[error("session {0} not found")]
    NotFound(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Auth(e) => e.status(),
            ApiError::Registry(RegistryError::CapacityReached { .. }) => {
                StatusCode::TOO_MANY_REQUESTS
            }
            ApiError::Registry(RegistryError::NotFound(_)) | ApiError::NotFound(_) => {
                StatusCode::NOT_FOUND
            }
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        ApiError::Auth(self).into_response()
    }
}
