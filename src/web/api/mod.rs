//! API endpoints module.

pub mod messages;
pub mod tasks;

pub use messages::{ack_inbox, health, inbox, index, list_agents, send_message, stats};
pub use tasks::{ack_task, claim_task, get_rollup, get_task, list_tasks, send_task};

use axum::{
    async_trait,
    extract::{FromRequest, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::error::Error;

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Validation(_) | Error::Json(_) => StatusCode::BAD_REQUEST,
            Error::UnknownTask(_) => StatusCode::NOT_FOUND,
            Error::InvalidTransition { .. } | Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Transport(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message shown to API callers. Validation messages go out bare.
    fn public_message(&self) -> String {
        match self {
            Error::Validation(msg) => msg.clone(),
            other => other.to_string(),
        }
    }
}

/// Errors are returned as `{"error": "..."}`.
impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }
        (status, Json(json!({ "error": self.public_message() }))).into_response()
    }
}

/// JSON body extractor whose rejections use the same `{"error": ...}` shape.
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => Err(Error::Validation(rejection.body_text())),
        }
    }
}
