use crate::external::UpstreamError;
use crate::linking::LinkingError;
use crate::mediator::MediatorError;
use crate::pagination::PaginationError;
use crate::run_state::{OperationKind, RunStateError};
use crate::store::StoreError;
use axum::Json;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

pub type Result<T, E = AppError> = std::result::Result<T, E>;

/// Every failure that can reach an API response or a job result.
#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    RunState(#[from] RunStateError),

    #[error(transparent)]
    Pagination(#[from] PaginationError),

    #[error(transparent)]
    Mediator(#[from] MediatorError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    Linking(#[from] LinkingError),

    #[error("{0}")]
    Validation(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
}

impl AppError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, AppError::RunState(RunStateError::AlreadyRunning(_)))
    }

    /// Status code, stable title and an optional client-safe detail.
    fn problem(&self) -> (StatusCode, &'static str, Option<String>) {
        match self {
            AppError::RunState(RunStateError::AlreadyRunning(flag)) => {
                let title = match flag.kind {
                    OperationKind::Aggregation => "AggregationAlreadyRunning",
                    OperationKind::Purge => "PurgeAlreadyRunning",
                };
                (StatusCode::CONFLICT, title, Some(self.to_string()))
            }
            AppError::Pagination(_) | AppError::Validation(_) => (
                StatusCode::BAD_REQUEST,
                "ValidationFailed",
                Some(self.to_string()),
            ),
            AppError::Mediator(MediatorError::UnknownOperation(_))
            | AppError::Mediator(MediatorError::InvalidPayload { .. }) => (
                StatusCode::BAD_REQUEST,
                "ValidationFailed",
                Some(self.to_string()),
            ),
            AppError::Mediator(MediatorError::DuplicateRegistration(_)) | AppError::Store(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "InternalError", None)
            }
            AppError::NotFound { .. } => {
                (StatusCode::NOT_FOUND, "NotFound", Some(self.to_string()))
            }
            AppError::Upstream(_) => (StatusCode::BAD_GATEWAY, "UpstreamFailure", None),
            AppError::Linking(err) => match err {
                LinkingError::Unsupported(_) => (
                    StatusCode::NOT_IMPLEMENTED,
                    "UnsupportedOperation",
                    Some(self.to_string()),
                ),
                LinkingError::Conflict { .. } => {
                    (StatusCode::CONFLICT, "UnlinkConflict", Some(self.to_string()))
                }
                LinkingError::InvalidRequest(_) => (
                    StatusCode::BAD_REQUEST,
                    "ValidationFailed",
                    Some(self.to_string()),
                ),
                LinkingError::Unauthorized { .. }
                | LinkingError::Token(_)
                | LinkingError::Transport(_) => {
                    (StatusCode::BAD_GATEWAY, "UpstreamFailure", None)
                }
            },
        }
    }
}

#[derive(Serialize)]
struct ProblemDetails {
    r#type: &'static str,
    title: &'static str,
    status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, title, detail) = self.problem();

        if status.is_server_error() {
            tracing::error!(error = %self, title, "request failed");
        } else {
            tracing::debug!(error = %self, title, "request rejected");
        }

        let body = Json(ProblemDetails {
            r#type: "about:blank",
            title,
            status: status.as_u16(),
            detail,
        });

        (
            status,
            [(header::CONTENT_TYPE, "application/problem+json")],
            body,
        )
            .into_response()
    }
}
