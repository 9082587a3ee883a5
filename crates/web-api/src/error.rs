use application::ApplicationError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    /// 瞬时故障，客户端可以提示用户手动重试
    pub retryable: bool,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                code,
                message: message.into(),
                retryable: false,
            },
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }

    fn retryable(mut self, retryable: bool) -> Self {
        self.body.retryable = retryable;
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<ApplicationError> for ApiError {
    fn from(error: ApplicationError) -> Self {
        use application::ApplicationError as AppErr;
        use domain::{DomainError, RepositoryError};

        let retryable = error.is_transient();
        let message = error.to_string();
        let api_error = match error {
            AppErr::Domain(DomainError::InvalidArgument { .. }) => {
                ApiError::new(StatusCode::BAD_REQUEST, "INVALID_ARGUMENT", message)
            }
            AppErr::Domain(DomainError::SelfPairing) => {
                ApiError::new(StatusCode::BAD_REQUEST, "SELF_PAIRING", message)
            }
            AppErr::Domain(DomainError::InvalidRoomTransition { .. }) => {
                ApiError::new(StatusCode::CONFLICT, "INVALID_ROOM_TRANSITION", message)
            }
            AppErr::Domain(DomainError::RoomFull(_)) => {
                ApiError::new(StatusCode::CONFLICT, "ROOM_FULL", message)
            }
            AppErr::RoomUnavailable(_) => {
                ApiError::new(StatusCode::GONE, "ROOM_UNAVAILABLE", message)
            }
            AppErr::ClaimConflict(_) => {
                ApiError::new(StatusCode::CONFLICT, "CLAIM_CONFLICT", message)
            }
            AppErr::StoreUnavailable(_) => {
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "STORE_UNAVAILABLE", message)
            }
            AppErr::Repository(RepositoryError::NotFound) | AppErr::NotFound { .. } => {
                ApiError::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
            }
            AppErr::Repository(RepositoryError::Conflict) => {
                ApiError::new(StatusCode::CONFLICT, "CONFLICT", message)
            }
            AppErr::Repository(RepositoryError::Storage { .. }) => {
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "STORE_UNAVAILABLE", message)
            }
            AppErr::Realtime(_) => {
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "REALTIME_ERROR", message)
            }
            AppErr::Identity(_) => ApiError::internal_server_error(message),
        };
        if api_error.status.is_server_error() {
            tracing::warn!(status = %api_error.status, error = %api_error.body.message, "请求处理失败");
        }
        api_error.retryable(retryable)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
