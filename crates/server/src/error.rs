use std::future::Future;

use axum::{
    http::{header::HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

tokio::task_local! {
    static REQUEST_ID: String;
}

/// Error taxonomy surfaced by the control plane. The allocator surfaces
/// everything; the reconciler logs and relies on re-entry instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ValidationFailed,
    AuthInvalidToken,
    NotFound,
    PermissionDenied,
    NotActive,
    InsufficientCapacity,
    ProvisioningFailed,
    Conflict,
    DecryptionFailed,
    Internal,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::AuthInvalidToken => "AUTH_INVALID_TOKEN",
            Self::NotFound => "NOT_FOUND",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::NotActive => "NOT_ACTIVE",
            Self::InsufficientCapacity => "INSUFFICIENT_CAPACITY",
            Self::ProvisioningFailed => "PROVISIONING_FAILED",
            Self::Conflict => "CONFLICT",
            Self::DecryptionFailed => "DECRYPTION_FAILED",
            Self::Internal => "INTERNAL_ERROR",
        }
    }

    pub const fn status(self) -> StatusCode {
        match self {
            Self::ValidationFailed => StatusCode::BAD_REQUEST,
            Self::AuthInvalidToken => StatusCode::UNAUTHORIZED,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::PermissionDenied => StatusCode::FORBIDDEN,
            Self::NotActive => StatusCode::BAD_REQUEST,
            Self::InsufficientCapacity => StatusCode::SERVICE_UNAVAILABLE,
            Self::ProvisioningFailed => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Conflict => StatusCode::CONFLICT,
            Self::DecryptionFailed => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub const fn retryable(self) -> bool {
        matches!(self, Self::InsufficientCapacity | Self::ProvisioningFailed | Self::Internal)
    }

    pub const fn default_message(self) -> &'static str {
        match self {
            Self::ValidationFailed => "request validation failed",
            Self::AuthInvalidToken => "invalid authentication token",
            Self::NotFound => "requested resource not found",
            Self::PermissionDenied => "caller lacks required permission",
            Self::NotActive => "lease is no longer active",
            Self::InsufficientCapacity => "not enough free workers to satisfy the request",
            Self::ProvisioningFailed => "worker provisioning failed",
            Self::Conflict => "resource already exists",
            Self::DecryptionFailed => "stored secret could not be decrypted",
            Self::Internal => "internal server error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoreError {
    code: ErrorCode,
    message: String,
    details: Value,
    request_id: Option<String>,
}

impl CoreError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), details: json!({}), request_id: None }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    /// Allocator failure when fewer than the requested nodes could be
    /// claimed; reports how many were actually found.
    pub fn insufficient_capacity(requested: usize, found: usize) -> Self {
        Self::from_code(ErrorCode::InsufficientCapacity)
            .with_details(json!({ "requested": requested, "found": found }))
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> &Value {
        &self.details
    }
}

impl std::fmt::Display for CoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(error: sqlx::Error) -> Self {
        if is_unique_violation(&error) {
            return Self::from_code(ErrorCode::Conflict);
        }
        Self::new(ErrorCode::Internal, format!("catalog error: {error}"))
    }
}

/// Postgres unique-violation, the conflict signal for duplicate worker
/// registrations and duplicate tenant handles.
pub fn is_unique_violation(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db_error) => db_error.code().as_deref() == Some("23505"),
        _ => false,
    }
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let request_id = self.request_id.or_else(current_request_id);

        let body = Json(json!({
            "error": {
                "code": self.code.as_str(),
                "message": self.message,
                "retryable": self.code.retryable(),
                "request_id": request_id.as_deref(),
                "details": self.details,
            }
        }));

        let mut response = (self.code.status(), body).into_response();
        if let Some(id) = request_id.as_deref() {
            stamp_request_id(&mut response, id);
        }
        response
    }
}

/// Run `future` with `request_id` installed as the task-local correlation
/// id for everything it awaits.
pub async fn with_request_id_scope<F: Future>(request_id: String, future: F) -> F::Output {
    REQUEST_ID.scope(request_id, future).await
}

pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(|id| id.clone()).ok()
}

/// Correlation id for an incoming request: the caller's `x-request-id`
/// when it carries one, a fresh UUID otherwise.
pub fn incoming_request_id(headers: &HeaderMap) -> String {
    match headers.get(REQUEST_ID_HEADER).and_then(|value| value.to_str().ok()) {
        Some(id) if !id.trim().is_empty() => id.to_owned(),
        _ => Uuid::new_v4().to_string(),
    }
}

/// Echo the correlation id on the response. Ids that cannot form a valid
/// header value are dropped rather than failing the response.
pub fn stamp_request_id(response: &mut Response, request_id: &str) {
    let Ok(value) = HeaderValue::try_from(request_id) else {
        return;
    };
    response.headers_mut().insert(REQUEST_ID_HEADER, value);
}
