// Tenant-facing HTTP surface.
//
// Thin axum layer over the allocator and catalog: handlers validate input,
// call one operation, and map the result to protocol bodies. All typed
// failures flow through `CoreError`'s response mapping.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Duration;
use serde_json::json;
use tracing::info;

use corral_common::protocol::{
    ExtendRequest, ExtendResponse, LeaseSecretResponse, ListNodesResponse, LoginRequest,
    LoginResponse, MessageResponse, RegisterWorkerRequest, RentRequest, RentResponse,
    SignupRequest,
};
use corral_common::types::Role;

use crate::allocator::Allocator;
use crate::auth::{jwt::JwtService, middleware::require_bearer_auth, password, Principal};
use crate::catalog::Catalog;
use crate::db::pool::check_pool_health;
use crate::error::{
    incoming_request_id, is_unique_violation, stamp_request_id, with_request_id_scope, CoreError,
    ErrorCode,
};

#[derive(Clone)]
pub struct ApiState {
    pub catalog: Catalog,
    pub allocator: Allocator,
    pub jwt: Arc<JwtService>,
}

pub fn build_router(state: ApiState) -> Router {
    let authed = Router::new()
        .route("/api/rent", post(rent))
        .route("/api/release/{lease_id}", post(release))
        .route("/api/extend/{lease_id}", post(extend))
        .route("/api/nodes", get(list_nodes))
        .route("/api/lease/{lease_id}/secret", get(lease_secret))
        .route("/api/admin/reset", post(admin_reset))
        .layer(middleware::from_fn_with_state(Arc::clone(&state.jwt), require_bearer_auth));

    Router::new()
        .route("/api/health", get(health))
        .route("/api/ready", get(ready))
        .route("/api/signup", post(signup))
        .route("/api/login", post(login))
        .route("/api/workers/register", post(register_worker))
        .merge(authed)
        .layer(middleware::from_fn(request_id_scope))
        .with_state(state)
}

/// Every request runs inside a request-id scope so error bodies and logs
/// carry the same correlation id.
async fn request_id_scope(request: Request, next: Next) -> Response {
    let request_id = incoming_request_id(request.headers());
    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;
    stamp_request_id(&mut response, &request_id);
    response
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}

async fn ready(State(state): State<ApiState>) -> Response {
    let db_connected = check_pool_health(state.catalog.pool()).await.is_ok();
    let status =
        if db_connected { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(json!({ "ready": db_connected, "db_connected": db_connected }))).into_response()
}

async fn signup(
    State(state): State<ApiState>,
    Json(payload): Json<SignupRequest>,
) -> Result<(StatusCode, Json<MessageResponse>), CoreError> {
    validate_handle(&payload.username)?;
    validate_password(&payload.password)?;

    let hash = password::hash_password(&payload.password)
        .map_err(|error| CoreError::new(ErrorCode::Internal, error.to_string()))?;

    match state.catalog.create_tenant(&payload.username, &hash, Role::Tenant).await {
        Ok(tenant) => {
            info!(tenant = %tenant.handle, "tenant signed up");
            Ok((StatusCode::CREATED, Json(MessageResponse { message: "account created".into() })))
        }
        Err(error) if is_unique_violation(&error) => {
            Err(CoreError::new(ErrorCode::Conflict, "username is already taken"))
        }
        Err(error) => Err(error.into()),
    }
}

async fn login(
    State(state): State<ApiState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, CoreError> {
    let invalid = || CoreError::new(ErrorCode::AuthInvalidToken, "invalid credentials");

    let tenant = state.catalog.tenant_by_handle(&payload.username).await?.ok_or_else(invalid)?;

    let verified = password::verify_password(&payload.password, &tenant.password_hash)
        .map_err(|error| CoreError::new(ErrorCode::Internal, error.to_string()))?;
    if !verified {
        return Err(invalid());
    }

    let principal = Principal { id: tenant.id, handle: tenant.handle, role: tenant.role };
    let token = state
        .jwt
        .issue_token(&principal)
        .map_err(|error| CoreError::new(ErrorCode::Internal, error.to_string()))?;

    Ok(Json(LoginResponse { token }))
}

async fn rent(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
    Json(payload): Json<RentRequest>,
) -> Result<Json<RentResponse>, CoreError> {
    if payload.duration_hours < 1 {
        return Err(CoreError::new(ErrorCode::ValidationFailed, "duration_hours must be >= 1"));
    }
    if payload.count < 1 {
        return Err(CoreError::new(ErrorCode::ValidationFailed, "count must be >= 1"));
    }

    let allocated = state
        .allocator
        .rent(
            &principal,
            payload.count as usize,
            Duration::hours(payload.duration_hours),
            payload.secret.as_deref(),
        )
        .await?;

    Ok(Json(RentResponse { allocated }))
}

async fn release(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
    Path(lease_id): Path<i64>,
) -> Result<Json<MessageResponse>, CoreError> {
    state.allocator.release(&principal, lease_id).await?;
    Ok(Json(MessageResponse { message: "lease released".into() }))
}

async fn extend(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
    Path(lease_id): Path<i64>,
    Json(payload): Json<ExtendRequest>,
) -> Result<Json<ExtendResponse>, CoreError> {
    if payload.additional_hours < 1 {
        return Err(CoreError::new(ErrorCode::ValidationFailed, "additional_hours must be >= 1"));
    }

    let leased_until = state
        .allocator
        .extend(&principal, lease_id, Duration::hours(payload.additional_hours))
        .await?;

    Ok(Json(ExtendResponse { lease_id, leased_until }))
}

async fn list_nodes(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<ListNodesResponse>, CoreError> {
    Ok(Json(state.allocator.list_nodes(&principal).await?))
}

async fn lease_secret(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
    Path(lease_id): Path<i64>,
) -> Result<Json<LeaseSecretResponse>, CoreError> {
    let secret = state.allocator.lease_secret(&principal, lease_id).await?;
    Ok(Json(LeaseSecretResponse { lease_id, user: principal.handle, secret }))
}

async fn register_worker(
    State(state): State<ApiState>,
    Json(payload): Json<RegisterWorkerRequest>,
) -> Result<(StatusCode, Json<MessageResponse>), CoreError> {
    if payload.hostname.trim().is_empty() {
        return Err(CoreError::new(ErrorCode::ValidationFailed, "hostname must not be empty"));
    }
    if payload.ssh_port == 0 {
        return Err(CoreError::new(ErrorCode::ValidationFailed, "ssh_port must not be 0"));
    }

    match state.catalog.register_node(&payload.hostname, payload.ssh_port).await {
        Ok(node) => {
            info!(node_id = node.id, endpoint = %node.endpoint, "worker registered");
            Ok((
                StatusCode::CREATED,
                Json(MessageResponse { message: "worker registered".into() }),
            ))
        }
        Err(error) if is_unique_violation(&error) => {
            Err(CoreError::new(ErrorCode::Conflict, "worker already registered"))
        }
        Err(error) => Err(error.into()),
    }
}

async fn admin_reset(
    State(state): State<ApiState>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<MessageResponse>, CoreError> {
    if !principal.role.is_admin() {
        return Err(CoreError::from_code(ErrorCode::PermissionDenied));
    }

    state.catalog.reset_fleet().await?;
    info!(admin = %principal.handle, "fleet reset");
    Ok(Json(MessageResponse { message: "fleet reset".into() }))
}

/// Tenant handles become OS user names on workers, so they are held to
/// useradd rules: lowercase start, then lowercase/digits/underscore/dash.
fn validate_handle(handle: &str) -> Result<(), CoreError> {
    let mut chars = handle.chars();
    let first_ok = matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_');
    let rest_ok =
        chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');

    if handle.len() < 3 || handle.len() > 32 || !first_ok || !rest_ok {
        return Err(CoreError::new(
            ErrorCode::ValidationFailed,
            "username must be 3-32 chars, start with a lowercase letter, \
             and contain only lowercase letters, digits, underscore, or dash",
        ));
    }
    Ok(())
}

fn validate_password(password: &str) -> Result<(), CoreError> {
    if password.len() < 8 {
        return Err(CoreError::new(
            ErrorCode::ValidationFailed,
            "password must be at least 8 characters",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{validate_handle, validate_password};

    #[test]
    fn handles_follow_os_user_rules() {
        for good in ["alice", "bob-2", "web_tenant", "_svc"] {
            validate_handle(good).unwrap_or_else(|_| panic!("`{good}` should be accepted"));
        }
        for bad in ["al", "Alice", "1alice", "alice!", "a]b", &"x".repeat(33)] {
            assert!(validate_handle(bad).is_err(), "`{bad}` should be rejected");
        }
    }

    #[test]
    fn short_passwords_are_rejected() {
        assert!(validate_password("hunter2").is_err());
        assert!(validate_password("hunter2!").is_ok());
    }
}
