use crate::error::{CoreError, ErrorCode};
use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use super::jwt::JwtService;

/// Bearer-token gate. On success the decoded [`super::Principal`] is
/// inserted as a request extension for handlers to consume.
pub async fn require_bearer_auth(
    State(jwt_service): State<Arc<JwtService>>,
    mut request: Request,
    next: Next,
) -> Response {
    let principal = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token)
        .and_then(|token| jwt_service.validate_token(token).ok());

    match principal {
        Some(principal) => {
            request.extensions_mut().insert(principal);
            next.run(request).await
        }
        None => CoreError::new(ErrorCode::AuthInvalidToken, "missing or invalid bearer token")
            .into_response(),
    }
}

/// Pull the token out of an `Authorization` header value. The scheme is
/// case-insensitive; a blank token does not count.
fn bearer_token(header_value: &str) -> Option<&str> {
    let mut parts = header_value.splitn(2, ' ');
    match (parts.next(), parts.next()) {
        (Some(scheme), Some(rest)) if scheme.eq_ignore_ascii_case("bearer") => {
            let token = rest.trim();
            (!token.is_empty()).then_some(token)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::require_bearer_auth;
    use crate::auth::{jwt::JwtService, Principal};
    use axum::{
        body::Body,
        extract::Extension,
        http::{header::AUTHORIZATION, Request, StatusCode},
        middleware,
        routing::get,
        Router,
    };
    use corral_common::types::Role;
    use std::sync::Arc;
    use tower::ServiceExt;

    const TEST_SECRET: &str = "corral_test_secret_that_is_definitely_long_enough";

    fn protected_app(jwt_service: Arc<JwtService>) -> Router {
        Router::new()
            .route(
                "/protected",
                get(|Extension(principal): Extension<Principal>| async move {
                    format!("{}:{}", principal.id, principal.handle)
                }),
            )
            .layer(middleware::from_fn_with_state(jwt_service, require_bearer_auth))
    }

    #[tokio::test]
    async fn rejects_requests_without_bearer_token() {
        let app = protected_app(Arc::new(
            JwtService::new(TEST_SECRET).expect("service should initialize"),
        ));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/protected")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should return a response");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn rejects_requests_with_invalid_bearer_token() {
        let app = protected_app(Arc::new(
            JwtService::new(TEST_SECRET).expect("service should initialize"),
        ));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/protected")
                    .header(AUTHORIZATION, "Bearer invalid-token")
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should return a response");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn injects_principal_for_valid_bearer_token() {
        let service = Arc::new(JwtService::new(TEST_SECRET).expect("service should initialize"));
        let principal = Principal { id: 7, handle: "alice".into(), role: Role::Tenant };
        let token = service.issue_token(&principal).expect("token should be issued");

        let response = protected_app(service)
            .oneshot(
                Request::builder()
                    .uri("/protected")
                    .header(AUTHORIZATION, format!("Bearer {token}"))
                    .body(Body::empty())
                    .expect("request should build"),
            )
            .await
            .expect("request should return a response");

        assert_eq!(response.status(), StatusCode::OK);
    }
}
