//! Plain HTTP handlers.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use protocol::{timestamp_now, ErrorCode};
use serde::Deserialize;
use tracing::{info, warn};

use super::AppState;
use crate::auth::{AuthError, Identity, TokenVerifier};
use crate::connection::AdmissionError;
use crate::session::{SessionId, SessionRegistry};

// =============================================================================
// Error Types
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Missing bearer token")]
    MissingToken,

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error(transparent)]
    Capacity(#[from] AdmissionError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::MissingToken => StatusCode::UNAUTHORIZED,
            ApiError::Auth(AuthError::Internal(_)) | ApiError::Auth(AuthError::InvalidUser { .. }) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::Auth(_) => StatusCode::UNAUTHORIZED,
            ApiError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Capacity(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            ApiError::BadRequest(_) => ErrorCode::InvalidMessage,
            ApiError::MissingToken => ErrorCode::AuthRequired,
            ApiError::Auth(AuthError::Internal(_)) | ApiError::Auth(AuthError::InvalidUser { .. }) => {
                ErrorCode::InternalError
            }
            ApiError::Auth(_) => ErrorCode::AuthFailed,
            ApiError::SessionNotFound(_) => ErrorCode::SessionNotFound,
            ApiError::Capacity(_) => ErrorCode::ConnectionCapacityExceeded,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({
            "error": self.to_string(),
            "code": self.code(),
        });
        (self.status(), Json(body)).into_response()
    }
}

// =============================================================================
// Models
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// Resolves the `Authorization: Bearer` header to an identity.
fn bearer_identity(headers: &HeaderMap, state: &AppState) -> Result<Identity, ApiError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(ApiError::MissingToken)?;

    Ok(state.authority.verify_token(token)?)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": timestamp_now(),
        "uptimeSecs": state.uptime().as_secs(),
        "activeSessions": state.registry.active_count(),
        "connections": state.admission.active(),
        "maxConnections": state.admission.max_connections(),
        "clients": state.admission.connections(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    body: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    if req.username.is_empty() || req.password.is_empty() {
        return Err(ApiError::BadRequest(
            "username and password are required".to_string(),
        ));
    }

    let issued = state.authority.login(&req.username, &req.password)?;
    Ok(Json(issued))
}

pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let identity = bearer_identity(&headers, &state)?;
    let sessions = state.registry.list_for_owner(&identity.id);
    Ok(Json(serde_json::json!({ "sessions": sessions })))
}

pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<SessionId>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let identity = bearer_identity(&headers, &state)?;

    // Sessions of other users are indistinguishable from missing ones.
    let owned = state
        .registry
        .get(&session_id)
        .is_some_and(|s| s.owner_id == identity.id);
    if !owned || !state.registry.close(&session_id) {
        warn!(session_id = %session_id, user = %identity.username, "Delete of unknown session");
        return Err(ApiError::SessionNotFound(session_id));
    }

    info!(session_id = %session_id, user = %identity.username, "Session closed over HTTP");
    Ok(Json(serde_json::json!({
        "status": "closed",
        "id": session_id,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{hash_password, user_id_for, TokenAuthority};
    use crate::config::UserConfig;
    use crate::connection::ConnectionAdmission;
    use crate::server::{router, HeartbeatConfig};
    use crate::session::{PtySessionRegistry, SessionDefaults, SessionOptions};
    use axum::body::Body;
    use axum::http::Request;
    use axum::Router;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    fn test_state() -> Arc<AppState> {
        let users = [
            UserConfig {
                username: "alice".to_string(),
                password_sha256: hash_password("wonderland"),
                role: "admin".to_string(),
            },
            UserConfig {
                username: "bob".to_string(),
                password_sha256: hash_password("builder"),
                role: "user".to_string(),
            },
        ];
        let authority =
            TokenAuthority::new(b"http-test".to_vec(), Duration::from_secs(60), &users).unwrap();
        let registry = PtySessionRegistry::new(SessionDefaults {
            shell: Some("/bin/sh".to_string()),
            kill_grace: Duration::from_millis(200),
            ..SessionDefaults::default()
        });

        Arc::new(AppState::new(
            Arc::new(registry),
            Arc::new(authority),
            ConnectionAdmission::new(4),
            HeartbeatConfig::default(),
            CancellationToken::new(),
        ))
    }

    fn token_for(state: &AppState, username: &str) -> String {
        state.authority.issue(username).unwrap().token
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn app(state: &Arc<AppState>) -> Router {
        router(Arc::clone(state))
    }

    fn login_request(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/auth/login")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let state = test_state();
        let response = app(&state)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["activeSessions"], 0);
        assert_eq!(body["connections"], 0);
        assert_eq!(body["maxConnections"], 4);
        assert!(body["timestamp"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_login_success() {
        let state = test_state();
        let response = app(&state)
            .oneshot(login_request(r#"{"username":"alice","password":"wonderland"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["user"]["username"], "alice");
        assert_eq!(body["user"]["role"], "admin");

        let token = body["token"].as_str().unwrap();
        let identity = state.authority.verify_token(token).unwrap();
        assert_eq!(identity.id, user_id_for("alice"));
    }

    #[tokio::test]
    async fn test_login_wrong_password() {
        let state = test_state();
        let response = app(&state)
            .oneshot(login_request(r#"{"username":"alice","password":"nope"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body["code"], "AUTH_FAILED");
    }

    #[tokio::test]
    async fn test_login_missing_fields() {
        let state = test_state();
        let response = app(&state)
            .oneshot(login_request(r#"{"username":"alice"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app(&state).oneshot(login_request("not json")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_list_sessions_requires_token() {
        let state = test_state();
        let response = app(&state)
            .oneshot(
                Request::builder()
                    .uri("/api/sessions")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["code"], "AUTH_REQUIRED");

        let response = app(&state)
            .oneshot(
                Request::builder()
                    .uri("/api/sessions")
                    .header("authorization", "Bearer forged.token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_list_sessions_empty() {
        let state = test_state();
        let token = token_for(&state, "alice");
        let response = app(&state)
            .oneshot(
                Request::builder()
                    .uri("/api/sessions")
                    .header("authorization", format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["sessions"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_delete_session_not_found() {
        let state = test_state();
        let token = token_for(&state, "alice");
        let response = app(&state)
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/api/sessions/nonexistent-id")
                    .header("authorization", format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_list_and_delete_owned_session() {
        let state = test_state();
        let session_id = state
            .registry
            .create(&user_id_for("alice"), SessionOptions::default())
            .await
            .unwrap()
            .summary
            .id;

        let list = |username: &str| {
            Request::builder()
                .uri("/api/sessions")
                .header("authorization", format!("Bearer {}", token_for(&state, username)))
                .body(Body::empty())
                .unwrap()
        };

        let body = body_json(app(&state).oneshot(list("alice")).await.unwrap()).await;
        assert_eq!(body["sessions"][0]["id"], session_id.as_str());
        assert_eq!(body["sessions"][0]["shell"], "/bin/sh");

        let body = body_json(app(&state).oneshot(list("bob")).await.unwrap()).await;
        assert!(body["sessions"].as_array().unwrap().is_empty());

        let delete = |username: &str| {
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/sessions/{session_id}"))
                .header("authorization", format!("Bearer {}", token_for(&state, username)))
                .body(Body::empty())
                .unwrap()
        };

        let response = app(&state).oneshot(delete("bob")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(state.registry.active_count(), 1);

        let response = app(&state).oneshot(delete("alice")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.registry.active_count(), 0);

        state.registry.close_all().await;
    }

    #[tokio::test]
    async fn test_capacity_error_response() {
        let response = ApiError::from(AdmissionError::CapacityExceeded { max: 1 }).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["code"], "CONNECTION_CAPACITY_EXCEEDED");
    }
}
