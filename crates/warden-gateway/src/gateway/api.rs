//! HTTP/JSON RPC surface.
//!
//! Every handler runs on its own task and calls straight into
//! [`GatewayService`]. Operations that return a status report `{"status": 0}`
//! on success; failures carry `{kind, category, message, detail}`.

use crate::gateway::pipeline::{AuthOutcome, AuthRequest};
use crate::gateway::service::{GatewayService, GatewayServiceState};
use crate::gateway::types::{ErrorCategory, GatewayError, GatewayErrorKind};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Errors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Wrapper that turns a [`GatewayError`] into an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        Self(e)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: GatewayErrorKind,
    pub category: ErrorCategory,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub detail: Option<String>,
}

pub fn status_for(category: ErrorCategory) -> StatusCode {
    match category {
        ErrorCategory::InputValidation => StatusCode::BAD_REQUEST,
        ErrorCategory::UpstreamAuthentication => StatusCode::UNAUTHORIZED,
        ErrorCategory::ResourceExhaustion => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCategory::ExternalAgent => StatusCode::BAD_GATEWAY,
        ErrorCategory::NotFound => StatusCode::NOT_FOUND,
        ErrorCategory::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let category = self.0.category();
        let body = ErrorBody {
            kind: self.0.kind,
            category,
            message: self.0.message,
            detail: self.0.detail,
        };
        (status_for(category), Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Router
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl GatewayService {
    pub fn create_router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/health", get(health_check))
            .route("/v1/authenticate", post(authenticate))
            .route("/v1/disconnect", post(disconnect))
            .route("/v1/connections", get(list_connections))
            .route("/v1/allocations", get(list_allocations))
            .route("/v1/clients", get(list_clients).post(create_client))
            .route("/v1/clients/:client", get(get_client))
            .route("/v1/clients/:client/revoke", post(revoke_client))
            .with_state(self)
    }
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "wardend",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ── Sessions ─────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: i32,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub already_connected: bool,
}

impl StatusResponse {
    fn ok() -> Self {
        Self {
            status: 0,
            already_connected: false,
        }
    }
}

async fn authenticate(
    State(svc): State<GatewayServiceState>,
    Json(req): Json<AuthRequest>,
) -> ApiResult<StatusResponse> {
    let outcome = svc.authenticate(&req).await?;
    Ok(Json(StatusResponse {
        status: 0,
        already_connected: matches!(outcome, AuthOutcome::AlreadyConnected(_)),
    }))
}

#[derive(Debug, Deserialize)]
struct DisconnectRequest {
    client: String,
}

async fn disconnect(
    State(svc): State<GatewayServiceState>,
    Json(req): Json<DisconnectRequest>,
) -> ApiResult<StatusResponse> {
    svc.disconnect(&req.client).await?;
    Ok(Json(StatusResponse::ok()))
}

async fn list_connections(State(svc): State<GatewayServiceState>) -> Json<serde_json::Value> {
    Json(json!({ "connections": svc.list_connections().await }))
}

#[derive(Debug, Default, Deserialize)]
struct AllocationQuery {
    #[serde(default)]
    only_allocated: bool,
}

async fn list_allocations(
    State(svc): State<GatewayServiceState>,
    Query(q): Query<AllocationQuery>,
) -> Json<serde_json::Value> {
    Json(json!({ "allocations": svc.list_allocations(q.only_allocated).await }))
}

// ── Certificates ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateClientRequest {
    client: String,
    #[serde(default)]
    force: bool,
}

async fn create_client(
    State(svc): State<GatewayServiceState>,
    Json(req): Json<CreateClientRequest>,
) -> ApiResult<serde_json::Value> {
    let config = svc.create_client(&req.client, req.force).await?;
    Ok(Json(json!({ "config": config })))
}

async fn get_client(
    State(svc): State<GatewayServiceState>,
    Path(client): Path<String>,
) -> ApiResult<serde_json::Value> {
    let details = svc.get_client(&client).await?;
    Ok(Json(json!(details)))
}

async fn revoke_client(
    State(svc): State<GatewayServiceState>,
    Path(client): Path<String>,
) -> ApiResult<StatusResponse> {
    svc.revoke_client(&client).await?;
    Ok(Json(StatusResponse::ok()))
}

async fn list_clients(State(svc): State<GatewayServiceState>) -> ApiResult<serde_json::Value> {
    let clients = svc.list_clients().await?;
    Ok(Json(json!({ "clients": clients })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_map_to_status_codes() {
        assert_eq!(status_for(ErrorCategory::InputValidation), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for(ErrorCategory::UpstreamAuthentication),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_for(ErrorCategory::ResourceExhaustion),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(status_for(ErrorCategory::ExternalAgent), StatusCode::BAD_GATEWAY);
        assert_eq!(status_for(ErrorCategory::NotFound), StatusCode::NOT_FOUND);
    }

    #[test]
    fn error_response_carries_kind_and_detail() {
        let err = GatewayError::new(GatewayErrorKind::PoolExhausted, "no free address")
            .with_detail("capacity=253");
        let resp = ApiError(err).into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn status_response_omits_false_flag() {
        let v = serde_json::to_value(StatusResponse::ok()).unwrap();
        assert_eq!(v, json!({ "status": 0 }));
    }
}
