//! Axum router and server for the webhook gateway.

use crate::credentials::{webhook_url, IssueOptions};
use crate::gateway::{Gateway, RequestMeta};
use crate::types::{ExecuteRequest, IssueRequest, RevokeRequest};
use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

type SharedGateway = Arc<Gateway>;

pub fn router(gateway: SharedGateway) -> Router {
    Router::new()
        .route("/webhook/sql/{instance_id}", post(execute))
        .route("/webhook/sql/{instance_id}/validate", post(validate))
        .route("/webhook/sql/{instance_id}/health", get(health))
        .route("/webhook/sql/{instance_id}/stats", get(stats))
        .route("/admin/sql-webhooks", post(admin_issue))
        .route(
            "/admin/sql-webhooks/{key}",
            get(admin_list).delete(admin_revoke),
        )
        .with_state(gateway)
}

/// Bind and serve until ctrl-c.
pub async fn start(gateway: SharedGateway, bind_addr: &str) -> anyhow::Result<()> {
    let app = router(gateway);
    let listener = TcpListener::bind(bind_addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "sql webhook gateway listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}

fn request_meta(
    headers: &HeaderMap,
    params: &HashMap<String, String>,
    addr: SocketAddr,
    method: &'static str,
    path: String,
) -> RequestMeta {
    let token = params
        .get("token")
        .cloned()
        .or_else(|| header_string(headers, "x-webhook-token"));
    RequestMeta {
        token,
        ip: addr.ip().to_string(),
        user_agent: header_string(headers, "user-agent").unwrap_or_default(),
        method,
        path,
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

// ─── Webhook endpoints ───────────────────────────────────────────────────

async fn execute(
    State(gateway): State<SharedGateway>,
    Path(instance_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<ExecuteRequest>,
) -> impl IntoResponse {
    let meta = request_meta(
        &headers,
        &params,
        addr,
        "POST",
        format!("/webhook/sql/{instance_id}"),
    );
    let (status, response) = gateway.execute_query(&instance_id, meta, body).await;
    (status, Json(response))
}

async fn validate(
    State(gateway): State<SharedGateway>,
    Path(instance_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<ExecuteRequest>,
) -> impl IntoResponse {
    let meta = request_meta(
        &headers,
        &params,
        addr,
        "POST",
        format!("/webhook/sql/{instance_id}/validate"),
    );
    let (status, response) = gateway.validate_query(&instance_id, meta, body).await;
    (status, Json(response))
}

async fn health(
    State(gateway): State<SharedGateway>,
    Path(instance_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let meta = request_meta(
        &headers,
        &params,
        addr,
        "GET",
        format!("/webhook/sql/{instance_id}/health"),
    );
    let (status, response) = gateway.health(&instance_id, meta).await;
    (status, Json(response))
}

async fn stats(
    State(gateway): State<SharedGateway>,
    Path(instance_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let meta = request_meta(
        &headers,
        &params,
        addr,
        "GET",
        format!("/webhook/sql/{instance_id}/stats"),
    );
    let (status, response) = gateway.stats(&instance_id, meta).await;
    (status, Json(response))
}

// ─── Issuance surface ────────────────────────────────────────────────────

fn admin_authorized(gateway: &Gateway, headers: &HeaderMap) -> bool {
    match (
        gateway.config().admin_token.as_deref(),
        header_string(headers, "x-admin-token"),
    ) {
        (Some(expected), Some(provided)) => expected == provided,
        _ => false,
    }
}

fn admin_rejection() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "success": false,
            "error": {
                "message": "admin authentication failed",
                "code": "WEBHOOK_AUTH_FAILED",
            },
        })),
    )
}

async fn admin_issue(
    State(gateway): State<SharedGateway>,
    headers: HeaderMap,
    Json(request): Json<IssueRequest>,
) -> impl IntoResponse {
    if !admin_authorized(&gateway, &headers) {
        return admin_rejection();
    }
    let credential = gateway.credentials().issue(
        &request.user_id,
        &request.instance_id,
        request.tier,
        IssueOptions {
            expiry_days: request.expiry_days,
            ip_allowlist: request.ip_allowlist,
            name: request.name,
        },
    );
    let url = webhook_url(
        &gateway.config().base_url,
        &credential.target_instance_id,
        &credential.secret_token,
    );
    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            // The secret is included here and nowhere else.
            "webhook": credential,
            "url": url,
            "issued_at": Utc::now(),
        })),
    )
}

async fn admin_list(
    State(gateway): State<SharedGateway>,
    Path(owner): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if !admin_authorized(&gateway, &headers) {
        return admin_rejection();
    }
    let webhooks = gateway.credentials().list(&owner);
    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "count": webhooks.len(),
            "webhooks": webhooks,
        })),
    )
}

async fn admin_revoke(
    State(gateway): State<SharedGateway>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<RevokeRequest>,
) -> impl IntoResponse {
    if !admin_authorized(&gateway, &headers) {
        return admin_rejection();
    }
    match gateway.credentials().revoke(&id, &request.user_id) {
        Ok(credential) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "webhook": credential,
            })),
        ),
        Err(error) => (
            error.status(),
            Json(json!({
                "success": false,
                "error": {
                    "message": error.public_message(),
                    "code": error.code(),
                },
            })),
        ),
    }
}
