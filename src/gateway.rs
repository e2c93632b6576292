//! Per-request pipeline: authenticate → rate gate → security screen →
//! execute → audit. Every request terminates through the audit sink
//! exactly once, rejected or not.

use crate::audit::{AuditRecord, AuditSink, Stage};
use crate::config::GatewayConfig;
use crate::credentials::{Credential, CredentialStore};
use crate::error::{GatewayError, GatewayResult};
use crate::instances::{ConnectCoords, InstanceDirectory};
use crate::ratelimit::ConcurrencyGuard;
use crate::security;
use crate::types::{ExecuteRequest, QueryOutput};
use async_trait::async_trait;
use axum::http::StatusCode;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

const HEALTH_PROBE: &str = "SELECT 1 AS health_check";

/// Statement execution seam. The production implementation is the isolated
/// pool registry; tests substitute fakes.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn execute(
        &self,
        instance_id: &str,
        coords: &ConnectCoords,
        query: &str,
    ) -> GatewayResult<QueryOutput>;
}

/// Per-request caller context extracted by the HTTP layer.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub token: Option<String>,
    pub ip: String,
    pub user_agent: String,
    pub method: &'static str,
    pub path: String,
}

struct Rejection {
    error: GatewayError,
    credential: Option<Credential>,
}

impl Rejection {
    fn bare(error: GatewayError) -> Self {
        Self {
            error,
            credential: None,
        }
    }

    fn with(credential: Credential, error: GatewayError) -> Self {
        Self {
            error,
            credential: Some(credential),
        }
    }
}

pub struct Gateway {
    config: GatewayConfig,
    credentials: Arc<CredentialStore>,
    instances: Arc<InstanceDirectory>,
    guard: ConcurrencyGuard,
    executor: Arc<dyn SqlExecutor>,
    audit: Arc<AuditSink>,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        credentials: Arc<CredentialStore>,
        instances: Arc<InstanceDirectory>,
        executor: Arc<dyn SqlExecutor>,
        audit: Arc<AuditSink>,
    ) -> Self {
        Self {
            config,
            credentials,
            instances,
            guard: ConcurrencyGuard::new(),
            executor,
            audit,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub fn instances(&self) -> &Arc<InstanceDirectory> {
        &self.instances
    }

    // ─── Execution endpoint ──────────────────────────────────────────────

    pub async fn execute_query(
        &self,
        instance_id: &str,
        meta: RequestMeta,
        body: ExecuteRequest,
    ) -> (StatusCode, Value) {
        let started = Instant::now();
        let query_text = body.query.clone().unwrap_or_default();
        let transaction_id = body
            .transaction_id
            .clone()
            .unwrap_or_else(|| format!("wh_{}", Uuid::new_v4().simple()));

        match self.run_pipeline(instance_id, &meta, body.query.as_deref()).await {
            Ok((credential, output)) => {
                let status = StatusCode::OK;
                self.write_audit(
                    instance_id,
                    &meta,
                    &query_text,
                    Stage::Completed,
                    Some(&credential),
                    None,
                    status,
                    started,
                );
                (
                    status,
                    json!({
                        "success": true,
                        "webhook_id": credential.id,
                        "transaction_id": transaction_id,
                        "instance_id": instance_id,
                        "result": output,
                        "executed_at": Utc::now(),
                    }),
                )
            }
            Err(rejection) => {
                let status = rejection.error.status();
                self.write_audit(
                    instance_id,
                    &meta,
                    &query_text,
                    rejection.error.stage(),
                    rejection.credential.as_ref(),
                    Some(&rejection.error),
                    status,
                    started,
                );
                let mut response = json!({
                    "success": false,
                    "transaction_id": transaction_id,
                    "instance_id": instance_id,
                    "error": {
                        "message": rejection.error.public_message(),
                        "code": rejection.error.code(),
                    },
                    "failed_at": Utc::now(),
                });
                if let Some(credential) = &rejection.credential {
                    response["webhook_id"] = json!(credential.id);
                }
                if let Some(retry_after) = rejection.error.retry_after() {
                    response["error"]["retry_after"] = json!(retry_after);
                }
                (status, response)
            }
        }
    }

    /// Auth, rate and security gates shared by execute and validate-only.
    /// A pass has already reserved rate budget and charged counters.
    fn run_gate_stages(
        &self,
        instance_id: &str,
        meta: &RequestMeta,
        query: Option<&str>,
    ) -> Result<(Credential, String), Rejection> {
        let token = match meta.token.as_deref() {
            Some(token) if !token.is_empty() => token,
            _ => return Err(Rejection::bare(GatewayError::TokenMissing)),
        };
        if instance_id.trim().is_empty() {
            return Err(Rejection::bare(GatewayError::InstanceMissing));
        }

        let credential = self
            .credentials
            .validate(token, instance_id, &meta.ip)
            .map_err(Rejection::bare)?;

        let rate = credential.tier.rate_profile();
        if let Err(error) = self.credentials.check_and_reserve(&credential.id, &rate) {
            self.credentials.record_rejected(&credential.id);
            return Err(Rejection::with(credential, error));
        }

        let query = match query {
            Some(q) if !q.trim().is_empty() => q.to_string(),
            _ => {
                self.credentials.record_outcome(&credential.id, false);
                return Err(Rejection::with(credential, GatewayError::QueryMissing));
            }
        };

        let profile = credential.tier.restriction_profile();
        if let Err(violation) = security::check(&query, &profile) {
            self.credentials.record_outcome(&credential.id, false);
            tracing::warn!(
                webhook_id = %credential.id,
                rule = violation.rule,
                severity = ?violation.severity,
                query = %security::sanitize_for_log(&security::query_preview(&query)),
                "query rejected by policy"
            );
            return Err(Rejection::with(
                credential,
                GatewayError::SecurityViolation(violation),
            ));
        }

        Ok((credential, query))
    }

    async fn run_pipeline(
        &self,
        instance_id: &str,
        meta: &RequestMeta,
        query: Option<&str>,
    ) -> Result<(Credential, QueryOutput), Rejection> {
        let (credential, query) = self.run_gate_stages(instance_id, meta, query)?;

        let coords = match self.instances.get(instance_id) {
            Some(coords) => coords,
            None => {
                self.credentials.record_outcome(&credential.id, false);
                return Err(Rejection::with(
                    credential,
                    GatewayError::InstanceNotFound(instance_id.to_string()),
                ));
            }
        };

        let rate = credential.tier.rate_profile();
        let permit = match self.guard.acquire(&credential.id, rate.max_concurrent) {
            Ok(permit) => permit,
            Err(error) => {
                self.credentials.record_outcome(&credential.id, false);
                return Err(Rejection::with(credential, error));
            }
        };

        let result = self.executor.execute(instance_id, &coords, &query).await;
        drop(permit);

        match result {
            Ok(output) => {
                self.credentials.record_outcome(&credential.id, true);
                Ok((credential, output))
            }
            Err(error) => {
                self.credentials.record_outcome(&credential.id, false);
                Err(Rejection::with(credential, error))
            }
        }
    }

    // ─── Validate-only endpoint ──────────────────────────────────────────

    pub async fn validate_query(
        &self,
        instance_id: &str,
        meta: RequestMeta,
        body: ExecuteRequest,
    ) -> (StatusCode, Value) {
        let started = Instant::now();
        let query_text = body.query.clone().unwrap_or_default();

        match self.run_gate_stages(instance_id, &meta, body.query.as_deref()) {
            Ok((credential, query)) => {
                self.credentials.record_outcome(&credential.id, true);
                let status = StatusCode::OK;
                self.write_audit(
                    instance_id,
                    &meta,
                    &query,
                    Stage::Completed,
                    Some(&credential),
                    None,
                    status,
                    started,
                );
                (
                    status,
                    json!({
                        "success": true,
                        "webhook_id": credential.id,
                        "instance_id": instance_id,
                        "validation": {
                            "auth": "passed",
                            "rate_limit": "passed",
                            "security": "passed",
                        },
                        "query_info": {
                            "query_hash": security::query_hash(&query),
                            "query_preview": security::query_preview(&query),
                            "query_length": query.len(),
                        },
                        "validated_at": Utc::now(),
                    }),
                )
            }
            Err(rejection) => {
                let status = rejection.error.status();
                let stage = rejection.error.stage();
                self.write_audit(
                    instance_id,
                    &meta,
                    &query_text,
                    stage,
                    rejection.credential.as_ref(),
                    Some(&rejection.error),
                    status,
                    started,
                );
                let stage_status = |s: Stage| -> &'static str {
                    use std::cmp::Ordering;
                    let order = |s: Stage| match s {
                        Stage::Auth => 0,
                        Stage::Rate => 1,
                        _ => 2,
                    };
                    match order(s).cmp(&order(stage)) {
                        Ordering::Less => "passed",
                        Ordering::Equal => "failed",
                        Ordering::Greater => "skipped",
                    }
                };
                let mut response = json!({
                    "success": false,
                    "instance_id": instance_id,
                    "validation": {
                        "auth": stage_status(Stage::Auth),
                        "rate_limit": stage_status(Stage::Rate),
                        "security": stage_status(Stage::Security),
                    },
                    "error": {
                        "message": rejection.error.public_message(),
                        "code": rejection.error.code(),
                    },
                    "validated_at": Utc::now(),
                });
                if let Some(credential) = &rejection.credential {
                    response["webhook_id"] = json!(credential.id);
                }
                (status, response)
            }
        }
    }

    // ─── Health endpoint ─────────────────────────────────────────────────

    pub async fn health(&self, instance_id: &str, meta: RequestMeta) -> (StatusCode, Value) {
        let credential = match self.authenticate_only(instance_id, &meta) {
            Ok(credential) => credential,
            Err(error) => return auth_failure(instance_id, &error),
        };

        let coords = match self.instances.get(instance_id) {
            Some(coords) => coords,
            None => {
                return (
                    StatusCode::NOT_FOUND,
                    json!({
                        "success": false,
                        "webhook_id": credential.id,
                        "instance_id": instance_id,
                        "status": "instance_not_found",
                        "checked_at": Utc::now(),
                    }),
                )
            }
        };

        match self.executor.execute(instance_id, &coords, HEALTH_PROBE).await {
            Ok(output) => {
                let passed = output.row_count == 1;
                (
                    StatusCode::OK,
                    json!({
                        "success": true,
                        "webhook_id": credential.id,
                        "instance_id": instance_id,
                        "status": if passed { "healthy" } else { "unhealthy" },
                        "connection_test": if passed { "passed" } else { "failed" },
                        "checked_at": Utc::now(),
                        "webhook_stats": self.credentials.stats(&credential.id),
                    }),
                )
            }
            Err(error) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({
                    "success": false,
                    "webhook_id": credential.id,
                    "instance_id": instance_id,
                    "status": "unhealthy",
                    "error": error.public_message(),
                    "checked_at": Utc::now(),
                }),
            ),
        }
    }

    // ─── Stats endpoint ──────────────────────────────────────────────────

    pub async fn stats(&self, instance_id: &str, meta: RequestMeta) -> (StatusCode, Value) {
        let credential = match self.authenticate_only(instance_id, &meta) {
            Ok(credential) => credential,
            Err(error) => return auth_failure(instance_id, &error),
        };

        match self.credentials.stats(&credential.id) {
            Some(stats) => (
                StatusCode::OK,
                json!({
                    "success": true,
                    "webhook_id": credential.id,
                    "instance_id": instance_id,
                    "stats": stats,
                    "tier": credential.tier,
                    "rate_limits": credential.tier.rate_profile(),
                    "sql_restrictions": credential.tier.restriction_profile(),
                    "retrieved_at": Utc::now(),
                }),
            ),
            None => (
                StatusCode::NOT_FOUND,
                json!({
                    "success": false,
                    "error": { "message": "stats not found", "code": "WEBHOOK_INTERNAL_ERROR" },
                }),
            ),
        }
    }

    fn authenticate_only(
        &self,
        instance_id: &str,
        meta: &RequestMeta,
    ) -> GatewayResult<Credential> {
        let token = meta
            .token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(GatewayError::TokenMissing)?;
        self.credentials.validate(token, instance_id, &meta.ip)
    }

    #[allow(clippy::too_many_arguments)]
    fn write_audit(
        &self,
        instance_id: &str,
        meta: &RequestMeta,
        query: &str,
        stage: Stage,
        credential: Option<&Credential>,
        error: Option<&GatewayError>,
        status: StatusCode,
        started: Instant,
    ) {
        let (violated_rule, severity) = match error {
            Some(GatewayError::SecurityViolation(violation)) => {
                (Some(violation.rule), Some(violation.severity))
            }
            _ => (None, None),
        };
        self.audit.record(&AuditRecord {
            timestamp: Utc::now(),
            webhook_id: credential.map(|c| c.id.clone()),
            user_id: credential.map(|c| c.owner_user_id.clone()),
            instance_id: instance_id.to_string(),
            ip: meta.ip.clone(),
            user_agent: meta.user_agent.clone(),
            query_hash: security::query_hash(query),
            query_preview: security::query_preview(&security::sanitize_for_log(query)),
            method: meta.method,
            path: meta.path.clone(),
            stage,
            violated_rule,
            severity,
            response_time_ms: started.elapsed().as_millis() as u64,
            status_code: status.as_u16(),
            success: status.is_success(),
        });
    }
}

fn auth_failure(instance_id: &str, error: &GatewayError) -> (StatusCode, Value) {
    (
        error.status(),
        json!({
            "success": false,
            "instance_id": instance_id,
            "error": {
                "message": error.public_message(),
                "code": error.code(),
            },
        }),
    )
}
