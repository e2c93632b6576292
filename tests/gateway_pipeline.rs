//! End-to-end pipeline tests against a fake statement executor.

use async_trait::async_trait;
use axum::http::StatusCode;
use parking_lot::Mutex;
use serde_json::{json, Value};
use sql_webhook_gateway::audit::AuditSink;
use sql_webhook_gateway::config::GatewayConfig;
use sql_webhook_gateway::credentials::{Credential, CredentialStore, IssueOptions};
use sql_webhook_gateway::error::{GatewayError, GatewayResult};
use sql_webhook_gateway::gateway::{Gateway, RequestMeta, SqlExecutor};
use sql_webhook_gateway::instances::{ConnectCoords, InstanceDirectory};
use sql_webhook_gateway::policy::Tier;
use sql_webhook_gateway::types::{ExecuteRequest, FieldDesc, QueryOutput};
use std::sync::Arc;
use tempfile::TempDir;

/// Answers every statement with a single `health_check` row, recording the
/// queries it saw.
#[derive(Default)]
struct FakeExecutor {
    queries: Mutex<Vec<String>>,
    fail_with: Option<String>,
}

#[async_trait]
impl SqlExecutor for FakeExecutor {
    async fn execute(
        &self,
        _instance_id: &str,
        _coords: &ConnectCoords,
        query: &str,
    ) -> GatewayResult<QueryOutput> {
        self.queries.lock().push(query.to_string());
        if let Some(message) = &self.fail_with {
            return Err(GatewayError::ExecutionFailed(message.clone()));
        }
        Ok(QueryOutput {
            command: "SELECT".to_string(),
            row_count: 1,
            rows: vec![json!({ "health_check": "1" })],
            fields: vec![FieldDesc {
                name: "health_check".to_string(),
            }],
        })
    }
}

struct Harness {
    _dir: TempDir,
    gateway: Gateway,
    executor: Arc<FakeExecutor>,
    audit_path: std::path::PathBuf,
}

fn coords() -> ConnectCoords {
    ConnectCoords {
        host: "localhost".into(),
        port: 5432,
        dbname: "postgres".into(),
        user: "postgres".into(),
        password: "secret".into(),
    }
}

fn harness_with(executor: FakeExecutor) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config = GatewayConfig {
        data_dir: dir.path().to_path_buf(),
        ..GatewayConfig::default()
    };
    let credentials = Arc::new(CredentialStore::open(dir.path()).unwrap());
    let instances = Arc::new(InstanceDirectory::open(dir.path()).unwrap());
    instances.upsert("inst-1", coords());
    let audit = Arc::new(AuditSink::open(dir.path()).unwrap());
    let executor = Arc::new(executor);
    let gateway = Gateway::new(
        config,
        credentials,
        instances,
        executor.clone(),
        audit,
    );
    let audit_path = dir.path().join("webhook-audit.jsonl");
    Harness {
        _dir: dir,
        gateway,
        executor,
        audit_path,
    }
}

fn harness() -> Harness {
    harness_with(FakeExecutor::default())
}

impl Harness {
    fn issue(&self, tier: Tier, instance_id: &str) -> Credential {
        self.gateway
            .credentials()
            .issue("user-1", instance_id, tier, IssueOptions::default())
    }

    fn meta(&self, token: Option<&str>) -> RequestMeta {
        RequestMeta {
            token: token.map(|t| t.to_string()),
            ip: "127.0.0.1".to_string(),
            user_agent: "pipeline-tests".to_string(),
            method: "POST",
            path: "/webhook/sql/inst-1".to_string(),
        }
    }

    async fn execute(&self, token: Option<&str>, query: &str) -> (StatusCode, Value) {
        self.gateway
            .execute_query(
                "inst-1",
                self.meta(token),
                ExecuteRequest {
                    query: Some(query.to_string()),
                    transaction_id: None,
                },
            )
            .await
    }

    fn audit_lines(&self) -> Vec<Value> {
        std::fs::read_to_string(&self.audit_path)
            .unwrap_or_default()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }
}

#[tokio::test]
async fn read_only_select_succeeds_and_insert_is_rejected() {
    let h = harness();
    let cred = h.issue(Tier::ReadOnly, "inst-1");

    let (status, body) = h
        .execute(Some(&cred.secret_token), "SELECT 1 AS health_check")
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["webhook_id"], cred.id.as_str());
    assert_eq!(body["instance_id"], "inst-1");
    assert_eq!(body["result"]["rowCount"], 1);
    assert_eq!(body["result"]["rows"][0]["health_check"], "1");

    let (status, body) = h
        .execute(Some(&cred.secret_token), "INSERT INTO t VALUES (1)")
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "SQL_SECURITY_VIOLATION");

    // The rejected statement never reached the executor.
    assert_eq!(h.executor.queries.lock().len(), 1);
}

#[tokio::test]
async fn missing_token_is_unauthorized() {
    let h = harness();
    let (status, body) = h.execute(None, "SELECT 1").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "WEBHOOK_TOKEN_MISSING");
}

#[tokio::test]
async fn auth_failures_share_a_generic_message() {
    let h = harness();
    let cred = h.issue(Tier::Standard, "inst-2");

    // Bound to another instance: rejected without saying why.
    let (status, body) = h.execute(Some(&cred.secret_token), "SELECT 1").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "WEBHOOK_AUTH_FAILED");
    assert_eq!(body["error"]["message"], "webhook authentication failed");

    let (_, bogus_body) = h.execute(Some("whsql_bogus"), "SELECT 1").await;
    assert_eq!(bogus_body["error"]["message"], body["error"]["message"]);
}

#[tokio::test]
async fn revoked_credential_is_rejected() {
    let h = harness();
    let cred = h.issue(Tier::Standard, "inst-1");
    h.gateway.credentials().revoke(&cred.id, "user-1").unwrap();

    let (status, body) = h.execute(Some(&cred.secret_token), "SELECT 1").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "WEBHOOK_AUTH_FAILED");
}

#[tokio::test]
async fn minute_rate_limit_rejects_with_retry_hint() {
    let h = harness();
    let cred = h.issue(Tier::Standard, "inst-1");
    let rpm = Tier::Standard.rate_profile().requests_per_minute;

    for i in 0..rpm {
        let (status, _) = h.execute(Some(&cred.secret_token), "SELECT 1").await;
        assert_eq!(status, StatusCode::OK, "request {i} should pass");
    }

    let (status, body) = h.execute(Some(&cred.secret_token), "SELECT 1").await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"]["code"], "RATE_LIMIT_EXCEEDED");
    let retry_after = body["error"]["retry_after"].as_u64().unwrap();
    assert!(retry_after >= 1 && retry_after <= 60);

    // The rejection is still counted against the credential.
    let stats = h.gateway.credentials().stats(&cred.id).unwrap();
    assert_eq!(stats.total_requests, rpm as u64 + 1);
    assert_eq!(stats.failed_requests, 1);
}

#[tokio::test]
async fn every_request_is_audited_exactly_once() {
    let h = harness();
    let cred = h.issue(Tier::ReadOnly, "inst-1");

    h.execute(Some(&cred.secret_token), "SELECT 1").await;
    h.execute(Some(&cred.secret_token), "DROP DATABASE x").await;
    h.execute(None, "SELECT 1").await;

    let lines = h.audit_lines();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0]["stage"], "completed");
    assert_eq!(lines[0]["success"], true);
    assert_eq!(lines[1]["stage"], "security");
    assert_eq!(lines[1]["violated_rule"], "critical_operation");
    assert_eq!(lines[1]["severity"], "CRITICAL");
    assert_eq!(lines[2]["stage"], "auth");
    assert_eq!(lines[2]["webhook_id"], Value::Null);
}

#[tokio::test]
async fn validate_reports_stage_results_without_executing() {
    let h = harness();
    let cred = h.issue(Tier::ReadOnly, "inst-1");

    let (status, body) = h
        .gateway
        .validate_query(
            "inst-1",
            h.meta(Some(&cred.secret_token)),
            ExecuteRequest {
                query: Some("SELECT id FROM orders".to_string()),
                transaction_id: None,
            },
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["validation"]["auth"], "passed");
    assert_eq!(body["validation"]["rate_limit"], "passed");
    assert_eq!(body["validation"]["security"], "passed");
    assert!(body["query_info"]["query_hash"].as_str().unwrap().len() == 64);

    let (status, body) = h
        .gateway
        .validate_query(
            "inst-1",
            h.meta(Some(&cred.secret_token)),
            ExecuteRequest {
                query: Some("DELETE FROM t".to_string()),
                transaction_id: None,
            },
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["validation"]["auth"], "passed");
    assert_eq!(body["validation"]["rate_limit"], "passed");
    assert_eq!(body["validation"]["security"], "failed");
    assert_eq!(body["error"]["code"], "SQL_SECURITY_VIOLATION");

    // Validation never touches the executor.
    assert!(h.executor.queries.lock().is_empty());
}

#[tokio::test]
async fn health_probe_round_trip() {
    let h = harness();
    let cred = h.issue(Tier::ReadOnly, "inst-1");

    let (status, body) = h
        .gateway
        .health("inst-1", h.meta(Some(&cred.secret_token)))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["connection_test"], "passed");
    assert_eq!(
        *h.executor.queries.lock(),
        vec!["SELECT 1 AS health_check".to_string()]
    );
}

#[tokio::test]
async fn health_reports_unknown_instance() {
    let h = harness();
    let cred = h.issue(Tier::ReadOnly, "inst-2");

    let (status, body) = h
        .gateway
        .health("inst-2", h.meta(Some(&cred.secret_token)))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], "instance_not_found");
}

#[tokio::test]
async fn stats_exposes_usage_and_effective_profiles() {
    let h = harness();
    let cred = h.issue(Tier::Developer, "inst-1");

    h.execute(Some(&cred.secret_token), "SELECT 1").await;
    h.execute(Some(&cred.secret_token), "TRUNCATE t").await;

    let (status, body) = h
        .gateway
        .stats("inst-1", h.meta(Some(&cred.secret_token)))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tier"], "developer");
    assert_eq!(body["stats"]["total_requests"], 2);
    assert_eq!(body["stats"]["successful_requests"], 1);
    assert_eq!(body["stats"]["failed_requests"], 1);
    assert_eq!(body["rate_limits"]["requests_per_minute"], 50);
    assert!(body["sql_restrictions"]["allowed_operations"]
        .as_array()
        .unwrap()
        .iter()
        .any(|op| op == "DELETE"));
}

#[tokio::test]
async fn executor_failure_surfaces_as_execution_error_and_is_audited() {
    let h = harness_with(FakeExecutor {
        queries: Mutex::new(Vec::new()),
        fail_with: Some("relation \"missing\" does not exist".to_string()),
    });
    let cred = h.issue(Tier::Standard, "inst-1");

    let (status, body) = h
        .execute(Some(&cred.secret_token), "SELECT * FROM missing")
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "SQL_EXECUTION_FAILED");

    let lines = h.audit_lines();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["stage"], "execution");
    assert_eq!(lines[0]["success"], false);

    let stats = h.gateway.credentials().stats(&cred.id).unwrap();
    assert_eq!(stats.failed_requests, 1);
    assert_eq!(stats.total_requests, 1);
}

#[tokio::test]
async fn unknown_instance_fails_execution_after_gates() {
    let h = harness();
    let cred = h.issue(Tier::Standard, "inst-9");
    let meta = RequestMeta {
        path: "/webhook/sql/inst-9".to_string(),
        ..h.meta(Some(&cred.secret_token))
    };

    let (status, body) = h
        .gateway
        .execute_query(
            "inst-9",
            meta,
            ExecuteRequest {
                query: Some("SELECT 1".to_string()),
                transaction_id: Some("txn-42".to_string()),
            },
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "SQL_EXECUTION_FAILED");
    assert_eq!(body["transaction_id"], "txn-42");
}

#[tokio::test]
async fn missing_query_is_a_distinct_error() {
    let h = harness();
    let cred = h.issue(Tier::Standard, "inst-1");

    let (status, body) = h
        .gateway
        .execute_query(
            "inst-1",
            h.meta(Some(&cred.secret_token)),
            ExecuteRequest::default(),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "SQL_QUERY_MISSING");
}
