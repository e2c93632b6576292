//! Wire types for the gateway endpoints.

use crate::policy::Tier;
use serde::{Deserialize, Serialize};

/// Body of `POST /webhook/sql/{instance_id}` and its validate sibling.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecuteRequest {
    pub query: Option<String>,
    pub transaction_id: Option<String>,
}

/// Result of one executed statement batch, mirrored into the response as
/// `result`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOutput {
    pub command: String,
    pub row_count: u64,
    pub rows: Vec<serde_json::Value>,
    pub fields: Vec<FieldDesc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FieldDesc {
    pub name: String,
}

/// Body of `POST /admin/sql-webhooks`.
#[derive(Debug, Deserialize)]
pub struct IssueRequest {
    pub user_id: String,
    pub instance_id: String,
    pub tier: Tier,
    #[serde(default)]
    pub expiry_days: Option<i64>,
    #[serde(default)]
    pub ip_allowlist: Option<Vec<String>>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Body of `DELETE /admin/sql-webhooks/{id}`.
#[derive(Debug, Deserialize)]
pub struct RevokeRequest {
    pub user_id: String,
}
