//! Append-only audit sink. One record per gateway request, written after
//! the outcome is known, whether the request succeeded or was rejected.

use crate::security::Severity;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

const AUDIT_FILE: &str = "webhook-audit.jsonl";

/// Pipeline stage a request reached when its outcome was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Auth,
    Rate,
    Security,
    Execution,
    Completed,
}

#[derive(Debug, Serialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub webhook_id: Option<String>,
    pub user_id: Option<String>,
    pub instance_id: String,
    pub ip: String,
    pub user_agent: String,
    pub query_hash: String,
    pub query_preview: String,
    pub method: &'static str,
    pub path: String,
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub violated_rule: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    pub response_time_ms: u64,
    pub status_code: u16,
    pub success: bool,
}

pub struct AuditSink {
    file: Mutex<File>,
}

impl AuditSink {
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("creating data dir {}", data_dir.display()))?;
        let path = data_dir.join(AUDIT_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening audit log {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Append one record. Sink failures are logged, never propagated into
    /// the request path.
    pub fn record(&self, record: &AuditRecord) {
        tracing::info!(
            target: "audit",
            webhook_id = record.webhook_id.as_deref().unwrap_or("-"),
            instance_id = %record.instance_id,
            stage = ?record.stage,
            status = record.status_code,
            success = record.success,
            response_time_ms = record.response_time_ms,
            query_hash = %record.query_hash,
            "gateway request audited"
        );
        match serde_json::to_string(record) {
            Ok(line) => {
                let mut file = self.file.lock();
                if let Err(e) = writeln!(file, "{line}") {
                    tracing::warn!(error = %e, "failed to append audit record");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize audit record"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(stage: Stage, success: bool) -> AuditRecord {
        AuditRecord {
            timestamp: Utc::now(),
            webhook_id: Some("wh_test".into()),
            user_id: Some("user-1".into()),
            instance_id: "inst-1".into(),
            ip: "127.0.0.1".into(),
            user_agent: "tests".into(),
            query_hash: crate::security::query_hash("SELECT 1"),
            query_preview: "SELECT 1".into(),
            method: "POST",
            path: "/webhook/sql/inst-1".into(),
            stage,
            violated_rule: None,
            severity: None,
            response_time_ms: 3,
            status_code: if success { 200 } else { 400 },
            success,
        }
    }

    #[test]
    fn records_append_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let sink = AuditSink::open(dir.path()).unwrap();
        sink.record(&record(Stage::Completed, true));
        sink.record(&record(Stage::Security, false));

        let raw = std::fs::read_to_string(dir.path().join(AUDIT_FILE)).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["stage"], "completed");
        assert_eq!(first["success"], true);
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["stage"], "security");
        assert_eq!(second["status_code"], 400);
    }
}
