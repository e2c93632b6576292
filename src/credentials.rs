//! Durable store of issued webhook credentials: issuance, validation,
//! revocation, usage counters and the atomic rate-limit reservation.
//!
//! Credentials are never deleted, only status-flipped; the record keeps its
//! audit value after revocation or expiry.

use crate::error::{GatewayError, GatewayResult};
use crate::policy::{RateProfile, Tier};
use crate::ratelimit::{day_key, minute_epoch, retention_cutoff, seconds_to_next_minute};
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use subtle::ConstantTimeEq;
use uuid::Uuid;

const CREDENTIALS_FILE: &str = "sql-webhooks.json";
const DEFAULT_EXPIRY_DAYS: i64 = 365;
const REDACTED: &str = "<redacted>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    Active,
    Expired,
    Revoked,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DayBucket {
    pub requests: u64,
    #[serde(default)]
    pub by_minute: BTreeMap<i64, u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub daily_usage: BTreeMap<String, DayBucket>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    pub secret_token: String,
    pub owner_user_id: String,
    pub target_instance_id: String,
    pub tier: Tier,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
    pub status: CredentialStatus,
    #[serde(default)]
    pub ip_allowlist: Vec<String>,
    #[serde(default)]
    pub usage: UsageStats,
}

impl Credential {
    /// Copy safe to hand back from listings: the secret never leaves the
    /// store after issuance.
    pub fn redacted(&self) -> Credential {
        let mut copy = self.clone();
        copy.secret_token = REDACTED.to_string();
        copy
    }
}

/// Issuance options beyond the owner/instance/tier triple.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IssueOptions {
    pub expiry_days: Option<i64>,
    pub ip_allowlist: Option<Vec<String>>,
    pub name: Option<String>,
}

/// Usage snapshot returned by the stats endpoint.
#[derive(Debug, Serialize)]
pub struct UsageSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub success_rate: f64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub daily_usage: BTreeMap<String, DayBucket>,
}

pub struct CredentialStore {
    path: PathBuf,
    inner: RwLock<HashMap<String, Credential>>,
}

fn token_digest(token: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().into()
}

fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    format!("whsql_{}", hex::encode(bytes))
}

impl CredentialStore {
    /// Open the store, loading any previously issued credentials from the
    /// data directory.
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join(CREDENTIALS_FILE);
        let mut map = HashMap::new();
        if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let items: Vec<Credential> = serde_json::from_str(&raw)?;
            for cred in items {
                map.insert(cred.id.clone(), cred);
            }
        }
        tracing::info!(count = map.len(), "credential store loaded");
        Ok(Self {
            path,
            inner: RwLock::new(map),
        })
    }

    fn flush(&self, map: &HashMap<String, Credential>) {
        let mut items: Vec<&Credential> = map.values().collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        match serde_json::to_string_pretty(&items) {
            Ok(raw) => {
                if let Err(e) = std::fs::write(&self.path, raw) {
                    tracing::warn!(error = %e, "failed to persist credential store");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize credential store"),
        }
    }

    /// Issue a new credential. The returned record includes the secret;
    /// this is the only time it is shown.
    pub fn issue(
        &self,
        owner_user_id: &str,
        target_instance_id: &str,
        tier: Tier,
        options: IssueOptions,
    ) -> Credential {
        let now = Utc::now();
        let id = format!("wh_{}", &Uuid::new_v4().simple().to_string()[..12]);
        let credential = Credential {
            id: id.clone(),
            secret_token: generate_token(),
            owner_user_id: owner_user_id.to_string(),
            target_instance_id: target_instance_id.to_string(),
            tier,
            name: options
                .name
                .unwrap_or_else(|| format!("SQL webhook {target_instance_id}")),
            created_at: now,
            expires_at: now + Duration::days(options.expiry_days.unwrap_or(DEFAULT_EXPIRY_DAYS)),
            revoked_at: None,
            status: CredentialStatus::Active,
            ip_allowlist: options.ip_allowlist.unwrap_or_default(),
            usage: UsageStats::default(),
        };

        let mut map = self.inner.write();
        map.insert(id.clone(), credential.clone());
        self.flush(&map);
        tracing::info!(webhook_id = %id, instance_id = %target_instance_id, tier = tier.as_str(), "webhook credential issued");
        credential
    }

    /// Resolve a token to its credential and verify it may act on the given
    /// instance from the given address. Expiry flips status as a side
    /// effect, idempotently.
    pub fn validate(
        &self,
        token: &str,
        instance_id: &str,
        peer_ip: &str,
    ) -> GatewayResult<Credential> {
        let wanted = token_digest(token);
        let mut map = self.inner.write();

        // Scan the full table with constant-time digest comparison so the
        // timing of a miss does not depend on where a near-match lives.
        let mut found: Option<String> = None;
        for (id, cred) in map.iter() {
            let digest = token_digest(&cred.secret_token);
            let matches: bool = digest[..].ct_eq(&wanted[..]).into();
            if matches {
                found = Some(id.clone());
            }
        }
        let id = found.ok_or(GatewayError::CredentialNotFound)?;
        let cred = map.get_mut(&id).ok_or(GatewayError::CredentialNotFound)?;

        if cred.status == CredentialStatus::Revoked {
            return Err(GatewayError::CredentialInactive);
        }
        if cred.status == CredentialStatus::Expired || Utc::now() > cred.expires_at {
            if cred.status != CredentialStatus::Expired {
                cred.status = CredentialStatus::Expired;
                self.flush(&map);
            }
            return Err(GatewayError::CredentialExpired);
        }
        if cred.target_instance_id != instance_id {
            return Err(GatewayError::InstanceMismatch);
        }
        if !cred.ip_allowlist.is_empty() && !cred.ip_allowlist.iter().any(|ip| ip == peer_ip) {
            return Err(GatewayError::IpNotAllowed);
        }
        Ok(cred.clone())
    }

    /// Flip a credential to revoked. Only the owner may revoke; repeated
    /// calls are a no-op, not an error.
    pub fn revoke(&self, id: &str, owner_user_id: &str) -> GatewayResult<Credential> {
        let mut map = self.inner.write();
        let cred = map
            .get_mut(id)
            .ok_or_else(|| GatewayError::UnknownCredential(id.to_string()))?;
        if cred.owner_user_id != owner_user_id {
            return Err(GatewayError::NotAuthorized);
        }
        if cred.status != CredentialStatus::Revoked {
            cred.status = CredentialStatus::Revoked;
            cred.revoked_at = Some(Utc::now());
            let snapshot = cred.redacted();
            self.flush(&map);
            tracing::info!(webhook_id = %id, "webhook credential revoked");
            return Ok(snapshot);
        }
        Ok(cred.redacted())
    }

    /// All credentials for an owner, secrets redacted.
    pub fn list(&self, owner_user_id: &str) -> Vec<Credential> {
        let map = self.inner.read();
        let mut items: Vec<Credential> = map
            .values()
            .filter(|c| c.owner_user_id == owner_user_id)
            .map(Credential::redacted)
            .collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        items
    }

    /// Single atomic check-and-increment against the minute and day
    /// windows. A pass reserves the slot immediately; there is no separate
    /// re-check before execution.
    pub fn check_and_reserve(&self, id: &str, profile: &RateProfile) -> GatewayResult<()> {
        self.check_and_reserve_at(id, profile, Utc::now())
    }

    fn check_and_reserve_at(
        &self,
        id: &str,
        profile: &RateProfile,
        now: DateTime<Utc>,
    ) -> GatewayResult<()> {
        let mut map = self.inner.write();
        let cred = map
            .get_mut(id)
            .ok_or_else(|| GatewayError::UnknownCredential(id.to_string()))?;

        let cutoff = retention_cutoff(now);
        cred.usage.daily_usage.retain(|day, _| day.as_str() >= cutoff.as_str());

        let bucket = cred.usage.daily_usage.entry(day_key(now)).or_default();
        let minute = minute_epoch(now);
        let in_minute = bucket.by_minute.get(&minute).copied().unwrap_or(0);
        if in_minute >= profile.requests_per_minute as u64 {
            return Err(GatewayError::RateLimitExceeded {
                retry_after: seconds_to_next_minute(now),
            });
        }
        if bucket.requests >= profile.daily_quota as u64 {
            return Err(GatewayError::QuotaExceeded);
        }

        *bucket.by_minute.entry(minute).or_insert(0) += 1;
        bucket.requests += 1;
        cred.usage.total_requests += 1;
        self.flush(&map);
        Ok(())
    }

    /// Record the outcome of a request that passed the rate gate.
    pub fn record_outcome(&self, id: &str, success: bool) {
        let mut map = self.inner.write();
        if let Some(cred) = map.get_mut(id) {
            if success {
                cred.usage.successful_requests += 1;
            } else {
                cred.usage.failed_requests += 1;
            }
            cred.usage.last_used_at = Some(Utc::now());
            self.flush(&map);
        }
    }

    /// Record a request rejected before it reserved window budget (rate
    /// rejections): counted for traceability, no bucket consumed.
    pub fn record_rejected(&self, id: &str) {
        let mut map = self.inner.write();
        if let Some(cred) = map.get_mut(id) {
            cred.usage.total_requests += 1;
            cred.usage.failed_requests += 1;
            self.flush(&map);
        }
    }

    pub fn stats(&self, id: &str) -> Option<UsageSnapshot> {
        let map = self.inner.read();
        let cred = map.get(id)?;
        let usage = &cred.usage;
        let success_rate = if usage.total_requests > 0 {
            usage.successful_requests as f64 / usage.total_requests as f64 * 100.0
        } else {
            0.0
        };
        Some(UsageSnapshot {
            total_requests: usage.total_requests,
            successful_requests: usage.successful_requests,
            failed_requests: usage.failed_requests,
            success_rate,
            last_used_at: usage.last_used_at,
            daily_usage: usage.daily_usage.clone(),
        })
    }

    /// Final save on shutdown.
    pub fn close(&self) {
        let map = self.inner.read();
        self.flush(&map);
    }

    #[cfg(test)]
    fn set_expires_at(&self, id: &str, when: DateTime<Utc>) {
        let mut map = self.inner.write();
        if let Some(cred) = map.get_mut(id) {
            cred.expires_at = when;
        }
    }
}

/// Shareable execution URL for an issued credential.
pub fn webhook_url(base_url: &str, instance_id: &str, token: &str) -> String {
    format!(
        "{}/webhook/sql/{instance_id}?token={token}",
        base_url.trim_end_matches('/')
    )
}
