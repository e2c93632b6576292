use serde::{Deserialize, Serialize};

/// Permission tier attached to a webhook credential. Determines both the
/// rate-limit profile and the SQL restriction profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    ReadOnly,
    Standard,
    Developer,
    Admin,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::ReadOnly => "read_only",
            Tier::Standard => "standard",
            Tier::Developer => "developer",
            Tier::Admin => "admin",
        }
    }

    pub fn rate_profile(&self) -> RateProfile {
        match self {
            Tier::ReadOnly => RateProfile {
                requests_per_minute: 20,
                daily_quota: 500,
                max_concurrent: 2,
                max_query_size: 4096,
            },
            Tier::Standard => RateProfile {
                requests_per_minute: 30,
                daily_quota: 1000,
                max_concurrent: 3,
                max_query_size: 8192,
            },
            Tier::Developer => RateProfile {
                requests_per_minute: 50,
                daily_quota: 2000,
                max_concurrent: 5,
                max_query_size: 16384,
            },
            Tier::Admin => RateProfile {
                requests_per_minute: 100,
                daily_quota: 5000,
                max_concurrent: 10,
                max_query_size: 32768,
            },
        }
    }

    pub fn restriction_profile(&self) -> RestrictionProfile {
        match self {
            Tier::ReadOnly => RestrictionProfile {
                allowed_operations: &["SELECT"],
                blocked_patterns: &[
                    "DROP", "DELETE", "UPDATE", "INSERT", "CREATE", "ALTER", "TRUNCATE",
                ],
                allowed_schemas: &["public"],
                blocked_tables: &["auth.*", "storage.*", "realtime.*"],
                max_query_size: 4096,
            },
            Tier::Standard => RestrictionProfile {
                allowed_operations: &["SELECT", "INSERT", "UPDATE"],
                blocked_patterns: &[
                    "DROP DATABASE",
                    "DROP SCHEMA",
                    "DELETE FROM auth",
                    "TRUNCATE auth",
                    "ALTER SYSTEM",
                ],
                allowed_schemas: &["public"],
                blocked_tables: &[
                    "auth.users",
                    "auth.refresh_tokens",
                    "storage.*",
                    "realtime.*",
                ],
                max_query_size: 8192,
            },
            Tier::Developer => RestrictionProfile {
                allowed_operations: &[
                    "SELECT",
                    "INSERT",
                    "UPDATE",
                    "DELETE",
                    "CREATE TABLE",
                    "ALTER TABLE",
                ],
                blocked_patterns: &[
                    "DROP DATABASE",
                    "DROP SCHEMA",
                    "DELETE FROM auth",
                    "ALTER SYSTEM",
                    "CREATE EXTENSION",
                ],
                allowed_schemas: &["public"],
                blocked_tables: &["auth.users", "auth.refresh_tokens"],
                max_query_size: 16384,
            },
            Tier::Admin => RestrictionProfile {
                allowed_operations: &["*"],
                blocked_patterns: &["ALTER SYSTEM", "pg_terminate_backend"],
                allowed_schemas: &["public", "custom"],
                blocked_tables: &[],
                max_query_size: 32768,
            },
        }
    }
}

/// Throttling limits in force for one tier.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RateProfile {
    pub requests_per_minute: u32,
    pub daily_quota: u32,
    pub max_concurrent: u32,
    pub max_query_size: usize,
}

/// SQL-level rules in force for one tier. Derived from the tier on every
/// request, never persisted per credential.
#[derive(Debug, Clone, Serialize)]
pub struct RestrictionProfile {
    pub allowed_operations: &'static [&'static str],
    pub blocked_patterns: &'static [&'static str],
    pub allowed_schemas: &'static [&'static str],
    pub blocked_tables: &'static [&'static str],
    pub max_query_size: usize,
}

impl RestrictionProfile {
    pub fn allows_operation(&self, op: &str) -> bool {
        self.allowed_operations.contains(&"*") || self.allowed_operations.contains(&op)
    }
}
