use crate::audit::Stage;
use crate::security::Violation;
use axum::http::StatusCode;
use thiserror::Error;

/// Everything that can terminate a gateway request before a normal response.
///
/// Authentication variants are deliberately collapsed into one public
/// message; the precise cause only appears in logs and audit records.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("webhook token is required")]
    TokenMissing,
    #[error("instance id is required")]
    InstanceMissing,
    #[error("unknown webhook token")]
    CredentialNotFound,
    #[error("webhook is not active")]
    CredentialInactive,
    #[error("webhook has expired")]
    CredentialExpired,
    #[error("token is not valid for this instance")]
    InstanceMismatch,
    #[error("caller address is not on the webhook allowlist")]
    IpNotAllowed,
    #[error("not authorized to manage this webhook")]
    NotAuthorized,
    #[error("unknown webhook: {0}")]
    UnknownCredential(String),

    #[error("rate limit exceeded: requests per minute")]
    RateLimitExceeded { retry_after: u64 },
    #[error("daily quota exhausted")]
    QuotaExceeded,
    #[error("too many concurrent requests for this webhook")]
    ConcurrencyExceeded,

    #[error("sql query is required")]
    QueryMissing,
    #[error("{}", .0.reason)]
    SecurityViolation(Violation),

    #[error("instance not found: {0}")]
    InstanceNotFound(String),
    #[error("sql execution failed: {0}")]
    ExecutionFailed(String),
    #[error("timed out waiting for an isolated pool connection")]
    PoolTimeout,

    #[error("internal gateway error: {0}")]
    Internal(String),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    /// Machine-readable error code surfaced to callers.
    pub fn code(&self) -> &'static str {
        use GatewayError::*;
        match self {
            TokenMissing => "WEBHOOK_TOKEN_MISSING",
            InstanceMissing => "INSTANCE_ID_MISSING",
            CredentialNotFound | CredentialInactive | CredentialExpired | InstanceMismatch
            | IpNotAllowed | NotAuthorized | UnknownCredential(_) => "WEBHOOK_AUTH_FAILED",
            RateLimitExceeded { .. } | QuotaExceeded | ConcurrencyExceeded => {
                "RATE_LIMIT_EXCEEDED"
            }
            QueryMissing => "SQL_QUERY_MISSING",
            SecurityViolation(_) => "SQL_SECURITY_VIOLATION",
            InstanceNotFound(_) | ExecutionFailed(_) | PoolTimeout => "SQL_EXECUTION_FAILED",
            Internal(_) => "WEBHOOK_INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        use GatewayError::*;
        match self {
            TokenMissing | CredentialNotFound | CredentialInactive | CredentialExpired
            | InstanceMismatch | IpNotAllowed => StatusCode::UNAUTHORIZED,
            NotAuthorized => StatusCode::FORBIDDEN,
            InstanceMissing | QueryMissing | SecurityViolation(_) | ExecutionFailed(_)
            | InstanceNotFound(_) | UnknownCredential(_) => StatusCode::BAD_REQUEST,
            RateLimitExceeded { .. } | QuotaExceeded | ConcurrencyExceeded => {
                StatusCode::TOO_MANY_REQUESTS
            }
            PoolTimeout | Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to echo back to the caller. Authentication failures all
    /// read the same so the failing check is not disclosed.
    pub fn public_message(&self) -> String {
        use GatewayError::*;
        match self {
            CredentialNotFound | CredentialInactive | CredentialExpired | InstanceMismatch
            | IpNotAllowed => "webhook authentication failed".to_string(),
            other => other.to_string(),
        }
    }

    /// Pipeline stage this error terminates.
    pub fn stage(&self) -> Stage {
        use GatewayError::*;
        match self {
            TokenMissing | InstanceMissing | CredentialNotFound | CredentialInactive
            | CredentialExpired | InstanceMismatch | IpNotAllowed | NotAuthorized
            | UnknownCredential(_) => Stage::Auth,
            RateLimitExceeded { .. } | QuotaExceeded | ConcurrencyExceeded => Stage::Rate,
            QueryMissing | SecurityViolation(_) => Stage::Security,
            InstanceNotFound(_) | ExecutionFailed(_) | PoolTimeout => Stage::Execution,
            Internal(_) => Stage::Execution,
        }
    }

    pub fn retry_after(&self) -> Option<u64> {
        match self {
            GatewayError::RateLimitExceeded { retry_after } => Some(*retry_after),
            GatewayError::QuotaExceeded => Some(3600),
            GatewayError::ConcurrencyExceeded => Some(1),
            _ => None,
        }
    }
}
