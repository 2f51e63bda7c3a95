//! Error types for keyring-proxy

use serde::Serialize;
use thiserror::Error;

/// Header carrying the request timestamp (milliseconds since epoch)
pub const TIMESTAMP_HEADER: &str = "x-keyring-timestamp";

/// Header carrying the lowercase hex HMAC-SHA256 request signature
pub const SIGNATURE_HEADER: &str = "x-keyring-signature";

/// Main error type for keyring-proxy operations
#[derive(Error, Debug)]
pub enum ProxyError {
    // Keystore errors
    #[error("Invalid password or corrupted keystore")]
    InvalidPassword,

    #[error("Unsupported keystore format: {0}")]
    UnsupportedFormat(String),

    // Authentication errors
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Request timestamp outside the replay window (skew {skew_ms} ms)")]
    ReplayRejected { skew_ms: i64 },

    #[error("Missing authentication headers")]
    MissingAuthHeaders,

    #[error("Administrative credentials required")]
    AdminRequired,

    // Policy errors
    #[error("Policy denied: {reason}")]
    PolicyDenied {
        reason: String,
        rule: Option<String>,
        policy_id: Option<String>,
    },

    #[error("Policy not found: {0}")]
    PolicyNotFound(String),

    #[error("External approval rejected the request")]
    ApprovalRejected,

    #[error("External approval timed out")]
    ApprovalTimedOut,

    // Wallet errors
    #[error("No wallet has been provisioned")]
    NoWalletFound,

    #[error("A wallet already exists")]
    WalletExists,

    // Request errors
    #[error("Call data decode failed: {0}")]
    DecodeFailed(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // Cryptographic errors
    #[error("Signing failed: {0}")]
    SigningFailed(String),

    // Storage errors
    #[error("Storage error: {0}")]
    StorageError(String),

    // Security errors
    #[error("Memory lock failed: {0}")]
    MemoryLockFailed(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Internal errors
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl ProxyError {
    /// Stable machine-readable tag exposed to callers
    pub fn tag(&self) -> &'static str {
        match self {
            ProxyError::InvalidPassword => "invalid_password",
            ProxyError::UnsupportedFormat(_) => "unsupported_format",
            ProxyError::AuthFailed(_) => "auth_failed",
            ProxyError::ReplayRejected { .. } => "replay_rejected",
            ProxyError::MissingAuthHeaders => "missing_auth_headers",
            ProxyError::AdminRequired => "admin_required",
            ProxyError::PolicyDenied { .. } => "policy_denied",
            ProxyError::PolicyNotFound(_) => "policy_not_found",
            ProxyError::ApprovalRejected => "approval_rejected",
            ProxyError::ApprovalTimedOut => "approval_timeout",
            ProxyError::NoWalletFound => "no_wallet_found",
            ProxyError::WalletExists => "wallet_exists",
            ProxyError::DecodeFailed(_) => "decode_failed",
            ProxyError::InvalidRequest(_) => "invalid_request",
            ProxyError::SigningFailed(_) => "signing_failed",
            ProxyError::StorageError(_) => "storage_error",
            ProxyError::MemoryLockFailed(_) => "memory_lock_failed",
            ProxyError::ConfigError(_) => "config_error",
            ProxyError::InternalError(_) => "internal_error",
        }
    }

    /// HTTP-style status code for transports layered on top of the proxy
    pub fn status_code(&self) -> u16 {
        match self {
            ProxyError::AuthFailed(_)
            | ProxyError::ReplayRejected { .. }
            | ProxyError::MissingAuthHeaders => 401,
            ProxyError::AdminRequired
            | ProxyError::PolicyDenied { .. }
            | ProxyError::ApprovalRejected
            | ProxyError::ApprovalTimedOut => 403,
            ProxyError::NoWalletFound | ProxyError::PolicyNotFound(_) => 404,
            ProxyError::WalletExists => 409,
            ProxyError::InvalidRequest(_) | ProxyError::DecodeFailed(_) => 400,
            _ => 500,
        }
    }

    /// True when the caller failed authentication or lacks the required tier
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            ProxyError::AuthFailed(_)
                | ProxyError::ReplayRejected { .. }
                | ProxyError::MissingAuthHeaders
                | ProxyError::AdminRequired
        )
    }

    /// True for refusals decided by policy or by the external approval gate
    pub fn is_policy_denial(&self) -> bool {
        matches!(
            self,
            ProxyError::PolicyDenied { .. }
                | ProxyError::ApprovalRejected
                | ProxyError::ApprovalTimedOut
        )
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::StorageError(err.to_string())
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(err: serde_json::Error) -> Self {
        ProxyError::StorageError(format!("JSON error: {}", err))
    }
}

impl From<hex::FromHexError> for ProxyError {
    fn from(err: hex::FromHexError) -> Self {
        ProxyError::InvalidRequest(format!("Hex decode error: {}", err))
    }
}

/// Boundary representation of a failed request.
///
/// Carries the stable tag, a reason and, for policy denials, the deciding
/// rule and policy. Internal failures only expose a generic reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Refusal {
    pub error: String,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip)]
    pub status: u16,
}

impl From<&ProxyError> for Refusal {
    fn from(err: &ProxyError) -> Self {
        let (reason, rule, policy_id) = match err {
            ProxyError::PolicyDenied {
                reason,
                rule,
                policy_id,
            } => (reason.clone(), rule.clone(), policy_id.clone()),
            ProxyError::StorageError(_)
            | ProxyError::SigningFailed(_)
            | ProxyError::MemoryLockFailed(_)
            | ProxyError::ConfigError(_)
            | ProxyError::InternalError(_) => {
                ("internal failure while handling the request".to_string(), None, None)
            }
            other => (other.to_string(), None, None),
        };

        let hint = match err {
            ProxyError::MissingAuthHeaders => Some(format!(
                "send {} (milliseconds since epoch) and {} (lowercase hex HMAC-SHA256 of \
                 METHOD\\nPATH\\nTIMESTAMP\\nBODY)",
                TIMESTAMP_HEADER, SIGNATURE_HEADER
            )),
            _ => None,
        };

        Refusal {
            error: err.tag().to_string(),
            reason,
            rule,
            policy_id,
            hint,
            status: err.status_code(),
        }
    }
}

impl From<ProxyError> for Refusal {
    fn from(err: ProxyError) -> Self {
        Refusal::from(&err)
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
