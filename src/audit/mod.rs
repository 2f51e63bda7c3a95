//! Audit trail
//!
//! One entry per terminal request transition, signed or refused. Entries
//! carry the decision metadata needed for review and never any key
//! material, password or shared secret.

use crate::api::auth::AuthTier;
use crate::errors::{ProxyError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use tracing::info;
use uuid::Uuid;

/// Terminal state of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// A signature was produced
    Signed,
    /// A non-signing operation succeeded
    Completed,
    Refused,
}

/// Why a request was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefusalKind {
    AuthFailure,
    PolicyDenial,
    Error,
}

impl RefusalKind {
    pub fn classify(err: &ProxyError) -> Self {
        if err.is_policy_denial() {
            RefusalKind::PolicyDenial
        } else if err.is_auth_failure() {
            RefusalKind::AuthFailure
        } else {
            RefusalKind::Error
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// Request method, uppercased
    pub method: String,
    /// Operation name, e.g. `sign_transaction`
    pub operation: String,
    pub path: String,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refusal: Option<RefusalKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<AuthTier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet: Option<String>,
    /// Stable error tag of a refusal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,
}

impl AuditEntry {
    pub fn new(method: &str, operation: &str, path: &str, outcome: Outcome) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            method: method.to_ascii_uppercase(),
            operation: operation.to_string(),
            path: path.to_string(),
            outcome,
            refusal: None,
            tier: None,
            origin: None,
            wallet: None,
            error: None,
            reason: None,
            rule: None,
            policy_id: None,
        }
    }

    /// Refusal entry; policy denials keep their deciding rule and policy
    pub fn refused(method: &str, operation: &str, path: &str, err: &ProxyError) -> Self {
        let mut entry = Self::new(method, operation, path, Outcome::Refused);
        entry.refusal = Some(RefusalKind::classify(err));
        entry.error = Some(err.tag().to_string());
        entry.reason = Some(err.to_string());
        if let ProxyError::PolicyDenied {
            rule, policy_id, ..
        } = err
        {
            entry.rule = rule.clone();
            entry.policy_id = policy_id.clone();
        }
        entry
    }

    pub fn with_tier(mut self, tier: Option<AuthTier>) -> Self {
        self.tier = tier;
        self
    }

    pub fn with_origin(mut self, origin: Option<&str>) -> Self {
        self.origin = origin.map(str::to_string);
        self
    }

    pub fn with_wallet(mut self, wallet: Option<&str>) -> Self {
        self.wallet = wallet.map(str::to_string);
        self
    }

    /// Allowing rule and policy of a signed request
    pub fn with_decision(mut self, rule: Option<&str>, policy_id: Option<&str>) -> Self {
        self.rule = rule.map(str::to_string);
        self.policy_id = policy_id.map(str::to_string);
        self
    }
}

/// Destination for audit entries
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: &AuditEntry) -> Result<()>;
}

/// Emits the entry as a `tracing` event on target `audit`
pub(crate) fn trace_entry(entry: &AuditEntry) {
    info!(
        target: "audit",
        id = %entry.id,
        method = %entry.method,
        operation = %entry.operation,
        outcome = ?entry.outcome,
        refusal = ?entry.refusal,
        error = entry.error.as_deref().unwrap_or(""),
        rule = entry.rule.as_deref().unwrap_or(""),
        policy_id = entry.policy_id.as_deref().unwrap_or(""),
        wallet = entry.wallet.as_deref().unwrap_or(""),
        "request {:?}",
        entry.outcome
    );
}

/// Keeps entries in memory
#[derive(Default)]
pub struct MemoryAuditLog {
    entries: RwLock<Vec<AuditEntry>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .read()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditSink for MemoryAuditLog {
    fn record(&self, entry: &AuditEntry) -> Result<()> {
        self.entries
            .write()
            .map_err(|_| ProxyError::InternalError("audit log lock poisoned".to_string()))?
            .push(entry.clone());
        Ok(())
    }
}

/// Append-only JSON lines file, one entry per line
pub struct JsonlAuditLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonlAuditLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let file = options.open(&path)?;

        info!("Audit log at {:?}", path);
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonlAuditLog {
    fn record(&self, entry: &AuditEntry) -> Result<()> {
        let line = serde_json::to_string(entry)?;
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| ProxyError::InternalError("audit log lock poisoned".to_string()))?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_denial_entry_keeps_decision() {
        let err = ProxyError::PolicyDenied {
            reason: "value too large".to_string(),
            rule: Some("cap".to_string()),
            policy_id: Some("p1".to_string()),
        };
        let entry = AuditEntry::refused("POST", "sign_transaction", "/sign-transaction", &err);
        assert_eq!(entry.outcome, Outcome::Refused);
        assert_eq!(entry.refusal, Some(RefusalKind::PolicyDenial));
        assert_eq!(entry.error.as_deref(), Some("policy_denied"));
        assert_eq!(entry.rule.as_deref(), Some("cap"));
        assert_eq!(entry.policy_id.as_deref(), Some("p1"));
    }

    #[test]
    fn test_classification() {
        assert_eq!(
            RefusalKind::classify(&ProxyError::ReplayRejected { skew_ms: 40_000 }),
            RefusalKind::AuthFailure
        );
        assert_eq!(
            RefusalKind::classify(&ProxyError::ApprovalTimedOut),
            RefusalKind::PolicyDenial
        );
        assert_eq!(
            RefusalKind::classify(&ProxyError::NoWalletFound),
            RefusalKind::Error
        );
        assert_eq!(
            RefusalKind::classify(&ProxyError::InvalidRequest("unknown route".to_string())),
            RefusalKind::Error
        );
    }

    #[test]
    fn test_memory_log() {
        let log = MemoryAuditLog::new();
        assert!(log.is_empty());
        log.record(&AuditEntry::new("POST", "sign_message", "/sign-message", Outcome::Signed))
            .unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log.entries()[0].outcome, Outcome::Signed);
    }

    #[test]
    fn test_jsonl_appends_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit/log.jsonl");

        let log = JsonlAuditLog::open(&path).unwrap();
        log.record(&AuditEntry::new("POST", "sign_message", "/sign-message", Outcome::Signed))
            .unwrap();
        log.record(&AuditEntry::refused(
            "post",
            "sign_message",
            "/sign-message",
            &ProxyError::MissingAuthHeaders,
        ))
        .unwrap();
        drop(log);

        // reopening appends
        let log = JsonlAuditLog::open(&path).unwrap();
        log.record(&AuditEntry::new("GET", "get_address", "/get-address", Outcome::Completed))
            .unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let entries: Vec<AuditEntry> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].refusal, Some(RefusalKind::AuthFailure));
        assert_eq!(entries[1].method, "POST");
        assert_eq!(entries[2].method, "GET");
        assert_eq!(entries[2].operation, "get_address");
    }
}
