//! Inbound request envelope and operation decoding
//!
//! Transport-agnostic: whatever front end receives a call hands over the
//! method, path, raw body, the two auth headers and the approval verdict.
//! The raw body is kept untouched because it is part of the signed payload.

use crate::errors::{ProxyError, Result};
use crate::policy::{PolicyDraft, SigningMethod};
use crate::signer::{Quantity, TransactionRequest};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

/// Verdict of the external approval gateway, decided before the call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Approval {
    #[default]
    NotRequired,
    Approved,
    Rejected,
    TimedOut,
}

impl Approval {
    /// Refuse when the gateway said no or never answered
    pub fn check(self) -> Result<()> {
        match self {
            Approval::NotRequired | Approval::Approved => Ok(()),
            Approval::Rejected => Err(ProxyError::ApprovalRejected),
            Approval::TimedOut => Err(ProxyError::ApprovalTimedOut),
        }
    }
}

/// One call as received by the transport
#[derive(Debug, Clone, Default)]
pub struct InboundRequest {
    pub method: String,
    pub path: String,
    pub body: Vec<u8>,
    pub timestamp: Option<String>,
    pub signature: Option<String>,
    /// Caller identity for the audit trail, e.g. a peer address
    pub origin: Option<String>,
    pub approval: Approval,
}

impl InboundRequest {
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            ..Default::default()
        }
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_json(self, body: &Value) -> Self {
        self.with_body(body.to_string())
    }

    pub fn with_auth(mut self, timestamp: impl Into<String>, signature: impl Into<String>) -> Self {
        self.timestamp = Some(timestamp.into());
        self.signature = Some(signature.into());
        self
    }

    pub fn with_origin(mut self, origin: &str) -> Self {
        self.origin = Some(origin.to_string());
        self
    }

    pub fn with_approval(mut self, approval: Approval) -> Self {
        self.approval = approval;
        self
    }
}

#[derive(Deserialize)]
struct SignMessageBody {
    message: String,
}

#[derive(Deserialize)]
struct SignTransactionBody {
    #[serde(alias = "transaction")]
    tx: TransactionRequest,
    #[serde(default)]
    abi: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignAuthorizationBody {
    #[serde(alias = "contractAddress")]
    address: String,
    #[serde(default, alias = "chain_id")]
    chain_id: Option<Quantity>,
    #[serde(default)]
    nonce: Option<Quantity>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttachBody {
    #[serde(alias = "policy_id")]
    policy_id: String,
}

/// A decoded call
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Health,
    CreateWallet,
    HasWallet,
    GetAddress,
    SignMessage {
        message: String,
    },
    SignTransaction {
        tx: TransactionRequest,
        abi: Option<Value>,
    },
    SignAuthorization {
        address: String,
        chain_id: Option<Quantity>,
        nonce: Option<Quantity>,
    },
    ListPolicies,
    CreatePolicy(PolicyDraft),
    GetPolicy(String),
    UpdatePolicy {
        id: String,
        draft: PolicyDraft,
    },
    DeletePolicy(String),
    ListBindings(String),
    AttachPolicy {
        wallet: String,
        policy_id: String,
    },
    DetachPolicy {
        wallet: String,
        policy_id: String,
    },
}

impl Operation {
    /// Resolve `(method, path)` and parse the body it expects
    pub fn decode(method: &str, path: &str, body: &[u8]) -> Result<Self> {
        let method = method.to_ascii_uppercase();
        let path = path.split('?').next().unwrap_or_default();
        let path = path.trim_end_matches('/');
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        let op = match (method.as_str(), segments.as_slice()) {
            ("GET", ["health"]) => Operation::Health,
            ("POST", ["create-wallet"]) => Operation::CreateWallet,
            ("GET", ["has-wallet"]) => Operation::HasWallet,
            ("GET", ["get-address"]) => Operation::GetAddress,
            ("POST", ["sign-message"]) => {
                let body: SignMessageBody = parse_body(body)?;
                Operation::SignMessage {
                    message: body.message,
                }
            }
            ("POST", ["sign-transaction"]) => {
                let body: SignTransactionBody = parse_body(body)?;
                Operation::SignTransaction {
                    tx: body.tx,
                    abi: body.abi.filter(|abi| !abi.is_null()),
                }
            }
            ("POST", ["sign-authorization"]) => {
                let body: SignAuthorizationBody = parse_body(body)?;
                Operation::SignAuthorization {
                    address: body.address,
                    chain_id: body.chain_id,
                    nonce: body.nonce,
                }
            }
            ("GET", ["policies"]) => Operation::ListPolicies,
            ("POST", ["policies"]) => Operation::CreatePolicy(parse_body(body)?),
            ("GET", ["policies", id]) => Operation::GetPolicy(id.to_string()),
            ("PUT", ["policies", id]) => Operation::UpdatePolicy {
                id: id.to_string(),
                draft: parse_body(body)?,
            },
            ("DELETE", ["policies", id]) => Operation::DeletePolicy(id.to_string()),
            ("GET", ["wallets", wallet, "policies"]) => Operation::ListBindings(wallet.to_string()),
            ("POST", ["wallets", wallet, "policies"]) => {
                let body: AttachBody = parse_body(body)?;
                Operation::AttachPolicy {
                    wallet: wallet.to_string(),
                    policy_id: body.policy_id,
                }
            }
            ("DELETE", ["wallets", wallet, "policies", policy_id]) => Operation::DetachPolicy {
                wallet: wallet.to_string(),
                policy_id: policy_id.to_string(),
            },
            _ => {
                return Err(ProxyError::InvalidRequest(format!(
                    "unknown operation {} {}",
                    method, path
                )))
            }
        };

        Ok(op)
    }

    /// Name used in logs and audit entries
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Health => "health",
            Operation::CreateWallet => "create_wallet",
            Operation::HasWallet => "has_wallet",
            Operation::GetAddress => "get_address",
            Operation::SignMessage { .. } => "sign_message",
            Operation::SignTransaction { .. } => "sign_transaction",
            Operation::SignAuthorization { .. } => "sign_authorization",
            Operation::ListPolicies => "list_policies",
            Operation::CreatePolicy(_) => "create_policy",
            Operation::GetPolicy(_) => "get_policy",
            Operation::UpdatePolicy { .. } => "update_policy",
            Operation::DeletePolicy(_) => "delete_policy",
            Operation::ListBindings(_) => "list_bindings",
            Operation::AttachPolicy { .. } => "attach_policy",
            Operation::DetachPolicy { .. } => "detach_policy",
        }
    }

    /// Signing method evaluated by policy, if any
    pub fn signing_method(&self) -> Option<SigningMethod> {
        match self {
            Operation::SignMessage { .. } => Some(SigningMethod::SignMessage),
            Operation::SignTransaction { .. } => Some(SigningMethod::SignTransaction),
            Operation::SignAuthorization { .. } => Some(SigningMethod::SignAuthorization),
            _ => None,
        }
    }

    /// Policy administration
    pub fn is_admin(&self) -> bool {
        matches!(
            self,
            Operation::ListPolicies
                | Operation::CreatePolicy(_)
                | Operation::GetPolicy(_)
                | Operation::UpdatePolicy { .. }
                | Operation::DeletePolicy(_)
                | Operation::ListBindings(_)
                | Operation::AttachPolicy { .. }
                | Operation::DetachPolicy { .. }
        )
    }
}

/// Best-effort operation name for requests that fail to decode
pub fn operation_name(path: &str) -> String {
    path.split('?')
        .next()
        .unwrap_or_default()
        .trim_matches('/')
        .replace('-', "_")
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    if body.is_empty() {
        return Err(ProxyError::InvalidRequest("request body required".to_string()));
    }
    serde_json::from_slice(body)
        .map_err(|e| ProxyError::InvalidRequest(format!("malformed request body: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_signing_operations() {
        let op = Operation::decode(
            "post",
            "/sign-message/",
            br#"{"message":"hello"}"#,
        )
        .unwrap();
        assert_eq!(
            op,
            Operation::SignMessage {
                message: "hello".to_string()
            }
        );
        assert_eq!(op.signing_method(), Some(SigningMethod::SignMessage));

        let body = json!({
            "transaction": {"to": "0x0000000000000000000000000000000000000001", "value": "0x10", "chainId": 1, "gas": 21000},
            "abi": null
        });
        let op = Operation::decode("POST", "/sign-transaction", body.to_string().as_bytes()).unwrap();
        match op {
            Operation::SignTransaction { tx, abi } => {
                assert_eq!(tx.value, Some(Quantity::from("0x10")));
                assert!(abi.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }

        let body = json!({"address": "0x0000000000000000000000000000000000000002", "chainId": "0xa"});
        let op = Operation::decode("POST", "/sign-authorization", body.to_string().as_bytes()).unwrap();
        assert_eq!(
            op,
            Operation::SignAuthorization {
                address: "0x0000000000000000000000000000000000000002".to_string(),
                chain_id: Some(Quantity::from("0xa")),
                nonce: None,
            }
        );
    }

    #[test]
    fn test_decode_admin_routes() {
        let op = Operation::decode("GET", "/policies/abc?verbose=1", b"").unwrap();
        assert_eq!(op, Operation::GetPolicy("abc".to_string()));
        assert!(op.is_admin());

        let op = Operation::decode(
            "POST",
            "/wallets/0xabc/policies",
            br#"{"policyId":"p1"}"#,
        )
        .unwrap();
        assert_eq!(
            op,
            Operation::AttachPolicy {
                wallet: "0xabc".to_string(),
                policy_id: "p1".to_string()
            }
        );

        let op = Operation::decode("DELETE", "/wallets/0xabc/policies/p1", b"").unwrap();
        assert_eq!(op.name(), "detach_policy");
        assert!(!Operation::GetAddress.is_admin());
    }

    #[test]
    fn test_decode_rejects_bad_input() {
        assert!(matches!(
            Operation::decode("GET", "/sign-message", b""),
            Err(ProxyError::InvalidRequest(_))
        ));
        assert!(matches!(
            Operation::decode("POST", "/sign-message", b"not json"),
            Err(ProxyError::InvalidRequest(_))
        ));
        assert!(matches!(
            Operation::decode("POST", "/sign-message", b""),
            Err(ProxyError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_approval_outcomes() {
        assert!(Approval::NotRequired.check().is_ok());
        assert!(Approval::Approved.check().is_ok());
        assert!(matches!(Approval::Rejected.check(), Err(ProxyError::ApprovalRejected)));
        assert!(matches!(Approval::TimedOut.check(), Err(ProxyError::ApprovalTimedOut)));
        assert_eq!(operation_name("/sign-message?x=1"), "sign_message");
    }
}
