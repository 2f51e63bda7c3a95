//! Policy documents
//!
//! A policy is an ordered list of rules. A rule targets one signing method
//! (or all of them), carries an action and fires when every one of its
//! conditions holds. Conditions read a single fact from one field source.
//!
//! ```json
//! {
//!   "name": "treasury limits",
//!   "rules": [{
//!     "name": "block large transfers",
//!     "method": "sign_transaction",
//!     "action": "DENY",
//!     "conditions": [{
//!       "field_source": "ethereum_transaction",
//!       "field": "value",
//!       "operator": "gt",
//!       "value": "1000000000000000000"
//!     }]
//!   }]
//! }
//! ```

use crate::errors::{ProxyError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Version tag assigned to policies that do not name one
pub const DEFAULT_POLICY_VERSION: &str = "1.0";

/// Chain family assigned to policies that do not name one
pub const DEFAULT_CHAIN_TYPE: &str = "evm";

/// The signing operations a rule can target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SigningMethod {
    #[serde(alias = "sign-message", alias = "signMessage")]
    SignMessage,
    #[serde(alias = "sign-transaction", alias = "signTransaction")]
    SignTransaction,
    #[serde(alias = "sign-authorization", alias = "signAuthorization")]
    SignAuthorization,
}

impl SigningMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SigningMethod::SignMessage => "sign_message",
            SigningMethod::SignTransaction => "sign_transaction",
            SigningMethod::SignAuthorization => "sign_authorization",
        }
    }
}

impl fmt::Display for SigningMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Method a rule applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleMethod {
    #[serde(alias = "sign-message", alias = "signMessage")]
    SignMessage,
    #[serde(alias = "sign-transaction", alias = "signTransaction")]
    SignTransaction,
    #[serde(alias = "sign-authorization", alias = "signAuthorization")]
    SignAuthorization,
    /// Matches every signing method
    #[serde(rename = "*", alias = "all", alias = "any")]
    Any,
}

impl RuleMethod {
    pub fn matches(&self, method: SigningMethod) -> bool {
        match self {
            RuleMethod::Any => true,
            RuleMethod::SignMessage => method == SigningMethod::SignMessage,
            RuleMethod::SignTransaction => method == SigningMethod::SignTransaction,
            RuleMethod::SignAuthorization => method == SigningMethod::SignAuthorization,
        }
    }
}

/// What a firing rule decides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleAction {
    #[serde(rename = "ALLOW", alias = "allow")]
    Allow,
    #[serde(rename = "DENY", alias = "deny")]
    Deny,
}

/// Fact category a condition reads from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldSource {
    #[serde(alias = "transaction")]
    EthereumTransaction,
    #[serde(alias = "calldata", alias = "decoded_call")]
    EthereumCalldata,
    Message,
    Authorization,
    #[serde(alias = "time")]
    System,
}

/// Comparison applied between a fact and a condition value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "eq", alias = "==")]
    Eq,
    #[serde(rename = "neq", alias = "!=")]
    Neq,
    #[serde(rename = "lt", alias = "<")]
    Lt,
    #[serde(rename = "lte", alias = "<=")]
    Lte,
    #[serde(rename = "gt", alias = ">")]
    Gt,
    #[serde(rename = "gte", alias = ">=")]
    Gte,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not_in", alias = "nin")]
    NotIn,
    #[serde(rename = "matches", alias = "regex")]
    Matches,
}

/// A single fact test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field_source: FieldSource,
    pub field: String,
    pub operator: Operator,
    pub value: Value,

    /// Interface description used to decode call data for this condition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abi: Option<Value>,
}

impl Condition {
    pub fn new(field_source: FieldSource, field: &str, operator: Operator, value: Value) -> Self {
        Self {
            field_source,
            field: field.to_string(),
            operator,
            value,
            abi: None,
        }
    }

    pub fn with_abi(mut self, abi: Value) -> Self {
        self.abi = Some(abi);
        self
    }
}

/// An ordered rule inside a policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    pub method: RuleMethod,
    pub action: RuleAction,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl Rule {
    pub fn new(name: &str, method: RuleMethod, action: RuleAction) -> Self {
        Self {
            name: name.to_string(),
            method,
            action,
            conditions: vec![],
        }
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }
}

/// Stored policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    pub version: String,
    pub name: String,
    pub chain_type: String,
    pub rules: Vec<Rule>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Caller-supplied policy body for create and update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDraft {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, alias = "chainType", skip_serializing_if = "Option::is_none")]
    pub chain_type: Option<String>,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl PolicyDraft {
    pub fn new(name: &str, rules: Vec<Rule>) -> Self {
        Self {
            name: name.to_string(),
            version: None,
            chain_type: None,
            rules,
        }
    }

    /// Reject documents the engine could not evaluate meaningfully
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ProxyError::InvalidRequest(
                "policy name must not be empty".to_string(),
            ));
        }

        for rule in &self.rules {
            if rule.name.trim().is_empty() {
                return Err(ProxyError::InvalidRequest(
                    "rule name must not be empty".to_string(),
                ));
            }
            for condition in &rule.conditions {
                if condition.field.trim().is_empty() {
                    return Err(ProxyError::InvalidRequest(format!(
                        "rule '{}' has a condition without a field",
                        rule.name
                    )));
                }
                if matches!(condition.operator, Operator::In | Operator::NotIn)
                    && !(condition.value.is_array() || condition.value.is_string())
                {
                    return Err(ProxyError::InvalidRequest(format!(
                        "rule '{}': set operators need a list or comma separated string",
                        rule.name
                    )));
                }
                if !exact_numbers(&condition.value) {
                    return Err(ProxyError::InvalidRequest(format!(
                        "rule '{}': number in condition on '{}' is not an exact 64-bit integer, \
                         write it as a decimal string",
                        rule.name, condition.field
                    )));
                }
            }
        }

        Ok(())
    }
}

/// JSON numbers outside i64/u64 arrive as lossy floats
fn exact_numbers(value: &Value) -> bool {
    match value {
        Value::Number(n) => n.is_u64() || n.is_i64(),
        Value::Array(items) => items.iter().all(exact_numbers),
        _ => true,
    }
}
