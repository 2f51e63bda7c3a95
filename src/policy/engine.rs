//! Policy engine
//!
//! Decision rules:
//! - within a policy, the first rule that fires decides that policy
//! - a DENY from any bound policy denies the request
//! - otherwise at least one policy must have fired ALLOW
//! - no bound policies, or none firing, denies
//!
//! A condition whose field is absent is false for every operator,
//! including `neq` and `not_in`.

use crate::policy::abi::Abi;
use crate::policy::context::{EvaluationContext, FactValue};
use crate::policy::rules::{Condition, FieldSource, Operator, Policy, Rule, RuleAction, SigningMethod};
use num_bigint::BigInt;
use num_traits::Num;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;
use tracing::{debug, warn};

/// Outcome of evaluating a request against its bound policies
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub allowed: bool,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denied_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,
}

impl Verdict {
    fn deny(reason: String, rule: Option<&Rule>, policy: Option<&Policy>) -> Self {
        Self {
            allowed: false,
            reason,
            denied_by: rule.map(|r| r.name.clone()),
            allowed_by: None,
            policy_id: policy.map(|p| p.id.clone()),
        }
    }

    fn allow(rule: &Rule, policy: &Policy) -> Self {
        Self {
            allowed: true,
            reason: format!("allowed by rule '{}' in policy '{}'", rule.name, policy.name),
            denied_by: None,
            allowed_by: Some(rule.name.clone()),
            policy_id: Some(policy.id.clone()),
        }
    }
}

/// Stateless evaluator; all inputs are passed per call
#[derive(Debug, Default, Clone, Copy)]
pub struct PolicyEngine;

impl PolicyEngine {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate `method` against `policies` in the given order
    pub fn evaluate(
        &self,
        policies: &[Policy],
        method: SigningMethod,
        ctx: &EvaluationContext,
    ) -> Verdict {
        if policies.is_empty() {
            return Verdict::deny("no policies bound to wallet".to_string(), None, None);
        }

        let mut first_allow: Option<(&Rule, &Policy)> = None;

        for policy in policies {
            let Some(rule) = self.first_firing_rule(policy, method, ctx) else {
                continue;
            };

            match rule.action {
                RuleAction::Deny => {
                    debug!("Rule '{}' in policy {} denied {}", rule.name, policy.id, method);
                    return Verdict::deny(
                        format!("denied by rule '{}' in policy '{}'", rule.name, policy.name),
                        Some(rule),
                        Some(policy),
                    );
                }
                RuleAction::Allow => {
                    if first_allow.is_none() {
                        first_allow = Some((rule, policy));
                    }
                }
            }
        }

        match first_allow {
            Some((rule, policy)) => Verdict::allow(rule, policy),
            None => Verdict::deny(
                format!("no rule allowed {}", method),
                None,
                None,
            ),
        }
    }

    fn first_firing_rule<'a>(
        &self,
        policy: &'a Policy,
        method: SigningMethod,
        ctx: &EvaluationContext,
    ) -> Option<&'a Rule> {
        policy.rules.iter().find(|rule| {
            rule.method.matches(method)
                && rule
                    .conditions
                    .iter()
                    .all(|condition| evaluate_condition(condition, ctx))
        })
    }
}

/// Evaluate one condition against the context
pub fn evaluate_condition(condition: &Condition, ctx: &EvaluationContext) -> bool {
    let fact = match (&condition.abi, condition.field_source) {
        // A condition-level ABI decodes the call data for this condition only
        (Some(abi), FieldSource::EthereumCalldata) => ctx
            .call_data()
            .filter(|data| !data.is_empty())
            .and_then(|data| match Abi::parse(abi).and_then(|abi| abi.decode_call(data)) {
                Ok(call) => call.into_facts().lookup(&condition.field),
                Err(e) => {
                    warn!("Condition ABI could not decode call data: {}", e);
                    None
                }
            }),
        _ => ctx.lookup(condition.field_source, &condition.field),
    };

    match fact {
        Some(fact) => compare(&fact, condition.operator, &condition.value),
        None => false,
    }
}

/// Apply `op` between a fact and a condition value
pub fn compare(fact: &FactValue, op: Operator, expected: &Value) -> bool {
    match op {
        Operator::Eq => equals(fact, expected).unwrap_or(false),
        // Incomparable values are not "not equal"
        Operator::Neq => equals(fact, expected).map(|eq| !eq).unwrap_or(false),
        Operator::Lt => ordering(fact, expected).map_or(false, |o| o == Ordering::Less),
        Operator::Lte => ordering(fact, expected).map_or(false, |o| o != Ordering::Greater),
        Operator::Gt => ordering(fact, expected).map_or(false, |o| o == Ordering::Greater),
        Operator::Gte => ordering(fact, expected).map_or(false, |o| o != Ordering::Less),
        Operator::In => set_items(expected)
            .iter()
            .any(|item| equals(fact, item).unwrap_or(false)),
        Operator::NotIn => {
            let items = set_items(expected);
            let mut results = items.iter().map(|item| equals(fact, item));
            results.all(|eq| eq == Some(false))
        }
        Operator::Matches => matches_pattern(fact, expected),
    }
}

/// `None` when the two values cannot be compared
fn equals(fact: &FactValue, expected: &Value) -> Option<bool> {
    match fact {
        FactValue::Number(n) => to_bigint(expected).map(|e| &e == n),
        FactValue::Bool(b) => to_bool(expected).map(|e| e == *b),
        FactValue::Text(s) => {
            let expected = to_text(expected)?;
            if is_hex_text(s) || is_hex_text(&expected) {
                Some(s.eq_ignore_ascii_case(&expected))
            } else {
                Some(*s == expected)
            }
        }
    }
}

fn ordering(fact: &FactValue, expected: &Value) -> Option<Ordering> {
    match fact {
        FactValue::Number(n) => to_bigint(expected).map(|e| n.cmp(&e)),
        _ => None,
    }
}

fn matches_pattern(fact: &FactValue, expected: &Value) -> bool {
    let Some(pattern) = expected.as_str() else {
        return false;
    };
    match Regex::new(pattern) {
        Ok(re) => re.is_match(&fact.to_string()),
        Err(e) => {
            warn!("Invalid pattern '{}' in policy condition: {}", pattern, e);
            false
        }
    }
}

/// A JSON array, or a comma separated string
fn set_items(expected: &Value) -> Vec<Value> {
    match expected {
        Value::Array(items) => items.clone(),
        Value::String(s) => s
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(|item| Value::String(item.to_string()))
            .collect(),
        other => vec![other.clone()],
    }
}

fn to_bigint(value: &Value) -> Option<BigInt> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .map(BigInt::from)
            .or_else(|| n.as_i64().map(BigInt::from)),
        Value::String(s) => parse_bigint(s),
        _ => None,
    }
}

/// Decimal with optional sign, or `0x` hex
fn parse_bigint(s: &str) -> Option<BigInt> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        if hex.is_empty() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        return BigInt::from_str_radix(hex, 16).ok();
    }
    let digits = s.strip_prefix('-').unwrap_or(s);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    BigInt::from_str_radix(s, 10).ok()
}

fn to_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn to_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn is_hex_text(s: &str) -> bool {
    s.starts_with("0x") || s.starts_with("0X")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::context::{MessageFacts, Payload, TransactionFacts};
    use crate::policy::rules::RuleMethod;
    use chrono::Utc;
    use num_bigint::BigUint;
    use serde_json::json;

    fn policy(id: &str, rules: Vec<Rule>) -> Policy {
        let now = Utc::now();
        Policy {
            id: id.to_string(),
            version: "1.0".to_string(),
            name: format!("policy {}", id),
            chain_type: "evm".to_string(),
            rules,
            created_at: now,
            updated_at: now,
        }
    }

    fn tx_context(value: &str) -> EvaluationContext {
        let value = crate::signer::parse_biguint(value).unwrap();
        EvaluationContext::new(
            Payload::Transaction {
                facts: TransactionFacts {
                    to: Some("0x000000000000000000000000000000000000dead".to_string()),
                    value,
                    chain_id: Some(BigUint::from(1u8)),
                    ..Default::default()
                },
                call: None,
            },
            Utc::now(),
        )
    }

    fn value_condition(op: Operator, value: &str) -> Condition {
        Condition::new(FieldSource::EthereumTransaction, "value", op, json!(value))
    }

    fn large_transfer_deny() -> Rule {
        Rule::new("block large transfers", RuleMethod::SignTransaction, RuleAction::Deny)
            .with_condition(value_condition(Operator::Gt, "1000000000000000000"))
    }

    #[test]
    fn test_no_policies_denies_everything() {
        let engine = PolicyEngine::new();
        for method in [
            SigningMethod::SignMessage,
            SigningMethod::SignTransaction,
            SigningMethod::SignAuthorization,
        ] {
            let verdict = engine.evaluate(&[], method, &tx_context("0"));
            assert!(!verdict.allowed);
            assert!(verdict.denied_by.is_none());
        }
    }

    #[test]
    fn test_large_transfer_denied_by_rule() {
        let engine = PolicyEngine::new();
        let policies = vec![policy("p1", vec![large_transfer_deny()])];

        let verdict = engine.evaluate(
            &policies,
            SigningMethod::SignTransaction,
            &tx_context("2000000000000000000"),
        );
        assert!(!verdict.allowed);
        assert_eq!(verdict.denied_by.as_deref(), Some("block large transfers"));
        assert_eq!(verdict.policy_id.as_deref(), Some("p1"));
    }

    #[test]
    fn test_small_transfer_denied_by_default() {
        let engine = PolicyEngine::new();
        let policies = vec![policy("p1", vec![large_transfer_deny()])];

        let verdict = engine.evaluate(
            &policies,
            SigningMethod::SignTransaction,
            &tx_context("500000000000000000"),
        );
        assert!(!verdict.allowed);
        assert!(verdict.denied_by.is_none());
        assert!(verdict.allowed_by.is_none());
    }

    #[test]
    fn test_deny_beats_allow_across_policies() {
        let engine = PolicyEngine::new();
        let allow_all = Rule::new("allow all", RuleMethod::Any, RuleAction::Allow);
        let ctx = tx_context("2000000000000000000");

        for policies in [
            vec![policy("allow", vec![allow_all.clone()]), policy("deny", vec![large_transfer_deny()])],
            vec![policy("deny", vec![large_transfer_deny()]), policy("allow", vec![allow_all.clone()])],
        ] {
            let verdict = engine.evaluate(&policies, SigningMethod::SignTransaction, &ctx);
            assert!(!verdict.allowed);
            assert_eq!(verdict.policy_id.as_deref(), Some("deny"));
        }
    }

    #[test]
    fn test_first_firing_rule_decides_within_policy() {
        let engine = PolicyEngine::new();
        let policies = vec![policy(
            "p1",
            vec![
                Rule::new("allow first", RuleMethod::SignTransaction, RuleAction::Allow),
                large_transfer_deny(),
            ],
        )];

        let verdict = engine.evaluate(
            &policies,
            SigningMethod::SignTransaction,
            &tx_context("2000000000000000000"),
        );
        assert!(verdict.allowed);
        assert_eq!(verdict.allowed_by.as_deref(), Some("allow first"));
    }

    #[test]
    fn test_conditions_are_conjunctive() {
        let engine = PolicyEngine::new();
        let rule = |to: &str, max: &str| {
            Rule::new("small to dead", RuleMethod::SignTransaction, RuleAction::Allow)
                .with_condition(Condition::new(
                    FieldSource::EthereumTransaction,
                    "to",
                    Operator::Eq,
                    json!(to),
                ))
                .with_condition(value_condition(Operator::Lte, max))
        };
        let ctx = tx_context("100");
        let dead = "0x000000000000000000000000000000000000DEAD";

        let both = vec![policy("p", vec![rule(dead, "1000")])];
        assert!(engine.evaluate(&both, SigningMethod::SignTransaction, &ctx).allowed);

        let wrong_to = vec![policy("p", vec![rule("0x0000000000000000000000000000000000000001", "1000")])];
        assert!(!engine.evaluate(&wrong_to, SigningMethod::SignTransaction, &ctx).allowed);

        let too_small = vec![policy("p", vec![rule(dead, "10")])];
        assert!(!engine.evaluate(&too_small, SigningMethod::SignTransaction, &ctx).allowed);
    }

    #[test]
    fn test_method_must_match() {
        let engine = PolicyEngine::new();
        let policies = vec![policy(
            "p",
            vec![Rule::new("messages only", RuleMethod::SignMessage, RuleAction::Allow)],
        )];
        assert!(!engine
            .evaluate(&policies, SigningMethod::SignTransaction, &tx_context("0"))
            .allowed);
    }

    #[test]
    fn test_wide_hex_value_against_decimal_threshold() {
        // 0xffffffffffffffffffffffffffffff = 1329227995784915872903807060280344575
        let ctx = tx_context("0xffffffffffffffffffffffffffffff");
        let above = Condition::new(
            FieldSource::EthereumTransaction,
            "value",
            Operator::Gt,
            json!("1329227995784915872903807060280344574"),
        );
        let equal = Condition::new(
            FieldSource::EthereumTransaction,
            "value",
            Operator::Eq,
            json!("1329227995784915872903807060280344575"),
        );
        let below = Condition::new(
            FieldSource::EthereumTransaction,
            "value",
            Operator::Lt,
            json!("1329227995784915872903807060280344575"),
        );
        assert!(evaluate_condition(&above, &ctx));
        assert!(evaluate_condition(&equal, &ctx));
        assert!(!evaluate_condition(&below, &ctx));
    }

    #[test]
    fn test_absent_field_fails_safe() {
        let ctx = tx_context("1");
        for op in [Operator::Eq, Operator::Neq, Operator::NotIn, Operator::Lt] {
            let gas_price = Condition::new(FieldSource::EthereumTransaction, "gasPrice", op, json!(["5"]));
            assert!(!evaluate_condition(&gas_price, &ctx), "{:?}", op);

            let message = Condition::new(FieldSource::Message, "length", op, json!(["5"]));
            assert!(!evaluate_condition(&message, &ctx), "{:?}", op);
        }
    }

    #[test]
    fn test_set_operators() {
        let fact = FactValue::text("0xabc");
        assert!(compare(&fact, Operator::In, &json!(["0xdef", "0xABC"])));
        assert!(compare(&fact, Operator::In, &json!("0x1, 0xabc")));
        assert!(!compare(&fact, Operator::NotIn, &json!("0x1, 0xabc")));
        assert!(compare(&fact, Operator::NotIn, &json!(["0x1", "0x2"])));

        let n = FactValue::number(5u8);
        assert!(compare(&n, Operator::In, &json!([1, "5", "0x9"])));
        // a value that is not a number cannot prove exclusion
        assert!(!compare(&n, Operator::NotIn, &json!(["abc"])));
    }

    #[test]
    fn test_matches_operator() {
        let ctx = EvaluationContext::new(
            Payload::Message(MessageFacts {
                message: "Sign in to example.com".to_string(),
                length: 22,
                is_hex: false,
            }),
            Utc::now(),
        );
        let ok = Condition::new(FieldSource::Message, "message", Operator::Matches, json!("^Sign in to .*\\.com$"));
        let broken = Condition::new(FieldSource::Message, "message", Operator::Matches, json!("("));
        assert!(evaluate_condition(&ok, &ctx));
        assert!(!evaluate_condition(&broken, &ctx));
    }

    #[test]
    fn test_condition_level_abi() {
        let abi = json!([{
            "type": "function",
            "name": "transfer",
            "inputs": [
                {"name": "to", "type": "address"},
                {"name": "amount", "type": "uint256"}
            ]
        }]);
        let mut data = hex::decode("a9059cbb").unwrap();
        data.extend_from_slice(&[0u8; 12]);
        data.extend_from_slice(&[0x11; 20]);
        let mut amount = [0u8; 32];
        amount[31] = 200;
        data.extend_from_slice(&amount);

        let ctx = EvaluationContext::new(
            Payload::Transaction {
                facts: TransactionFacts {
                    data,
                    ..Default::default()
                },
                call: None,
            },
            Utc::now(),
        );

        let without_abi = Condition::new(FieldSource::EthereumCalldata, "transfer.amount", Operator::Gt, json!(100));
        assert!(!evaluate_condition(&without_abi, &ctx));

        let with_abi = without_abi.clone().with_abi(abi);
        assert!(evaluate_condition(&with_abi, &ctx));
    }
}
