//! Evaluation context
//!
//! The fact set assembled for one signing request. Exactly one payload kind
//! (transaction, message, authorization) is present; system facts always
//! are. Each source answers lookups by field name and returns `None` for
//! anything it does not know, which the engine treats as "condition false".

use crate::policy::rules::FieldSource;
use chrono::{DateTime, Datelike, Timelike, Utc};
use num_bigint::{BigInt, BigUint};
use std::fmt;

/// A single fact value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FactValue {
    Number(BigInt),
    Text(String),
    Bool(bool),
}

impl FactValue {
    pub fn text(s: impl Into<String>) -> Self {
        FactValue::Text(s.into())
    }

    pub fn number(n: impl Into<BigInt>) -> Self {
        FactValue::Number(n.into())
    }
}

impl From<BigUint> for FactValue {
    fn from(n: BigUint) -> Self {
        FactValue::Number(BigInt::from(n))
    }
}

impl From<&BigUint> for FactValue {
    fn from(n: &BigUint) -> Self {
        FactValue::Number(BigInt::from(n.clone()))
    }
}

impl fmt::Display for FactValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FactValue::Number(n) => write!(f, "{}", n),
            FactValue::Text(s) => f.write_str(s),
            FactValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

/// Transaction facts. Numeric fields the caller omitted stay `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionFacts {
    /// Lowercase `0x` address, `None` for contract creation
    pub to: Option<String>,
    pub value: BigUint,
    pub chain_id: Option<BigUint>,
    pub gas: Option<BigUint>,
    pub gas_price: Option<BigUint>,
    pub max_fee_per_gas: Option<BigUint>,
    pub max_priority_fee_per_gas: Option<BigUint>,
    pub nonce: BigUint,
    /// Raw call data
    pub data: Vec<u8>,
    /// EIP-2718 type byte (0 for legacy)
    pub tx_type: u8,
}

impl TransactionFacts {
    pub fn lookup(&self, field: &str) -> Option<FactValue> {
        match field {
            "to" => self.to.clone().map(FactValue::Text),
            "value" => Some((&self.value).into()),
            "chainId" | "chain_id" => self.chain_id.as_ref().map(FactValue::from),
            "gas" | "gasLimit" | "gas_limit" => self.gas.as_ref().map(FactValue::from),
            "gasPrice" | "gas_price" => self.gas_price.as_ref().map(FactValue::from),
            "maxFeePerGas" | "max_fee_per_gas" => self.max_fee_per_gas.as_ref().map(FactValue::from),
            "maxPriorityFeePerGas" | "max_priority_fee_per_gas" => {
                self.max_priority_fee_per_gas.as_ref().map(FactValue::from)
            }
            "nonce" => Some((&self.nonce).into()),
            "data" | "input" => Some(FactValue::Text(format!("0x{}", hex::encode(&self.data)))),
            "type" => Some(FactValue::number(self.tx_type)),
            _ => None,
        }
    }
}

/// Facts from a decoded contract call
#[derive(Debug, Clone, PartialEq)]
pub struct CallFacts {
    pub function: String,
    /// `0x` + 8 hex digits
    pub selector: String,
    /// (parameter name, value) in declaration order; unnamed params use ""
    pub params: Vec<(String, FactValue)>,
}

impl CallFacts {
    /// Resolves `function`, `selector`, `<fn>.<param>`, `<param>` and `<fn>.<index>`
    pub fn lookup(&self, field: &str) -> Option<FactValue> {
        match field {
            "function" | "functionName" | "function_name" => {
                return Some(FactValue::Text(self.function.clone()))
            }
            "selector" => return Some(FactValue::Text(self.selector.clone())),
            _ => {}
        }

        let key = match field.split_once('.') {
            Some((function, rest)) if function == self.function => rest,
            Some(_) => return None,
            None => field,
        };

        if let Some((_, value)) = self.params.iter().find(|(name, _)| !name.is_empty() && name == key) {
            return Some(value.clone());
        }

        // Positional access is only meaningful with the function prefix
        if field.contains('.') {
            if let Ok(index) = key.parse::<usize>() {
                return self.params.get(index).map(|(_, value)| value.clone());
            }
        }

        None
    }
}

/// Message facts
#[derive(Debug, Clone, PartialEq)]
pub struct MessageFacts {
    pub message: String,
    pub length: usize,
    pub is_hex: bool,
}

impl MessageFacts {
    pub fn lookup(&self, field: &str) -> Option<FactValue> {
        match field {
            "message" | "content" => Some(FactValue::Text(self.message.clone())),
            "length" => Some(FactValue::number(self.length as u64)),
            "isHex" | "is_hex" => Some(FactValue::Bool(self.is_hex)),
            _ => None,
        }
    }
}

/// Delegation facts
#[derive(Debug, Clone, PartialEq)]
pub struct AuthorizationFacts {
    /// Lowercase `0x` delegation target
    pub address: String,
    pub chain_id: u64,
    pub nonce: u64,
}

impl AuthorizationFacts {
    pub fn lookup(&self, field: &str) -> Option<FactValue> {
        match field {
            "address" | "contractAddress" | "contract_address" => {
                Some(FactValue::Text(self.address.clone()))
            }
            "chainId" | "chain_id" => Some(FactValue::number(self.chain_id)),
            "nonce" => Some(FactValue::number(self.nonce)),
            _ => None,
        }
    }
}

/// Wall-clock facts, UTC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemFacts {
    pub timestamp: i64,
    pub hour: u32,
    pub minute: u32,
    /// 0 = Sunday
    pub weekday: u32,
}

impl SystemFacts {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            timestamp: now.timestamp(),
            hour: now.hour(),
            minute: now.minute(),
            weekday: now.weekday().num_days_from_sunday(),
        }
    }

    pub fn lookup(&self, field: &str) -> Option<FactValue> {
        match field {
            "timestamp" | "time" | "now" => Some(FactValue::number(self.timestamp)),
            "hour" => Some(FactValue::number(self.hour)),
            "minute" => Some(FactValue::number(self.minute)),
            "weekday" | "dayOfWeek" | "day_of_week" => Some(FactValue::number(self.weekday)),
            _ => None,
        }
    }
}

/// The per-request payload facts
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Transaction {
        facts: TransactionFacts,
        /// Present when the request ABI decoded the call data
        call: Option<CallFacts>,
    },
    Message(MessageFacts),
    Authorization(AuthorizationFacts),
}

/// Everything a condition can look at for one request
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationContext {
    pub payload: Payload,
    pub system: SystemFacts,
}

impl EvaluationContext {
    pub fn new(payload: Payload, now: DateTime<Utc>) -> Self {
        Self {
            payload,
            system: SystemFacts::at(now),
        }
    }

    /// Look up `field` under `source`; `None` when absent
    pub fn lookup(&self, source: FieldSource, field: &str) -> Option<FactValue> {
        match (source, &self.payload) {
            (FieldSource::System, _) => self.system.lookup(field),
            (FieldSource::EthereumTransaction, Payload::Transaction { facts, .. }) => {
                facts.lookup(field)
            }
            (FieldSource::EthereumCalldata, Payload::Transaction { call: Some(call), .. }) => {
                call.lookup(field)
            }
            (FieldSource::Message, Payload::Message(facts)) => facts.lookup(field),
            (FieldSource::Authorization, Payload::Authorization(facts)) => facts.lookup(field),
            _ => None,
        }
    }

    /// Raw call data of a transaction request
    pub fn call_data(&self) -> Option<&[u8]> {
        match &self.payload {
            Payload::Transaction { facts, .. } => Some(&facts.data),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn message_context() -> EvaluationContext {
        let now = Utc.with_ymd_and_hms(2024, 3, 3, 14, 30, 0).unwrap();
        EvaluationContext::new(
            Payload::Message(MessageFacts {
                message: "hello".to_string(),
                length: 5,
                is_hex: false,
            }),
            now,
        )
    }

    #[test]
    fn test_only_populated_source_answers() {
        let ctx = message_context();
        assert_eq!(
            ctx.lookup(FieldSource::Message, "length"),
            Some(FactValue::number(5u64))
        );
        assert_eq!(ctx.lookup(FieldSource::EthereumTransaction, "value"), None);
        assert_eq!(ctx.lookup(FieldSource::Authorization, "address"), None);
        assert_eq!(ctx.lookup(FieldSource::Message, "unknown"), None);
        assert!(ctx.call_data().is_none());
    }

    #[test]
    fn test_system_facts() {
        let ctx = message_context();
        // 2024-03-03 was a Sunday
        assert_eq!(ctx.lookup(FieldSource::System, "weekday"), Some(FactValue::number(0u32)));
        assert_eq!(ctx.lookup(FieldSource::System, "hour"), Some(FactValue::number(14u32)));
        assert_eq!(ctx.lookup(FieldSource::System, "minute"), Some(FactValue::number(30u32)));
    }

    #[test]
    fn test_call_fact_keys() {
        let call = CallFacts {
            function: "transfer".to_string(),
            selector: "0xa9059cbb".to_string(),
            params: vec![
                ("to".to_string(), FactValue::text("0xabc")),
                ("".to_string(), FactValue::number(7u64)),
            ],
        };

        assert_eq!(call.lookup("transfer.to"), Some(FactValue::text("0xabc")));
        assert_eq!(call.lookup("to"), Some(FactValue::text("0xabc")));
        assert_eq!(call.lookup("transfer.1"), Some(FactValue::number(7u64)));
        assert_eq!(call.lookup("approve.to"), None);
        assert_eq!(call.lookup("1"), None);
        assert_eq!(call.lookup("function"), Some(FactValue::text("transfer")));
    }

    #[test]
    fn test_missing_gas_price_is_absent() {
        let facts = TransactionFacts {
            value: BigUint::from(1u8),
            ..Default::default()
        };
        assert_eq!(facts.lookup("gasPrice"), None);
        assert_eq!(facts.lookup("value"), Some(FactValue::number(1u8)));
        assert_eq!(facts.lookup("data"), Some(FactValue::text("0x")));
    }
}
