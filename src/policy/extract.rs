//! Field extraction
//!
//! Builds a fresh [`EvaluationContext`] for every request. Numeric fields
//! are normalized to big integers whatever form the caller used, addresses
//! are lowercased, and call data is decoded when an interface description
//! is available. A failed decode leaves the decoded-call source empty, so
//! rules that depend on it cannot fire.

use crate::errors::Result;
use crate::policy::abi::Abi;
use crate::policy::context::{
    AuthorizationFacts, CallFacts, EvaluationContext, MessageFacts, Payload, TransactionFacts,
};
use crate::signer::{Authorization, Quantity, TransactionRequest};
use chrono::{DateTime, Utc};
use num_bigint::BigUint;
use num_traits::Zero;
use serde_json::Value;
use tracing::{debug, warn};

/// Facts for a transaction signing request
pub fn transaction_context(
    tx: &TransactionRequest,
    abi: Option<&Value>,
    now: DateTime<Utc>,
) -> Result<EvaluationContext> {
    let data = tx.data_bytes()?;
    let facts = TransactionFacts {
        to: tx.to_address()?.map(|addr| format!("0x{}", hex::encode(addr))),
        value: optional(&tx.value)?.unwrap_or_else(BigUint::zero),
        chain_id: optional(&tx.chain_id)?,
        gas: optional(&tx.gas)?,
        gas_price: optional(&tx.gas_price)?,
        max_fee_per_gas: optional(&tx.max_fee_per_gas)?,
        max_priority_fee_per_gas: optional(&tx.max_priority_fee_per_gas)?,
        nonce: optional(&tx.nonce)?.unwrap_or_else(BigUint::zero),
        tx_type: tx.kind()?.type_byte(),
        data,
    };

    let call = abi.and_then(|abi| decode_call_facts(abi, &facts.data));

    Ok(EvaluationContext::new(
        Payload::Transaction { facts, call },
        now,
    ))
}

fn optional(field: &Option<Quantity>) -> Result<Option<BigUint>> {
    field.as_ref().map(Quantity::to_biguint).transpose()
}

/// Facts for a personal message signing request
pub fn message_context(message: &str, now: DateTime<Utc>) -> EvaluationContext {
    EvaluationContext::new(
        Payload::Message(MessageFacts {
            message: message.to_string(),
            length: message.len(),
            is_hex: looks_like_hex(message),
        }),
        now,
    )
}

/// Facts for a delegation authorization request
pub fn authorization_context(authorization: &Authorization, now: DateTime<Utc>) -> EvaluationContext {
    EvaluationContext::new(
        Payload::Authorization(AuthorizationFacts {
            address: format!("0x{}", hex::encode(authorization.address)),
            chain_id: authorization.chain_id,
            nonce: authorization.nonce,
        }),
        now,
    )
}

/// Decode `data` with `abi`; any failure yields no facts
pub fn decode_call_facts(abi: &Value, data: &[u8]) -> Option<CallFacts> {
    if data.is_empty() {
        return None;
    }

    let decoded = Abi::parse(abi).and_then(|abi| abi.decode_call(data));
    match decoded {
        Ok(call) => {
            debug!("Decoded call to {}", call.name);
            Some(call.into_facts())
        }
        Err(e) => {
            warn!("Call data not decoded, decoded-call facts unavailable: {}", e);
            None
        }
    }
}

/// `0x` followed by at least one hex digit and nothing else
fn looks_like_hex(s: &str) -> bool {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(rest) => !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_hexdigit()),
        None => false,
    }
}
