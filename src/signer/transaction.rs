//! EVM transaction model
//!
//! Turns the loosely-typed transaction fields a caller submits into a
//! legacy (EIP-155) or EIP-1559 transaction, and produces the signing hash
//! and the raw signed encoding.

use super::quantity::{to_be_bytes_trimmed, Quantity};
use crate::crypto::{keccak256, parse_address, EthSignature};
use crate::errors::{ProxyError, Result};
use num_bigint::BigUint;
use num_traits::Zero;
use rlp::RlpStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// EIP-2718 type byte for dynamic fee transactions
const EIP1559_TX_TYPE: u8 = 0x02;

/// Transaction fields as submitted by the caller
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Quantity>,

    #[serde(default, alias = "chain_id", skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<Quantity>,

    #[serde(default, alias = "gasLimit", alias = "gas_limit", skip_serializing_if = "Option::is_none")]
    pub gas: Option<Quantity>,

    #[serde(default, alias = "gas_price", skip_serializing_if = "Option::is_none")]
    pub gas_price: Option<Quantity>,

    #[serde(default, alias = "max_fee_per_gas", skip_serializing_if = "Option::is_none")]
    pub max_fee_per_gas: Option<Quantity>,

    #[serde(
        default,
        alias = "max_priority_fee_per_gas",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_priority_fee_per_gas: Option<Quantity>,

    #[serde(default, alias = "input", skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<Quantity>,

    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub tx_type: Option<Value>,
}

/// Largest chain id whose EIP-155 `v` (`chain_id * 2 + 36`) fits in a u64
pub const MAX_CHAIN_ID: u64 = (u64::MAX - 36) / 2;

/// Envelope kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxKind {
    Legacy,
    Eip1559,
}

impl TxKind {
    pub fn type_byte(&self) -> u8 {
        match self {
            TxKind::Legacy => 0,
            TxKind::Eip1559 => EIP1559_TX_TYPE,
        }
    }
}

impl TransactionRequest {
    /// Resolve the envelope kind from `type`, falling back to fee fields
    pub fn kind(&self) -> Result<TxKind> {
        let Some(tx_type) = &self.tx_type else {
            return Ok(if self.max_fee_per_gas.is_some() {
                TxKind::Eip1559
            } else {
                TxKind::Legacy
            });
        };

        let kind = match tx_type {
            Value::Number(n) => match n.as_u64() {
                Some(0) => Some(TxKind::Legacy),
                Some(2) => Some(TxKind::Eip1559),
                _ => None,
            },
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "0" | "0x0" | "0x00" | "legacy" => Some(TxKind::Legacy),
                "2" | "0x2" | "0x02" | "eip1559" | "eip-1559" => Some(TxKind::Eip1559),
                _ => None,
            },
            _ => None,
        };

        kind.ok_or_else(|| {
            ProxyError::InvalidRequest(format!("unsupported transaction type: {}", tx_type))
        })
    }

    /// Destination address, `None` for contract creation
    pub fn to_address(&self) -> Result<Option<[u8; 20]>> {
        match self.to.as_deref() {
            None | Some("") => Ok(None),
            Some(addr) => parse_address(addr).map(Some),
        }
    }

    /// Call data bytes (empty when absent)
    pub fn data_bytes(&self) -> Result<Vec<u8>> {
        match self.data.as_deref() {
            None => Ok(vec![]),
            Some(data) => {
                let stripped = data.strip_prefix("0x").unwrap_or(data);
                hex::decode(stripped)
                    .map_err(|e| ProxyError::InvalidRequest(format!("invalid data: {}", e)))
            }
        }
    }

    /// Validate and build the typed transaction
    pub fn build(&self) -> Result<TypedTransaction> {
        let chain_id = required(&self.chain_id, "chainId")?.to_u64()?;
        if chain_id > MAX_CHAIN_ID {
            return Err(ProxyError::InvalidRequest(format!(
                "chainId {} exceeds {}",
                chain_id, MAX_CHAIN_ID
            )));
        }
        let gas_limit = required(&self.gas, "gas")?.to_u64()?;
        let nonce = optional_u64(&self.nonce)?;
        let value = optional_biguint(&self.value)?;
        let to = self.to_address()?;
        let data = self.data_bytes()?;

        match self.kind()? {
            TxKind::Legacy => Ok(TypedTransaction::Legacy(LegacyTransaction {
                nonce,
                gas_price: required(&self.gas_price, "gasPrice")?.to_biguint()?,
                gas_limit,
                to,
                value,
                data,
                chain_id,
            })),
            TxKind::Eip1559 => Ok(TypedTransaction::Eip1559(Eip1559Transaction {
                chain_id,
                nonce,
                max_priority_fee_per_gas: optional_biguint(&self.max_priority_fee_per_gas)?,
                max_fee_per_gas: required(&self.max_fee_per_gas, "maxFeePerGas")?.to_biguint()?,
                gas_limit,
                to,
                value,
                data,
            })),
        }
    }
}

fn required<'a>(field: &'a Option<Quantity>, name: &str) -> Result<&'a Quantity> {
    field
        .as_ref()
        .ok_or_else(|| ProxyError::InvalidRequest(format!("missing transaction field: {}", name)))
}

fn optional_u64(field: &Option<Quantity>) -> Result<u64> {
    field.as_ref().map_or(Ok(0), Quantity::to_u64)
}

fn optional_biguint(field: &Option<Quantity>) -> Result<BigUint> {
    field.as_ref().map_or(Ok(BigUint::zero()), Quantity::to_biguint)
}

fn u64_to_be_bytes_trimmed(value: u64) -> Vec<u8> {
    if value == 0 {
        return vec![];
    }
    let bytes = value.to_be_bytes();
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(8);
    bytes[start..].to_vec()
}

/// Signature scalars are RLP integers, so leading zeros go
fn scalar_trimmed(bytes: &[u8; 32]) -> &[u8] {
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(32);
    &bytes[start..]
}

fn append_to(stream: &mut RlpStream, to: &Option<[u8; 20]>) {
    match to {
        Some(addr) => stream.append(&addr.as_slice()),
        None => stream.append_empty_data(),
    };
}

/// Legacy transaction with EIP-155 replay protection
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyTransaction {
    pub nonce: u64,
    pub gas_price: BigUint,
    pub gas_limit: u64,
    pub to: Option<[u8; 20]>,
    pub value: BigUint,
    pub data: Vec<u8>,
    pub chain_id: u64,
}

impl LegacyTransaction {
    fn append_body(&self, stream: &mut RlpStream) {
        stream.append(&u64_to_be_bytes_trimmed(self.nonce).as_slice());
        stream.append(&to_be_bytes_trimmed(&self.gas_price).as_slice());
        stream.append(&u64_to_be_bytes_trimmed(self.gas_limit).as_slice());
        append_to(stream, &self.to);
        stream.append(&to_be_bytes_trimmed(&self.value).as_slice());
        stream.append(&self.data);
    }

    /// RLP encode for signing (EIP-155)
    pub fn rlp_unsigned(&self) -> Vec<u8> {
        let mut stream = RlpStream::new_list(9);
        self.append_body(&mut stream);
        stream.append(&u64_to_be_bytes_trimmed(self.chain_id).as_slice());
        stream.append_empty_data();
        stream.append_empty_data();
        stream.out().to_vec()
    }

    pub fn rlp_signed(&self, signature: &EthSignature) -> Vec<u8> {
        let mut stream = RlpStream::new_list(9);
        self.append_body(&mut stream);
        stream.append(&u64_to_be_bytes_trimmed(signature.v_eip155(self.chain_id)).as_slice());
        stream.append(&scalar_trimmed(&signature.r));
        stream.append(&scalar_trimmed(&signature.s));
        stream.out().to_vec()
    }
}

/// EIP-1559 dynamic fee transaction (empty access list)
#[derive(Debug, Clone, PartialEq)]
pub struct Eip1559Transaction {
    pub chain_id: u64,
    pub nonce: u64,
    pub max_priority_fee_per_gas: BigUint,
    pub max_fee_per_gas: BigUint,
    pub gas_limit: u64,
    pub to: Option<[u8; 20]>,
    pub value: BigUint,
    pub data: Vec<u8>,
}

impl Eip1559Transaction {
    fn append_body(&self, stream: &mut RlpStream) {
        stream.append(&u64_to_be_bytes_trimmed(self.chain_id).as_slice());
        stream.append(&u64_to_be_bytes_trimmed(self.nonce).as_slice());
        stream.append(&to_be_bytes_trimmed(&self.max_priority_fee_per_gas).as_slice());
        stream.append(&to_be_bytes_trimmed(&self.max_fee_per_gas).as_slice());
        stream.append(&u64_to_be_bytes_trimmed(self.gas_limit).as_slice());
        append_to(stream, &self.to);
        stream.append(&to_be_bytes_trimmed(&self.value).as_slice());
        stream.append(&self.data);
        stream.begin_list(0);
    }

    pub fn rlp_unsigned(&self) -> Vec<u8> {
        let mut stream = RlpStream::new_list(9);
        self.append_body(&mut stream);

        let mut result = vec![EIP1559_TX_TYPE];
        result.extend(stream.out());
        result
    }

    pub fn rlp_signed(&self, signature: &EthSignature) -> Vec<u8> {
        let mut stream = RlpStream::new_list(12);
        self.append_body(&mut stream);
        stream.append(&u64_to_be_bytes_trimmed(signature.v as u64).as_slice());
        stream.append(&scalar_trimmed(&signature.r));
        stream.append(&scalar_trimmed(&signature.s));

        let mut result = vec![EIP1559_TX_TYPE];
        result.extend(stream.out());
        result
    }
}

/// A transaction ready to be signed
#[derive(Debug, Clone, PartialEq)]
pub enum TypedTransaction {
    Legacy(LegacyTransaction),
    Eip1559(Eip1559Transaction),
}

impl TypedTransaction {
    pub fn kind(&self) -> TxKind {
        match self {
            TypedTransaction::Legacy(_) => TxKind::Legacy,
            TypedTransaction::Eip1559(_) => TxKind::Eip1559,
        }
    }

    /// Digest the signer commits to
    pub fn signing_hash(&self) -> [u8; 32] {
        match self {
            TypedTransaction::Legacy(tx) => keccak256(&tx.rlp_unsigned()),
            TypedTransaction::Eip1559(tx) => keccak256(&tx.rlp_unsigned()),
        }
    }

    /// Attach a signature and produce the broadcastable encoding
    pub fn into_signed(self, signature: &EthSignature) -> SignedTransaction {
        let raw = match &self {
            TypedTransaction::Legacy(tx) => tx.rlp_signed(signature),
            TypedTransaction::Eip1559(tx) => tx.rlp_signed(signature),
        };
        SignedTransaction::from_raw(raw)
    }
}

/// Signed transaction output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedTransaction {
    /// `0x`-prefixed raw transaction
    pub signed_transaction: String,

    /// `0x`-prefixed transaction hash
    pub hash: String,
}

impl SignedTransaction {
    fn from_raw(raw: Vec<u8>) -> Self {
        Self {
            hash: format!("0x{}", hex::encode(keccak256(&raw))),
            signed_transaction: format!("0x{}", hex::encode(raw)),
        }
    }
}
