//! Numeric request fields
//!
//! Callers send amounts as JSON numbers, decimal strings or `0x` hex
//! strings. Everything is normalized to an arbitrary-precision integer so
//! wei values never pass through floating point.

use crate::errors::{ProxyError, Result};
use num_bigint::BigUint;
use num_traits::{ToPrimitive, Zero};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A numeric field as supplied by the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Quantity {
    Number(u64),
    Text(String),
}

impl Quantity {
    /// Parse into an unsigned big integer
    pub fn to_biguint(&self) -> Result<BigUint> {
        match self {
            Quantity::Number(n) => Ok(BigUint::from(*n)),
            Quantity::Text(s) => parse_biguint(s)
                .ok_or_else(|| ProxyError::InvalidRequest(format!("invalid quantity: {}", s))),
        }
    }

    /// Parse into a u64, rejecting larger values
    pub fn to_u64(&self) -> Result<u64> {
        self.to_biguint()?
            .to_u64()
            .ok_or_else(|| ProxyError::InvalidRequest(format!("{} does not fit in 64 bits", self)))
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quantity::Number(n) => write!(f, "{}", n),
            Quantity::Text(s) => f.write_str(s),
        }
    }
}

impl From<u64> for Quantity {
    fn from(n: u64) -> Self {
        Quantity::Number(n)
    }
}

impl From<&str> for Quantity {
    fn from(s: &str) -> Self {
        Quantity::Text(s.to_string())
    }
}

/// Parse a decimal or `0x`-prefixed hex string
pub fn parse_biguint(s: &str) -> Option<BigUint> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        if hex.is_empty() {
            return Some(BigUint::zero());
        }
        if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        return BigUint::parse_bytes(hex.as_bytes(), 16);
    }
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    BigUint::parse_bytes(s.as_bytes(), 10)
}

/// Big-endian bytes with leading zeros stripped (zero encodes as empty)
pub fn to_be_bytes_trimmed(value: &BigUint) -> Vec<u8> {
    if value.is_zero() {
        return vec![];
    }
    value.to_bytes_be()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_and_decimal_agree() {
        let hex = Quantity::from("0x1bc16d674ec80000");
        let dec = Quantity::from("2000000000000000000");
        assert_eq!(hex.to_biguint().unwrap(), dec.to_biguint().unwrap());
        assert_eq!(hex.to_biguint().unwrap().to_str_radix(10), "2000000000000000000");
    }

    #[test]
    fn test_wide_hex_keeps_precision() {
        // 30 hex digits, far beyond u64 and f64 precision
        let q = Quantity::from("0xffffffffffffffffffffffffffffff");
        assert_eq!(
            q.to_biguint().unwrap().to_str_radix(10),
            "1329227995784915872903807060280344575"
        );
        assert!(q.to_u64().is_err());
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(Quantity::from("12abc").to_biguint().is_err());
        assert!(Quantity::from("-5").to_biguint().is_err());
        assert!(Quantity::from("0xzz").to_biguint().is_err());
        assert!(Quantity::from("").to_biguint().is_err());
    }

    #[test]
    fn test_untagged_deserialize() {
        let n: Quantity = serde_json::from_str("21000").unwrap();
        let s: Quantity = serde_json::from_str("\"0x5208\"").unwrap();
        assert_eq!(n.to_u64().unwrap(), 21000);
        assert_eq!(s.to_u64().unwrap(), 21000);
        assert!(to_be_bytes_trimmed(&BigUint::zero()).is_empty());
    }
}
