//! Contract interface descriptions and call data decoding
//!
//! Accepts the usual JSON ABI shapes (an array of entries, an object with
//! an `abi` array, a single function entry, or any of those as a JSON
//! string) and decodes call data with the standard head/tail layout.

use crate::crypto::keccak256;
use crate::errors::{ProxyError, Result};
use crate::policy::context::{CallFacts, FactValue};
use num_bigint::{BigInt, BigUint, Sign};
use serde::Deserialize;
use serde_json::Value;

const WORD: usize = 32;

/// Deepest array/tuple nesting accepted in a parameter type
pub const MAX_TYPE_DEPTH: usize = 32;

/// Solidity parameter type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamType {
    Address,
    Bool,
    Uint(usize),
    Int(usize),
    FixedBytes(usize),
    Bytes,
    String,
    Array(Box<ParamType>),
    FixedArray(Box<ParamType>, usize),
    Tuple(Vec<ParamType>),
}

impl ParamType {
    /// Parse a type string; `components` describe `tuple` types
    fn parse(ty: &str, components: &[AbiParamEntry], depth: usize) -> Result<Self> {
        if depth > MAX_TYPE_DEPTH {
            return Err(decode_err(format!(
                "type nesting deeper than {}",
                MAX_TYPE_DEPTH
            )));
        }
        let ty = ty.trim();

        if let Some(open) = ty.rfind('[') {
            if !ty.ends_with(']') {
                return Err(decode_err(format!("bad type: {}", ty)));
            }
            let inner = ParamType::parse(&ty[..open], components, depth + 1)?;
            let size = &ty[open + 1..ty.len() - 1];
            return if size.is_empty() {
                Ok(ParamType::Array(Box::new(inner)))
            } else {
                let n = size
                    .parse::<usize>()
                    .map_err(|_| decode_err(format!("bad array size: {}", ty)))?;
                Ok(ParamType::FixedArray(Box::new(inner), n))
            };
        }

        match ty {
            "address" => Ok(ParamType::Address),
            "bool" => Ok(ParamType::Bool),
            "string" => Ok(ParamType::String),
            "bytes" => Ok(ParamType::Bytes),
            "uint" => Ok(ParamType::Uint(256)),
            "int" => Ok(ParamType::Int(256)),
            "tuple" => components
                .iter()
                .map(|component| component.param_type(depth + 1))
                .collect::<Result<Vec<_>>>()
                .map(ParamType::Tuple),
            _ => {
                if let Some(bits) = ty.strip_prefix("uint") {
                    parse_bits(bits, ty).map(ParamType::Uint)
                } else if let Some(bits) = ty.strip_prefix("int") {
                    parse_bits(bits, ty).map(ParamType::Int)
                } else if let Some(size) = ty.strip_prefix("bytes") {
                    match size.parse::<usize>() {
                        Ok(n) if (1..=32).contains(&n) => Ok(ParamType::FixedBytes(n)),
                        _ => Err(decode_err(format!("bad type: {}", ty))),
                    }
                } else {
                    Err(decode_err(format!("unsupported type: {}", ty)))
                }
            }
        }
    }

    /// Canonical name used in the function signature
    pub fn canonical(&self) -> String {
        match self {
            ParamType::Address => "address".to_string(),
            ParamType::Bool => "bool".to_string(),
            ParamType::Uint(bits) => format!("uint{}", bits),
            ParamType::Int(bits) => format!("int{}", bits),
            ParamType::FixedBytes(n) => format!("bytes{}", n),
            ParamType::Bytes => "bytes".to_string(),
            ParamType::String => "string".to_string(),
            ParamType::Array(inner) => format!("{}[]", inner.canonical()),
            ParamType::FixedArray(inner, n) => format!("{}[{}]", inner.canonical(), n),
            ParamType::Tuple(items) => format!(
                "({})",
                items.iter().map(ParamType::canonical).collect::<Vec<_>>().join(",")
            ),
        }
    }

    fn is_dynamic(&self) -> bool {
        match self {
            ParamType::Bytes | ParamType::String | ParamType::Array(_) => true,
            ParamType::FixedArray(inner, _) => inner.is_dynamic(),
            ParamType::Tuple(items) => items.iter().any(ParamType::is_dynamic),
            _ => false,
        }
    }

    /// Bytes taken in the head of the enclosing encoding
    fn head_size(&self) -> usize {
        if self.is_dynamic() {
            return WORD;
        }
        match self {
            ParamType::FixedArray(inner, n) => inner.head_size().saturating_mul(*n),
            ParamType::Tuple(items) => items.iter().map(ParamType::head_size).sum(),
            _ => WORD,
        }
    }
}

fn parse_bits(bits: &str, ty: &str) -> Result<usize> {
    match bits.parse::<usize>() {
        Ok(n) if n > 0 && n <= 256 && n % 8 == 0 => Ok(n),
        _ => Err(decode_err(format!("bad type: {}", ty))),
    }
}

fn decode_err(msg: impl Into<String>) -> ProxyError {
    ProxyError::DecodeFailed(msg.into())
}

#[derive(Debug, Clone, Deserialize)]
struct AbiParamEntry {
    #[serde(default)]
    name: String,
    #[serde(rename = "type")]
    ty: String,
    #[serde(default)]
    components: Vec<AbiParamEntry>,
}

impl AbiParamEntry {
    fn param_type(&self, depth: usize) -> Result<ParamType> {
        ParamType::parse(&self.ty, &self.components, depth)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct AbiEntry {
    #[serde(rename = "type", default = "default_entry_type")]
    ty: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    inputs: Vec<AbiParamEntry>,
}

fn default_entry_type() -> String {
    "function".to_string()
}

/// A callable function from an interface description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbiFunction {
    pub name: String,
    pub inputs: Vec<(String, ParamType)>,
}

impl AbiFunction {
    /// `name(type1,type2,...)`
    pub fn signature(&self) -> String {
        format!(
            "{}({})",
            self.name,
            self.inputs
                .iter()
                .map(|(_, ty)| ty.canonical())
                .collect::<Vec<_>>()
                .join(",")
        )
    }

    pub fn selector(&self) -> [u8; 4] {
        let hash = keccak256(self.signature().as_bytes());
        [hash[0], hash[1], hash[2], hash[3]]
    }
}

/// Parsed interface description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Abi {
    pub functions: Vec<AbiFunction>,
}

impl Abi {
    pub fn parse(value: &Value) -> Result<Self> {
        let entries: Vec<AbiEntry> = match value {
            Value::String(json) => {
                let inner: Value = serde_json::from_str(json)
                    .map_err(|e| decode_err(format!("abi is not JSON: {}", e)))?;
                return Abi::parse(&inner);
            }
            Value::Array(_) => serde_json::from_value(value.clone())
                .map_err(|e| decode_err(format!("bad abi: {}", e)))?,
            Value::Object(map) => match map.get("abi") {
                Some(inner) => return Abi::parse(inner),
                None => vec![serde_json::from_value(value.clone())
                    .map_err(|e| decode_err(format!("bad abi entry: {}", e)))?],
            },
            _ => return Err(decode_err("abi must be an array or object")),
        };

        let functions = entries
            .into_iter()
            .filter(|entry| entry.ty == "function" && !entry.name.is_empty())
            .map(|entry| {
                let inputs = entry
                    .inputs
                    .iter()
                    .map(|param| Ok((param.name.clone(), param.param_type(0)?)))
                    .collect::<Result<Vec<_>>>()?;
                Ok(AbiFunction {
                    name: entry.name,
                    inputs,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { functions })
    }

    /// Find the function matching the selector and decode its arguments
    pub fn decode_call(&self, data: &[u8]) -> Result<DecodedCall> {
        if data.len() < 4 {
            return Err(decode_err("call data shorter than a selector"));
        }
        let selector = [data[0], data[1], data[2], data[3]];

        let function = self
            .functions
            .iter()
            .find(|f| f.selector() == selector)
            .ok_or_else(|| decode_err(format!("unknown selector 0x{}", hex::encode(selector))))?;

        let types: Vec<ParamType> = function.inputs.iter().map(|(_, ty)| ty.clone()).collect();
        let values = decode_params(&types, &data[4..])?;

        Ok(DecodedCall {
            name: function.name.clone(),
            selector,
            params: function
                .inputs
                .iter()
                .map(|(name, _)| name.clone())
                .zip(values)
                .collect(),
        })
    }
}

/// A decoded ABI value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Address([u8; 20]),
    Bool(bool),
    Uint(BigUint),
    Int(BigInt),
    FixedBytes(Vec<u8>),
    Bytes(Vec<u8>),
    String(String),
    Array(Vec<Token>),
    Tuple(Vec<Token>),
}

impl Token {
    /// Policy-facing rendering: numbers stay numeric, addresses lowercase
    pub fn to_fact(&self) -> FactValue {
        match self {
            Token::Uint(n) => FactValue::from(n),
            Token::Int(n) => FactValue::Number(n.clone()),
            Token::Bool(b) => FactValue::Bool(*b),
            other => FactValue::Text(other.render()),
        }
    }

    fn render(&self) -> String {
        match self {
            Token::Address(addr) => format!("0x{}", hex::encode(addr)),
            Token::Bool(b) => b.to_string(),
            Token::Uint(n) => n.to_string(),
            Token::Int(n) => n.to_string(),
            Token::FixedBytes(b) | Token::Bytes(b) => format!("0x{}", hex::encode(b)),
            Token::String(s) => s.clone(),
            Token::Array(items) => format!(
                "[{}]",
                items.iter().map(Token::render).collect::<Vec<_>>().join(",")
            ),
            Token::Tuple(items) => format!(
                "({})",
                items.iter().map(Token::render).collect::<Vec<_>>().join(",")
            ),
        }
    }
}

/// Result of decoding call data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedCall {
    pub name: String,
    pub selector: [u8; 4],
    pub params: Vec<(String, Token)>,
}

impl DecodedCall {
    pub fn into_facts(self) -> CallFacts {
        CallFacts {
            selector: format!("0x{}", hex::encode(self.selector)),
            params: self
                .params
                .iter()
                .map(|(name, token)| (name.clone(), token.to_fact()))
                .collect(),
            function: self.name,
        }
    }
}

fn word(data: &[u8], at: usize) -> Result<&[u8]> {
    at.checked_add(WORD)
        .and_then(|end| data.get(at..end))
        .ok_or_else(|| decode_err("call data truncated"))
}

fn read_usize(data: &[u8], at: usize) -> Result<usize> {
    let w = word(data, at)?;
    if w[..24].iter().any(|&b| b != 0) {
        return Err(decode_err("offset or length out of range"));
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&w[24..]);
    usize::try_from(u64::from_be_bytes(buf)).map_err(|_| decode_err("offset out of range"))
}

fn decode_params(types: &[ParamType], data: &[u8]) -> Result<Vec<Token>> {
    let mut tokens = Vec::with_capacity(types.len());
    let mut head = 0usize;

    for ty in types {
        let token = if ty.is_dynamic() {
            let offset = read_usize(data, head)?;
            decode_value(ty, data, offset)?
        } else {
            decode_value(ty, data, head)?
        };
        head = head
            .checked_add(ty.head_size())
            .ok_or_else(|| decode_err("head overflow"))?;
        tokens.push(token);
    }

    Ok(tokens)
}

fn tail(data: &[u8], at: usize) -> Result<&[u8]> {
    data.get(at..).ok_or_else(|| decode_err("offset past end of data"))
}

fn decode_value(ty: &ParamType, data: &[u8], at: usize) -> Result<Token> {
    match ty {
        ParamType::Address => {
            let w = word(data, at)?;
            let mut addr = [0u8; 20];
            addr.copy_from_slice(&w[12..]);
            Ok(Token::Address(addr))
        }
        ParamType::Bool => Ok(Token::Bool(word(data, at)?.iter().any(|&b| b != 0))),
        ParamType::Uint(_) => Ok(Token::Uint(BigUint::from_bytes_be(word(data, at)?))),
        ParamType::Int(_) => {
            let w = word(data, at)?;
            let value = if w[0] & 0x80 != 0 {
                // two's complement over 256 bits
                let magnitude = BigUint::from_bytes_be(w);
                BigInt::from(magnitude) - (BigInt::from(1u8) << 256usize)
            } else {
                BigInt::from_bytes_be(Sign::Plus, w)
            };
            Ok(Token::Int(value))
        }
        ParamType::FixedBytes(n) => Ok(Token::FixedBytes(word(data, at)?[..*n].to_vec())),
        ParamType::Bytes | ParamType::String => {
            let len = read_usize(data, at)?;
            let start = at + WORD;
            let bytes = start
                .checked_add(len)
                .and_then(|end| data.get(start..end))
                .ok_or_else(|| decode_err("dynamic value truncated"))?;
            if *ty == ParamType::String {
                Ok(Token::String(String::from_utf8_lossy(bytes).into_owned()))
            } else {
                Ok(Token::Bytes(bytes.to_vec()))
            }
        }
        ParamType::Array(inner) => {
            let len = read_usize(data, at)?;
            let body = tail(data, at + WORD)?;
            // Each element needs at least one word; rejects absurd lengths early
            if len.saturating_mul(WORD) > body.len() {
                return Err(decode_err("array length exceeds call data"));
            }
            let types = vec![(**inner).clone(); len];
            decode_params(&types, body).map(Token::Array)
        }
        ParamType::FixedArray(inner, n) => {
            let body = tail(data, at)?;
            if n.saturating_mul(WORD) > body.len() {
                return Err(decode_err("array length exceeds call data"));
            }
            let types = vec![(**inner).clone(); *n];
            decode_params(&types, body).map(Token::Array)
        }
        ParamType::Tuple(items) => decode_params(items, tail(data, at)?).map(Token::Tuple),
    }
}
