//! Cryptographic utilities for Ethereum accounts

pub mod eth;

pub use eth::{checksum_address, hash_message, keccak256, parse_address, EthKeyPair, EthSignature};
