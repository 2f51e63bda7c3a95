//! Key storage and custody
//!
//! This module provides:
//! - The V3 keystore codec (scrypt + AES-128-CTR + keccak MAC)
//! - Atomic on-disk persistence of the keystore file
//! - The key custodian, the only holder of plaintext key material

pub mod custodian;
pub mod storage;
pub mod v3;

pub use custodian::KeyCustodian;
pub use storage::KeystoreStorage;
pub use v3::{KdfCost, KeystoreV3};
