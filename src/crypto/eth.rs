//! Ethereum cryptographic utilities
//!
//! Provides:
//! - Key generation and derivation
//! - Message signing (EIP-191)
//! - Prehash signing for transactions and authorizations
//! - Address derivation

use crate::errors::{ProxyError, Result};
use k256::{
    ecdsa::SigningKey,
    elliptic_curve::sec1::ToEncodedPoint,
    SecretKey,
};
use sha3::{Digest, Keccak256};

/// Ethereum key pair
pub struct EthKeyPair {
    signing_key: SigningKey,
}

impl EthKeyPair {
    /// Create a new random key pair
    pub fn generate() -> Self {
        let signing_key = SigningKey::random(&mut rand::thread_rng());
        Self { signing_key }
    }

    /// Create from raw private key bytes (32 bytes)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 32 {
            return Err(ProxyError::SigningFailed(format!(
                "Expected 32 byte private key, got {}",
                bytes.len()
            )));
        }

        let secret_key = SecretKey::from_slice(bytes)
            .map_err(|_| ProxyError::SigningFailed("Invalid secp256k1 scalar".to_string()))?;

        Ok(Self {
            signing_key: SigningKey::from(secret_key),
        })
    }

    /// Get the Ethereum address (20 bytes)
    pub fn address(&self) -> [u8; 20] {
        let verifying_key = self.signing_key.verifying_key();
        let pubkey = verifying_key.to_encoded_point(false);
        // Skip the 0x04 prefix and hash the remaining 64 bytes
        let hash = Keccak256::digest(&pubkey.as_bytes()[1..]);
        let mut address = [0u8; 20];
        address.copy_from_slice(&hash[12..]);
        address
    }

    /// Get the checksummed Ethereum address string
    pub fn address_checksum(&self) -> String {
        checksum_address(&self.address())
    }

    /// Sign a 32 byte digest
    pub fn sign_hash(&self, hash: &[u8; 32]) -> Result<EthSignature> {
        let (signature, recovery_id) = self
            .signing_key
            .sign_prehash_recoverable(hash)
            .map_err(|e| ProxyError::SigningFailed(e.to_string()))?;

        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&signature.r().to_bytes());
        s.copy_from_slice(&signature.s().to_bytes());

        Ok(EthSignature {
            r,
            s,
            v: recovery_id.to_byte(),
        })
    }

    /// Sign a message with EIP-191 personal sign
    pub fn sign_message(&self, message: &[u8]) -> Result<EthSignature> {
        self.sign_hash(&hash_message(message))
    }

    /// Export the private key bytes for encryption at rest
    pub fn private_key_bytes(&self) -> crate::security::SecureBytes {
        crate::security::SecureBytes::new(self.signing_key.to_bytes().to_vec())
    }
}

/// Ethereum signature with recovery id (0 or 1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthSignature {
    pub r: [u8; 32],
    pub s: [u8; 32],
    pub v: u8,
}

impl EthSignature {
    /// 65 bytes `r || s || v` with v in legacy 27/28 form
    pub fn to_bytes_legacy(&self) -> [u8; 65] {
        let mut sig = [0u8; 65];
        sig[0..32].copy_from_slice(&self.r);
        sig[32..64].copy_from_slice(&self.s);
        sig[64] = self.v_legacy();
        sig
    }

    /// Get v for legacy signatures (27/28)
    pub fn v_legacy(&self) -> u8 {
        self.v + 27
    }

    /// Get v for EIP-155 transactions
    pub fn v_eip155(&self, chain_id: u64) -> u64 {
        self.v as u64 + 35 + chain_id * 2
    }

    /// `0x`-prefixed hex of the 65 byte legacy form
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.to_bytes_legacy()))
    }
}

/// Hash a message according to EIP-191 (personal sign)
pub fn hash_message(message: &[u8]) -> [u8; 32] {
    let prefix = format!("\x19Ethereum Signed Message:\n{}", message.len());
    let mut hasher = Keccak256::new();
    hasher.update(prefix.as_bytes());
    hasher.update(message);
    hasher.finalize().into()
}

/// Compute keccak256 hash
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

/// Convert an address to checksummed format (EIP-55)
pub fn checksum_address(address: &[u8; 20]) -> String {
    let addr_hex = hex::encode(address);
    let hash = hex::encode(Keccak256::digest(addr_hex.as_bytes()));

    let mut result = String::with_capacity(42);
    result.push_str("0x");

    for (c, h) in addr_hex.chars().zip(hash.chars()) {
        if c.is_ascii_alphabetic() && h >= '8' {
            result.push(c.to_ascii_uppercase());
        } else {
            result.push(c);
        }
    }

    result
}

/// Parse a hex address string (with or without `0x`) to bytes
pub fn parse_address(addr: &str) -> Result<[u8; 20]> {
    let addr = addr.strip_prefix("0x").unwrap_or(addr);

    if addr.len() != 40 {
        return Err(ProxyError::InvalidRequest(
            "Address must be 40 hex chars".to_string(),
        ));
    }

    let bytes = hex::decode(addr)?;
    let mut result = [0u8; 20];
    result.copy_from_slice(&bytes);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};

    #[test]
    fn test_address_checksum() {
        // Test vector from EIP-55
        let address = parse_address("5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed").unwrap();
        assert_eq!(
            checksum_address(&address),
            "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed"
        );
    }

    #[test]
    fn test_known_private_key_address() {
        // Hardhat / Anvil account #0
        let key = hex::decode("ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80")
            .unwrap();
        let keypair = EthKeyPair::from_bytes(&key).unwrap();
        assert_eq!(
            keypair.address_checksum(),
            "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266"
        );
    }

    #[test]
    fn test_message_signature_recovers_signer() {
        let keypair = EthKeyPair::generate();
        let message = b"Hello, Ethereum!";

        let sig = keypair.sign_message(message).unwrap();
        assert!(sig.v <= 1);
        assert_eq!(sig.to_hex().len(), 132);

        let mut rs = [0u8; 64];
        rs[..32].copy_from_slice(&sig.r);
        rs[32..].copy_from_slice(&sig.s);
        let signature = Signature::from_slice(&rs).unwrap();
        let recid = RecoveryId::from_byte(sig.v).unwrap();
        let recovered =
            VerifyingKey::recover_from_prehash(&hash_message(message), &signature, recid).unwrap();
        assert_eq!(&recovered, keypair.signing_key.verifying_key());
    }

    #[test]
    fn test_rejects_short_key() {
        assert!(EthKeyPair::from_bytes(&[1u8; 31]).is_err());
        assert!(EthKeyPair::from_bytes(&[0u8; 32]).is_err());
    }
}
