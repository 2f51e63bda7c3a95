//! Keystore codec
//!
//! Encodes and decodes the Web3 Secret Storage "V3" key file: scrypt key
//! derivation, AES-128-CTR encryption and a keccak256 MAC over the second
//! half of the derived key and the ciphertext.
//!
//! The MAC is always verified (in constant time) before any byte of the
//! ciphertext is decrypted. A wrong password and a tampered file produce
//! the same error.

use crate::errors::{ProxyError, Result};
use crate::crypto::keccak256;
use crate::security::SecureBytes;
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use uuid::Uuid;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

/// Format version written and accepted by this codec
pub const KEYSTORE_VERSION: u32 = 3;

const CIPHER: &str = "aes-128-ctr";
const KDF: &str = "scrypt";

/// Salt size for scrypt
const SALT_SIZE: usize = 32;

/// IV size for AES-128-CTR
const IV_SIZE: usize = 16;

/// Derived key length: 16 bytes cipher key + 16 bytes MAC key
const DKLEN: usize = 32;

/// Private key length accepted by the codec
const PRIVATE_KEY_SIZE: usize = 32;

/// scrypt cost preset used when creating a keystore
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KdfCost {
    /// n = 2^18, r = 8, p = 1
    Standard,
    /// n = 2^12, r = 8, p = 6
    Light,
}

impl KdfCost {
    /// (n, r, p)
    pub fn params(self) -> (u32, u32, u32) {
        match self {
            KdfCost::Standard => (262_144, 8, 1),
            KdfCost::Light => (4_096, 8, 6),
        }
    }
}

/// V3 keystore record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeystoreV3 {
    pub version: u32,

    /// Random UUID v4
    pub id: String,

    /// Account address, lowercase hex without `0x`
    #[serde(default)]
    pub address: String,

    #[serde(alias = "Crypto")]
    pub crypto: CryptoSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoSection {
    pub ciphertext: String,
    pub cipherparams: CipherParams,
    pub cipher: String,
    pub kdf: String,
    pub kdfparams: ScryptParams,
    pub mac: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CipherParams {
    pub iv: String,
}

/// scrypt parameters. Fields default to zero so that records using a
/// different KDF still parse and are rejected by tag, not by shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScryptParams {
    #[serde(default)]
    pub dklen: u32,
    #[serde(default)]
    pub salt: String,
    #[serde(default)]
    pub n: u32,
    #[serde(default)]
    pub r: u32,
    #[serde(default)]
    pub p: u32,
}

impl KeystoreV3 {
    /// Encrypt a private key under `password`
    pub fn encrypt(
        private_key: &[u8],
        address: &[u8; 20],
        password: &str,
        cost: KdfCost,
    ) -> Result<Self> {
        if private_key.len() != PRIVATE_KEY_SIZE {
            return Err(ProxyError::UnsupportedFormat(format!(
                "private key must be {} bytes",
                PRIVATE_KEY_SIZE
            )));
        }

        let mut rng = rand::thread_rng();
        let mut salt = [0u8; SALT_SIZE];
        rng.fill_bytes(&mut salt);
        let mut iv = [0u8; IV_SIZE];
        rng.fill_bytes(&mut iv);

        let (n, r, p) = cost.params();
        let derived = derive_key(password, &salt, n, r, p, DKLEN)?;

        let mut ciphertext = private_key.to_vec();
        apply_ctr(&derived.expose()[..16], &iv, &mut ciphertext)?;
        let mac = compute_mac(&derived.expose()[16..32], &ciphertext);

        Ok(Self {
            version: KEYSTORE_VERSION,
            id: Uuid::new_v4().to_string(),
            address: hex::encode(address),
            crypto: CryptoSection {
                ciphertext: hex::encode(&ciphertext),
                cipherparams: CipherParams {
                    iv: hex::encode(iv),
                },
                cipher: CIPHER.to_string(),
                kdf: KDF.to_string(),
                kdfparams: ScryptParams {
                    dklen: DKLEN as u32,
                    salt: hex::encode(salt),
                    n,
                    r,
                    p,
                },
                mac: hex::encode(mac),
            },
        })
    }

    /// Decrypt the private key.
    ///
    /// `max_n` bounds the scrypt cost a record may demand.
    pub fn decrypt(&self, password: &str, max_n: u32) -> Result<SecureBytes> {
        if self.version != KEYSTORE_VERSION {
            return Err(ProxyError::UnsupportedFormat(format!(
                "version {}",
                self.version
            )));
        }
        if !self.crypto.cipher.eq_ignore_ascii_case(CIPHER) {
            return Err(ProxyError::UnsupportedFormat(format!(
                "cipher {}",
                self.crypto.cipher
            )));
        }
        if !self.crypto.kdf.eq_ignore_ascii_case(KDF) {
            return Err(ProxyError::UnsupportedFormat(format!(
                "kdf {}",
                self.crypto.kdf
            )));
        }

        let params = &self.crypto.kdfparams;
        if params.n < 2 || !params.n.is_power_of_two() || params.n > max_n {
            return Err(ProxyError::UnsupportedFormat(format!(
                "scrypt n {}",
                params.n
            )));
        }
        if params.r == 0 || params.p == 0 || (params.dklen as usize) < DKLEN {
            return Err(ProxyError::UnsupportedFormat(
                "scrypt parameters out of range".to_string(),
            ));
        }

        let salt = decode_field("salt", &params.salt)?;
        let iv = decode_field("iv", &self.crypto.cipherparams.iv)?;
        let ciphertext = decode_field("ciphertext", &self.crypto.ciphertext)?;
        let mac = decode_field("mac", &self.crypto.mac)?;

        if iv.len() != IV_SIZE || mac.len() != 32 || ciphertext.len() != PRIVATE_KEY_SIZE {
            return Err(ProxyError::UnsupportedFormat(
                "unexpected field length".to_string(),
            ));
        }

        let derived = derive_key(
            password,
            &salt,
            params.n,
            params.r,
            params.p,
            params.dklen as usize,
        )?;

        let expected = compute_mac(&derived.expose()[16..32], &ciphertext);
        if !bool::from(expected[..].ct_eq(&mac[..])) {
            return Err(ProxyError::InvalidPassword);
        }

        let mut plaintext = SecureBytes::new(ciphertext);
        apply_ctr(&derived.expose()[..16], &iv, plaintext.expose_mut())?;
        Ok(plaintext)
    }

    /// Serialize as the on-disk JSON document
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse an on-disk JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| ProxyError::UnsupportedFormat(format!("malformed keystore: {}", e)))
    }
}

/// Run scrypt with explicit parameters into a zeroizing buffer
fn derive_key(
    password: &str,
    salt: &[u8],
    n: u32,
    r: u32,
    p: u32,
    dklen: usize,
) -> Result<SecureBytes> {
    let log_n = n.trailing_zeros() as u8;
    let params = scrypt::Params::new(log_n, r, p, dklen)
        .map_err(|e| ProxyError::UnsupportedFormat(format!("scrypt params: {}", e)))?;

    let mut output = SecureBytes::zeros(dklen);
    scrypt::scrypt(password.as_bytes(), salt, &params, output.expose_mut())
        .map_err(|e| ProxyError::InternalError(format!("scrypt: {}", e)))?;

    Ok(output)
}

fn apply_ctr(key: &[u8], iv: &[u8], buf: &mut [u8]) -> Result<()> {
    let mut cipher = Aes128Ctr::new_from_slices(key, iv)
        .map_err(|e| ProxyError::InternalError(format!("aes-128-ctr: {}", e)))?;
    cipher.apply_keystream(buf);
    Ok(())
}

/// keccak256(mac_key || ciphertext)
fn compute_mac(mac_key: &[u8], ciphertext: &[u8]) -> [u8; 32] {
    let mut preimage = Vec::with_capacity(mac_key.len() + ciphertext.len());
    preimage.extend_from_slice(mac_key);
    preimage.extend_from_slice(ciphertext);
    keccak256(&preimage)
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>> {
    let value = value.strip_prefix("0x").unwrap_or(value);
    hex::decode(value).map_err(|e| ProxyError::UnsupportedFormat(format!("{}: {}", name, e)))
}
