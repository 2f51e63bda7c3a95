//! Key custodian
//!
//! The only component that ever sees plaintext key material. Every signing
//! call reads the keystore, derives the key, signs one digest and drops the
//! decrypted bytes before returning, on success and error paths alike.
//! Nothing decrypted is cached between calls; only the public address is.

use crate::config::Config;
use crate::crypto::{checksum_address, parse_address, EthKeyPair, EthSignature};
use crate::errors::{ProxyError, Result};
use crate::keystore::storage::KeystoreStorage;
use crate::keystore::v3::{KdfCost, KeystoreV3};
use crate::signer::{Authorization, SignedAuthorization, SignedTransaction, TypedTransaction};
use secrecy::{ExposeSecret, SecretString};
use std::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Owns access to the proxy's single signing key
pub struct KeyCustodian {
    storage: KeystoreStorage,
    password: SecretString,
    kdf_cost: KdfCost,
    max_kdf_n: u32,
    lock_memory: bool,
    address: RwLock<Option<[u8; 20]>>,
    create_guard: Mutex<()>,
}

impl KeyCustodian {
    pub fn new(
        storage: KeystoreStorage,
        password: SecretString,
        kdf_cost: KdfCost,
        max_kdf_n: u32,
        lock_memory: bool,
    ) -> Self {
        Self {
            storage,
            password,
            kdf_cost,
            max_kdf_n,
            lock_memory,
            address: RwLock::new(None),
            create_guard: Mutex::new(()),
        }
    }

    /// Build a custodian from the storage, keystore and security sections
    pub fn from_config(config: &Config, password: SecretString) -> Result<Self> {
        let storage = KeystoreStorage::new(&config.storage.keystore_path)?;
        Ok(Self::new(
            storage,
            password,
            config.keystore.kdf_cost,
            config.keystore.max_kdf_n,
            config.security.enable_mlock,
        ))
    }

    /// Whether a key has been provisioned
    pub fn has_account(&self) -> bool {
        self.storage.exists()
    }

    /// Generate and persist a fresh key, returning its checksummed address
    pub fn create_account(&self) -> Result<String> {
        let _guard = self
            .create_guard
            .lock()
            .map_err(|_| ProxyError::InternalError("custodian lock poisoned".to_string()))?;

        if self.storage.exists() {
            return Err(ProxyError::WalletExists);
        }

        let keypair = EthKeyPair::generate();
        let address = keypair.address();
        let keystore = KeystoreV3::encrypt(
            keypair.private_key_bytes().expose(),
            &address,
            self.password.expose_secret(),
            self.kdf_cost,
        )?;
        drop(keypair);

        self.storage.store(&keystore)?;
        self.cache_address(address)?;

        let checksummed = checksum_address(&address);
        info!("Created wallet {}", checksummed);
        Ok(checksummed)
    }

    /// Public address of the provisioned key
    pub fn address(&self) -> Result<[u8; 20]> {
        if let Some(address) = *self
            .address
            .read()
            .map_err(|_| ProxyError::InternalError("custodian lock poisoned".to_string()))?
        {
            return Ok(address);
        }

        let keystore = self.storage.load()?;
        let address = if keystore.address.is_empty() {
            // Records from other tools may omit the address; derive it once
            self.with_keystore_key(&keystore, |keypair| Ok(keypair.address()))?
        } else {
            parse_address(&keystore.address).map_err(|_| {
                ProxyError::UnsupportedFormat("keystore address is malformed".to_string())
            })?
        };

        self.cache_address(address)?;
        Ok(address)
    }

    /// Checksummed public address
    pub fn get_address(&self) -> Result<String> {
        Ok(checksum_address(&self.address()?))
    }

    /// EIP-191 personal signature over `message`
    pub fn sign_message(&self, message: &[u8]) -> Result<EthSignature> {
        let signature = self.with_key(|keypair| keypair.sign_message(message))?;
        debug!("Signed message of {} bytes", message.len());
        Ok(signature)
    }

    /// Sign a transaction and return its broadcastable encoding
    pub fn sign_transaction(&self, tx: TypedTransaction) -> Result<SignedTransaction> {
        let hash = tx.signing_hash();
        let signature = self.with_key(|keypair| keypair.sign_hash(&hash))?;
        let signed = tx.into_signed(&signature);
        debug!("Signed transaction {}", signed.hash);
        Ok(signed)
    }

    /// Sign an EIP-7702 authorization tuple
    pub fn sign_authorization(&self, authorization: Authorization) -> Result<SignedAuthorization> {
        let hash = authorization.signing_hash();
        let signature = self.with_key(|keypair| keypair.sign_hash(&hash))?;
        Ok(authorization.into_signed(&signature))
    }

    /// Decrypt the key, hand it to `op`, and drop it before returning
    fn with_key<T>(&self, op: impl FnOnce(&EthKeyPair) -> Result<T>) -> Result<T> {
        let keystore = self.storage.load()?;
        self.with_keystore_key(&keystore, op)
    }

    fn with_keystore_key<T>(
        &self,
        keystore: &KeystoreV3,
        op: impl FnOnce(&EthKeyPair) -> Result<T>,
    ) -> Result<T> {
        let secret = keystore
            .decrypt(self.password.expose_secret(), self.max_kdf_n)?
            .into_locked(self.lock_memory);
        let keypair = EthKeyPair::from_bytes(secret.as_slice())?;
        drop(secret);

        if !keystore.address.is_empty()
            && !keystore
                .address
                .trim_start_matches("0x")
                .eq_ignore_ascii_case(&hex::encode(keypair.address()))
        {
            warn!("Keystore address does not match the decrypted key");
            return Err(ProxyError::UnsupportedFormat(
                "keystore address does not match key".to_string(),
            ));
        }

        op(&keypair)
    }

    fn cache_address(&self, address: [u8; 20]) -> Result<()> {
        let mut cached = self
            .address
            .write()
            .map_err(|_| ProxyError::InternalError("custodian lock poisoned".to_string()))?;
        *cached = Some(address);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::TransactionRequest;
    use tempfile::tempdir;

    fn custodian(dir: &std::path::Path, password: &str) -> KeyCustodian {
        KeyCustodian::new(
            KeystoreStorage::new(dir.join("keystore.json")).unwrap(),
            SecretString::new(password.to_string()),
            KdfCost::Light,
            1 << 20,
            false,
        )
    }

    #[test]
    fn test_create_account_once() {
        let dir = tempdir().unwrap();
        let custodian = custodian(dir.path(), "hunter2");
        assert!(!custodian.has_account());
        assert!(matches!(custodian.get_address(), Err(ProxyError::NoWalletFound)));

        let address = custodian.create_account().unwrap();
        assert!(address.starts_with("0x"));
        assert_eq!(address.len(), 42);
        assert!(custodian.has_account());
        assert_eq!(custodian.get_address().unwrap(), address);

        assert!(matches!(
            custodian.create_account(),
            Err(ProxyError::WalletExists)
        ));
    }

    #[test]
    fn test_address_survives_restart() {
        let dir = tempdir().unwrap();
        let address = custodian(dir.path(), "pw").create_account().unwrap();

        // A fresh instance reads the address without a password
        let reopened = custodian(dir.path(), "not-the-password");
        assert_eq!(reopened.get_address().unwrap(), address);
    }

    #[test]
    fn test_wrong_password_never_signs() {
        let dir = tempdir().unwrap();
        custodian(dir.path(), "right").create_account().unwrap();

        let wrong = custodian(dir.path(), "wrong");
        assert!(matches!(
            wrong.sign_message(b"hello"),
            Err(ProxyError::InvalidPassword)
        ));
    }

    #[test]
    fn test_signs_each_operation_kind() {
        let dir = tempdir().unwrap();
        let custodian = custodian(dir.path(), "pw");
        custodian.create_account().unwrap();

        let sig = custodian.sign_message(b"hello").unwrap();
        assert!(sig.v <= 1);

        let tx: TransactionRequest = serde_json::from_value(serde_json::json!({
            "to": "0x000000000000000000000000000000000000dead",
            "value": "1",
            "chainId": 1,
            "gas": 21000,
            "gasPrice": "1000000000"
        }))
        .unwrap();
        let signed = custodian.sign_transaction(tx.build().unwrap()).unwrap();
        assert!(signed.signed_transaction.starts_with("0xf8"));

        let auth = Authorization::new(1, [0x42; 20], 0);
        let signed = custodian.sign_authorization(auth).unwrap();
        assert_eq!(signed.chain_id, 1);
    }

    #[test]
    fn test_missing_address_is_derived() {
        let dir = tempdir().unwrap();
        let keypair = EthKeyPair::generate();
        let mut keystore = KeystoreV3::encrypt(
            keypair.private_key_bytes().expose(),
            &keypair.address(),
            "pw",
            KdfCost::Light,
        )
        .unwrap();
        keystore.address = String::new();
        KeystoreStorage::new(dir.path().join("keystore.json"))
            .unwrap()
            .store(&keystore)
            .unwrap();

        let custodian = custodian(dir.path(), "pw");
        assert_eq!(custodian.get_address().unwrap(), keypair.address_checksum());
    }
}
