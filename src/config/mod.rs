//! Configuration management for keyring-proxy
//!
//! Supports loading configuration from:
//! - Environment variables (KEYRING_PROXY__*)
//! - Config file (config.toml)
//!
//! Secrets (keystore password, HMAC secrets) are never part of the config
//! file; see [`secret_from_env`].

use crate::errors::{ProxyError, Result};
use crate::keystore::KdfCost;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Environment variable holding the keystore password
pub const KEYSTORE_PASSWORD_ENV: &str = "KEYSTORE_PASSWORD";

/// Environment variable holding the operational HMAC secret
pub const PROXY_SECRET_ENV: &str = "KEYRING_PROXY_SECRET";

/// Environment variable holding the optional administrative HMAC secret
pub const ADMIN_SECRET_ENV: &str = "KEYRING_PROXY_ADMIN_SECRET";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Request authentication
    pub auth: AuthConfig,

    /// Storage locations
    pub storage: StorageConfig,

    /// Keystore codec settings
    pub keystore: KeystoreConfig,

    /// Security configuration
    pub security: SecurityConfig,

    /// Signing defaults
    pub signing: SigningConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Request authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Accepted clock skew in either direction
    pub replay_window_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            replay_window_secs: 30,
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the V3 keystore file
    pub keystore_path: PathBuf,

    /// Path to the policy store file
    pub policy_path: PathBuf,

    /// Append-only audit log (JSON lines). In-memory only when unset.
    pub audit_path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            keystore_path: PathBuf::from("./data/keystore.json"),
            policy_path: PathBuf::from("./data/policies.json"),
            audit_path: Some(PathBuf::from("./data/audit.jsonl")),
        }
    }
}

/// Keystore codec configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeystoreConfig {
    /// scrypt cost used when creating new keystores
    pub kdf_cost: KdfCost,

    /// Largest scrypt `n` accepted when decoding a keystore
    pub max_kdf_n: u32,
}

impl Default for KeystoreConfig {
    fn default() -> Self {
        Self {
            kdf_cost: KdfCost::Standard,
            max_kdf_n: 1 << 20,
        }
    }
}

/// Security configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Lock decrypted key buffers in memory
    pub enable_mlock: bool,

    /// Disable core dumps
    pub disable_core_dumps: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enable_mlock: true,
            disable_core_dumps: true,
        }
    }
}

/// Signing defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningConfig {
    /// Chain id used for authorizations that do not name one
    pub default_chain_id: u64,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            default_chain_id: 1,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let defaults = config::Config::try_from(&Config::default())
            .map_err(|e| ProxyError::ConfigError(e.to_string()))?;
        let mut builder = config::Config::builder().add_source(defaults);

        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        } else {
            builder = builder
                .add_source(config::File::with_name("config").required(false))
                .add_source(config::File::with_name("/etc/keyring-proxy/config").required(false));
        }

        // KEYRING_PROXY__AUTH__REPLAY_WINDOW_SECS, etc.
        builder = builder.add_source(
            config::Environment::with_prefix("KEYRING_PROXY")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| ProxyError::ConfigError(e.to_string()))?;

        config
            .try_deserialize()
            .map_err(|e| ProxyError::ConfigError(e.to_string()))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.auth.replay_window_secs == 0 {
            return Err(ProxyError::ConfigError(
                "auth.replay_window_secs must be greater than zero".to_string(),
            ));
        }

        // Keep the window well inside the range of a millisecond i64
        if self.auth.replay_window_secs > 86_400 {
            return Err(ProxyError::ConfigError(
                "auth.replay_window_secs must not exceed one day".to_string(),
            ));
        }

        if !self.keystore.max_kdf_n.is_power_of_two() {
            return Err(ProxyError::ConfigError(
                "keystore.max_kdf_n must be a power of two".to_string(),
            ));
        }

        if let Some(parent) = self.storage.policy_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                info!("Policy directory does not exist, will create: {:?}", parent);
            }
        }

        Ok(())
    }
}

/// Read a secret from the environment without keeping a plain copy around
pub fn secret_from_env(name: &str) -> Option<SecretString> {
    match env::var(name) {
        Ok(value) if !value.is_empty() => Some(SecretString::new(value)),
        _ => None,
    }
}
