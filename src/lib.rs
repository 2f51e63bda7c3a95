//! keyring-proxy - policy-gated signing for a single EVM key
//!
//! A signing proxy that:
//! - Keeps one private key in a password-encrypted V3 keystore
//! - Authenticates every call with an HMAC over method, path, timestamp and body
//! - Evaluates bound policies before any signature is produced
//! - Appends one audit entry per request
//!
//! # Security
//!
//! - The key is decrypted per signing call and zeroed before the call returns
//! - Decrypted bytes can be held in memory-locked pages
//! - Absence of an explicit ALLOW is a denial
//!
//! # Usage
//!
//! ```no_run
//! use keyring_proxy::api::{InboundRequest, SigningProxy};
//! use keyring_proxy::config::Config;
//! use secrecy::SecretString;
//!
//! # fn main() -> keyring_proxy::errors::Result<()> {
//! let config = Config::load(None)?;
//! let proxy = SigningProxy::from_config(
//!     &config,
//!     SecretString::new("keystore password".to_string()),
//!     SecretString::new("shared secret".to_string()),
//!     None,
//! )?;
//! let response = proxy.handle(&InboundRequest::new("GET", "/health"));
//! assert_eq!(response.status, 200);
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod audit;
pub mod config;
pub mod crypto;
pub mod errors;
pub mod keystore;
pub mod policy;
pub mod security;
pub mod signer;

pub use api::{InboundRequest, ProxyResponse, SigningProxy};
pub use errors::{ProxyError, Result};
