//! Request authentication
//!
//! Callers sign every request with HMAC-SHA256 over
//! `METHOD\nPATH\nTIMESTAMP\nBODY` and send the timestamp (milliseconds
//! since the Unix epoch) and the lowercase hex signature as headers.
//!
//! Provides:
//! - Two secret tiers (operational, administrative)
//! - A symmetric replay window on the timestamp
//! - Constant-time signature comparison

use crate::config::AuthConfig;
use crate::errors::{ProxyError, Result};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Which secret authenticated the request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthTier {
    Operational,
    Admin,
}

/// Stateless HMAC verifier
pub struct AuthVerifier {
    operational: SecretString,
    admin: Option<SecretString>,
    window_ms: i64,
}

impl AuthVerifier {
    pub fn new(operational: SecretString, admin: Option<SecretString>, window_secs: u64) -> Self {
        Self {
            operational,
            admin,
            window_ms: (window_secs as i64).saturating_mul(1000),
        }
    }

    pub fn from_config(
        config: &AuthConfig,
        operational: SecretString,
        admin: Option<SecretString>,
    ) -> Self {
        Self::new(operational, admin, config.replay_window_secs)
    }

    /// Verify a request against the current wall clock
    pub fn verify(
        &self,
        method: &str,
        path: &str,
        body: &[u8],
        timestamp: Option<&str>,
        signature: Option<&str>,
    ) -> Result<AuthTier> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        self.verify_at(method, path, body, timestamp, signature, now_ms)
    }

    /// Verify a request as of `now_ms`
    pub fn verify_at(
        &self,
        method: &str,
        path: &str,
        body: &[u8],
        timestamp: Option<&str>,
        signature: Option<&str>,
        now_ms: i64,
    ) -> Result<AuthTier> {
        let (Some(timestamp), Some(signature)) = (timestamp, signature) else {
            return Err(ProxyError::MissingAuthHeaders);
        };

        let ts: i64 = timestamp
            .trim()
            .parse()
            .map_err(|_| ProxyError::AuthFailed("malformed timestamp".to_string()))?;

        let skew_ms = now_ms.saturating_sub(ts);
        if skew_ms.saturating_abs() > self.window_ms {
            return Err(ProxyError::ReplayRejected { skew_ms });
        }

        let provided = hex::decode(signature.trim().trim_start_matches("0x"))
            .map_err(|_| ProxyError::AuthFailed("malformed signature".to_string()))?;

        if matches_secret(&self.operational, method, path, timestamp, body, &provided)? {
            debug!("Authenticated {} {} (operational)", method, path);
            return Ok(AuthTier::Operational);
        }

        if let Some(admin) = &self.admin {
            if matches_secret(admin, method, path, timestamp, body, &provided)? {
                debug!("Authenticated {} {} (admin)", method, path);
                return Ok(AuthTier::Admin);
            }
        }

        Err(ProxyError::AuthFailed("signature mismatch".to_string()))
    }

    /// Administrative endpoints need the admin tier once an admin secret exists
    pub fn require_admin(&self, tier: AuthTier) -> Result<()> {
        if self.admin.is_some() && tier != AuthTier::Admin {
            return Err(ProxyError::AdminRequired);
        }
        Ok(())
    }
}

fn matches_secret(
    secret: &SecretString,
    method: &str,
    path: &str,
    timestamp: &str,
    body: &[u8],
    provided: &[u8],
) -> Result<bool> {
    let expected = compute_signature(
        secret.expose_secret().as_bytes(),
        method,
        path,
        timestamp,
        body,
    )?;
    Ok(bool::from(expected[..].ct_eq(provided)))
}

/// HMAC-SHA256 over the canonical request payload
pub fn compute_signature(
    secret: &[u8],
    method: &str,
    path: &str,
    timestamp: &str,
    body: &[u8],
) -> Result<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| ProxyError::InternalError(format!("hmac key: {}", e)))?;
    mac.update(method.to_ascii_uppercase().as_bytes());
    mac.update(b"\n");
    mac.update(path.as_bytes());
    mac.update(b"\n");
    mac.update(timestamp.as_bytes());
    mac.update(b"\n");
    mac.update(body);

    let mut sig = [0u8; 32];
    sig.copy_from_slice(&mac.finalize().into_bytes());
    Ok(sig)
}

/// Lowercase hex signature a client sends in the signature header
pub fn sign_request(
    secret: &str,
    method: &str,
    path: &str,
    timestamp: &str,
    body: &[u8],
) -> Result<String> {
    Ok(hex::encode(compute_signature(
        secret.as_bytes(),
        method,
        path,
        timestamp,
        body,
    )?))
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000_000;

    fn verifier(admin: bool) -> AuthVerifier {
        AuthVerifier::new(
            SecretString::new("operational-secret".to_string()),
            admin.then(|| SecretString::new("admin-secret".to_string())),
            30,
        )
    }

    fn signed(secret: &str, ts: i64, body: &str) -> (String, String) {
        let ts = ts.to_string();
        let sig = sign_request(secret, "POST", "/sign-message", &ts, body.as_bytes()).unwrap();
        (ts, sig)
    }

    #[test]
    fn test_operational_secret_accepted() {
        let auth = verifier(false);
        let (ts, sig) = signed("operational-secret", NOW, "{}");
        let tier = auth
            .verify_at("POST", "/sign-message", b"{}", Some(&ts), Some(&sig), NOW)
            .unwrap();
        assert_eq!(tier, AuthTier::Operational);
    }

    #[test]
    fn test_admin_tier_recorded() {
        let auth = verifier(true);
        let (ts, sig) = signed("admin-secret", NOW, "{}");
        let tier = auth
            .verify_at("POST", "/sign-message", b"{}", Some(&ts), Some(&sig), NOW)
            .unwrap();
        assert_eq!(tier, AuthTier::Admin);
        assert!(auth.require_admin(tier).is_ok());
        assert!(matches!(
            auth.require_admin(AuthTier::Operational),
            Err(ProxyError::AdminRequired)
        ));
    }

    #[test]
    fn test_admin_gate_open_without_admin_secret() {
        let auth = verifier(false);
        assert!(auth.require_admin(AuthTier::Operational).is_ok());
    }

    #[test]
    fn test_replay_window_is_symmetric() {
        let auth = verifier(false);

        for offset in [-29_000, 29_000] {
            let (ts, sig) = signed("operational-secret", NOW + offset, "{}");
            assert!(auth
                .verify_at("POST", "/sign-message", b"{}", Some(&ts), Some(&sig), NOW)
                .is_ok());
        }

        for offset in [-31_000, 31_000] {
            let (ts, sig) = signed("operational-secret", NOW + offset, "{}");
            assert!(matches!(
                auth.verify_at("POST", "/sign-message", b"{}", Some(&ts), Some(&sig), NOW),
                Err(ProxyError::ReplayRejected { .. })
            ));
        }
    }

    #[test]
    fn test_same_request_accepted_again_within_window() {
        let auth = verifier(false);
        let (ts, sig) = signed("operational-secret", NOW, "{}");

        for now in [NOW, NOW + 29_000] {
            assert_eq!(
                auth.verify_at("POST", "/sign-message", b"{}", Some(&ts), Some(&sig), now)
                    .unwrap(),
                AuthTier::Operational
            );
        }
        assert!(matches!(
            auth.verify_at("POST", "/sign-message", b"{}", Some(&ts), Some(&sig), NOW + 31_000),
            Err(ProxyError::ReplayRejected { .. })
        ));
    }

    #[test]
    fn test_tampered_body_rejected() {
        let auth = verifier(true);
        let (ts, sig) = signed("operational-secret", NOW, "{\"message\":\"a\"}");
        assert!(matches!(
            auth.verify_at(
                "POST",
                "/sign-message",
                b"{\"message\":\"b\"}",
                Some(&ts),
                Some(&sig),
                NOW
            ),
            Err(ProxyError::AuthFailed(_))
        ));
    }

    #[test]
    fn test_missing_headers() {
        let auth = verifier(false);
        assert!(matches!(
            auth.verify_at("GET", "/get-address", b"", None, Some("00"), NOW),
            Err(ProxyError::MissingAuthHeaders)
        ));
        assert!(matches!(
            auth.verify_at("GET", "/get-address", b"", Some("1"), Some("zz"), 1),
            Err(ProxyError::AuthFailed(_))
        ));
    }
}
