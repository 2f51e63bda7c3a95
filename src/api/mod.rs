//! API layer for keyring-proxy
//!
//! Provides:
//! - HMAC request authentication with two tiers
//! - Operation decoding from (method, path, body)
//! - The signing orchestrator that drives every request to a terminal state

pub mod auth;
pub mod request;
pub mod service;

pub use auth::{sign_request, AuthTier, AuthVerifier};
pub use request::{Approval, InboundRequest, Operation};
pub use service::{ProxyResponse, SigningProxy};
