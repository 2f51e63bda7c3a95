//! Security utilities for memory protection and secure handling
//!
//! This module provides:
//! - Memory zeroization to securely erase key material
//! - Memory locking to keep decrypted keys out of swap
//! - Process hardening (core dumps)

pub mod mlock;
pub mod zeroize;

pub use mlock::{can_lock_memory, setup_memory_protection, LockedMemory};
pub use zeroize::SecureBytes;
