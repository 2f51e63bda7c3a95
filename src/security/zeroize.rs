//! Secure memory zeroization utilities
//!
//! Wraps buffers holding key material so they are wiped when dropped,
//! using the `zeroize` crate to keep the compiler from eliding the writes.

use zeroize::{Zeroize, ZeroizeOnDrop};

/// A wrapper for sensitive byte arrays that automatically zeros memory on drop
#[derive(ZeroizeOnDrop)]
pub struct SecureBytes {
    inner: Vec<u8>,
}

impl SecureBytes {
    pub fn new(data: Vec<u8>) -> Self {
        Self { inner: data }
    }

    pub fn zeros(size: usize) -> Self {
        Self {
            inner: vec![0u8; size],
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn expose(&self) -> &[u8] {
        &self.inner
    }

    pub fn expose_mut(&mut self) -> &mut [u8] {
        &mut self.inner
    }

    pub fn zeroize_now(&mut self) {
        self.inner.zeroize();
    }

    /// Move the buffer into locked memory without copying it
    pub fn into_locked(mut self, lock: bool) -> super::LockedMemory {
        super::LockedMemory::from_vec(std::mem::take(&mut self.inner), lock)
    }
}

impl std::fmt::Debug for SecureBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecureBytes([REDACTED; {}])", self.inner.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secure_bytes_zeroize() {
        let mut secure = SecureBytes::new(vec![1, 2, 3, 4, 5]);
        assert_eq!(secure.expose(), &[1, 2, 3, 4, 5]);

        secure.zeroize_now();
        // Vec::zeroize() clears the vector (sets len to 0) after zeroing memory
        assert!(secure.is_empty());
    }

    #[test]
    fn test_debug_is_redacted() {
        let secure = SecureBytes::new(vec![0xaa; 32]);
        let rendered = format!("{:?}", secure);
        assert!(!rendered.contains("170"));
        assert!(rendered.contains("REDACTED"));
    }

    #[test]
    fn test_into_locked_moves_contents() {
        let secure = SecureBytes::new(vec![9u8; 32]);
        let locked = secure.into_locked(false);
        assert_eq!(locked.as_slice(), &[9u8; 32]);
    }
}
