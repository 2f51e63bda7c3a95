//! Memory locking utilities
//!
//! Locks the pages backing a decrypted key so it cannot be written to swap
//! during the short window in which a signature is produced.

use crate::errors::{ProxyError, Result};
use nix::libc;
use tracing::{debug, warn};
use zeroize::Zeroize;

/// Check if we can lock memory (requires appropriate privileges or rlimits)
pub fn can_lock_memory() -> bool {
    #[cfg(target_os = "linux")]
    {
        use nix::sys::resource::{getrlimit, Resource};

        match getrlimit(Resource::RLIMIT_MEMLOCK) {
            Ok((soft, _hard)) => soft > 0,
            Err(_) => false,
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        true
    }
}

/// Page-aligned bounds covering `[ptr, ptr + len)`
#[cfg(unix)]
fn page_bounds(ptr: *const u8, len: usize) -> (*const libc::c_void, usize) {
    // SAFETY: sysconf has no preconditions
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    let addr = ptr as usize;
    let aligned_addr = addr & !(page_size - 1);
    let offset = addr - aligned_addr;
    let aligned_len = (len + offset + page_size - 1) & !(page_size - 1);
    (aligned_addr as *const libc::c_void, aligned_len)
}

/// Lock a memory region to prevent it from being swapped
///
/// # Safety
/// The memory region must be valid for `len` bytes
unsafe fn lock_memory(ptr: *const u8, len: usize) -> Result<()> {
    if ptr.is_null() || len == 0 {
        return Ok(());
    }

    #[cfg(unix)]
    {
        let (addr, aligned_len) = page_bounds(ptr, len);
        if libc::mlock(addr, aligned_len) == 0 {
            debug!("Locked {} bytes of memory", aligned_len);
            Ok(())
        } else {
            let err = std::io::Error::last_os_error();
            Err(ProxyError::MemoryLockFailed(err.to_string()))
        }
    }

    #[cfg(not(unix))]
    {
        warn!("Memory locking not supported on this platform");
        Ok(())
    }
}

/// Unlock a previously locked memory region
///
/// # Safety
/// The memory region must have been previously locked with lock_memory
unsafe fn unlock_memory(ptr: *const u8, len: usize) {
    if ptr.is_null() || len == 0 {
        return;
    }

    #[cfg(unix)]
    {
        let (addr, aligned_len) = page_bounds(ptr, len);
        if libc::munlock(addr, aligned_len) != 0 {
            warn!(
                "Failed to unlock memory: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

/// Key material held in (best effort) locked memory.
/// Zeroed and unlocked on drop.
pub struct LockedMemory {
    data: Vec<u8>,
    locked: bool,
}

impl LockedMemory {
    /// Take ownership of `data`, locking its pages when `lock` is set
    pub fn from_vec(data: Vec<u8>, lock: bool) -> Self {
        let locked = lock
            && match unsafe { lock_memory(data.as_ptr(), data.len()) } {
                Ok(()) => true,
                Err(e) => {
                    warn!("Could not lock memory, continuing without: {}", e);
                    false
                }
            };

        Self { data, locked }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Drop for LockedMemory {
    fn drop(&mut self) {
        // Zero in place first; Vec::zeroize also truncates, so capture bounds
        let (ptr, len) = (self.data.as_ptr(), self.data.len());
        self.data.zeroize();

        if self.locked {
            unsafe { unlock_memory(ptr, len) };
        }
    }
}

/// Set up memory protection for the process.
/// Call this early in main().
pub fn setup_memory_protection(disable_core_dumps: bool) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        use nix::sys::resource::{setrlimit, Resource};

        if disable_core_dumps {
            setrlimit(Resource::RLIMIT_CORE, 0, 0).map_err(|e| {
                ProxyError::MemoryLockFailed(format!("disable core dumps: {}", e))
            })?;
            debug!("Core dumps disabled");
        }
    }

    #[cfg(not(target_os = "linux"))]
    let _ = disable_core_dumps;

    if can_lock_memory() {
        debug!("Memory locking is available");
    } else {
        warn!("Memory locking may not be available - consider increasing RLIMIT_MEMLOCK");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locked_memory_holds_data() {
        let mem = LockedMemory::from_vec(vec![7u8; 32], true);
        assert_eq!(mem.len(), 32);
        assert_eq!(mem.as_slice(), &[7u8; 32]);
    }

    #[test]
    fn test_unlocked_when_disabled() {
        let mem = LockedMemory::from_vec(vec![1u8; 16], false);
        assert!(!mem.is_locked());
        assert!(!mem.is_empty());
    }
}
