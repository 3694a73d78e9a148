//! Memory protection for key material
//!
//! Two hardening measures for the short window in which a reconstructed
//! master key exists in process memory:
//!
//! 1. **Core dump prevention**: `setrlimit(RLIMIT_CORE, 0)` so a crash during
//!    an unlock never writes key material to disk.
//!
//! 2. **Memory locking**: [`LockedBuffer`] mlocks its pages so the OS cannot
//!    swap them out, and zeroizes them on drop.
//!
//! Both are best-effort. Containers and unprivileged users often cannot mlock;
//! failures are logged and the process carries on.

use std::sync::atomic::{AtomicBool, Ordering};
use zeroize::Zeroize;

static CORE_DUMPS_DISABLED: AtomicBool = AtomicBool::new(false);

/// Disable core dumps for the current process.
///
/// Call once, early in startup. Returns `true` if core dumps are off
/// (including when a previous call already turned them off).
pub fn disable_core_dumps() -> bool {
    if CORE_DUMPS_DISABLED.swap(true, Ordering::SeqCst) {
        return true;
    }

    #[cfg(unix)]
    {
        unix::disable_core_dumps_impl()
    }

    #[cfg(not(unix))]
    {
        log::warn!("Core dump prevention not supported on this platform");
        false
    }
}

/// A heap buffer that is mlocked for its whole life and zeroized on drop.
///
/// The length is fixed at construction; the allocation never moves, so the
/// locked range stays valid until `drop`.
pub struct LockedBuffer {
    data: Box<[u8]>,
    locked: bool,
}

impl LockedBuffer {
    /// Allocate a zero-filled buffer of `len` bytes and lock it.
    pub fn new(len: usize) -> Self {
        let data = vec![0u8; len].into_boxed_slice();
        let locked = if data.is_empty() {
            true
        } else {
            lock_region(data.as_ptr(), data.len())
        };

        if !locked {
            log::warn!(
                "Failed to mlock {} bytes; key material may be swappable",
                len
            );
        }

        Self { data, locked }
    }

    /// Allocate, lock, then copy `bytes` in.
    ///
    /// The caller remains responsible for wiping its own copy of `bytes`.
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut buf = Self::new(bytes.len());
        buf.data.copy_from_slice(bytes);
        buf
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether mlock actually succeeded.
    pub fn is_locked(&self) -> bool {
        self.locked
    }
}

impl Drop for LockedBuffer {
    fn drop(&mut self) {
        self.data.zeroize();

        if self.locked && !self.data.is_empty() {
            unlock_region(self.data.as_ptr(), self.data.len());
        }
    }
}

fn lock_region(ptr: *const u8, len: usize) -> bool {
    #[cfg(unix)]
    {
        // SAFETY: ptr/len describe a live allocation owned by the caller
        unsafe { unix::mlock_impl(ptr, len) }
    }

    #[cfg(not(unix))]
    {
        let _ = (ptr, len);
        false
    }
}

fn unlock_region(ptr: *const u8, len: usize) {
    #[cfg(unix)]
    {
        // SAFETY: same range that lock_region locked, still allocated
        unsafe {
            unix::munlock_impl(ptr, len);
        }
    }

    #[cfg(not(unix))]
    {
        let _ = (ptr, len);
    }
}

#[cfg(unix)]
mod unix {
    pub fn disable_core_dumps_impl() -> bool {
        let rlim = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        // SAFETY: setrlimit with a valid rlimit struct
        let result = unsafe { libc::setrlimit(libc::RLIMIT_CORE, &rlim) };
        if result != 0 {
            log::warn!(
                "Failed to disable core dumps: {}",
                std::io::Error::last_os_error()
            );
            return false;
        }
        true
    }

    pub unsafe fn mlock_impl(ptr: *const u8, len: usize) -> bool {
        if libc::mlock(ptr as *const libc::c_void, len) != 0 {
            log::debug!(
                "mlock failed for {} bytes: {}",
                len,
                std::io::Error::last_os_error()
            );
            return false;
        }
        true
    }

    pub unsafe fn munlock_impl(ptr: *const u8, len: usize) -> bool {
        libc::munlock(ptr as *const libc::c_void, len) == 0
    }
}
