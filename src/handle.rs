//! Owning/borrowing wrapper around a raw OS handle (C1).
//!
//! A [`Handle`] carries a platform-native identity - a file descriptor on
//! Unix, a `HANDLE` on Windows - plus an ownership flag. At most one
//! `Handle` owns a given raw value at a time; when an owning `Handle` is
//! dropped, the underlying object is closed exactly once. Cloning a
//! `Handle` never duplicates the OS object - it shares ownership via
//! reference counting, matching the `Borrowed` redirection slot described
//! in the data model, where the same handle may be wired into more than one
//! stdio position.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[cfg(unix)]
mod os {
    use std::os::unix::io::RawFd;

    pub type Raw = RawFd;
    pub const INVALID: Raw = -1;

    pub fn close(raw: Raw) {
        if raw == INVALID {
            return;
        }
        let rc = unsafe { libc::close(raw) };
        if rc != 0 {
            log::warn!(
                "closing fd {raw} failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

#[cfg(windows)]
mod os {
    use std::os::windows::io::RawHandle;

    pub type Raw = RawHandle;
    pub const INVALID: Raw = winapi::um::handleapi::INVALID_HANDLE_VALUE;

    pub fn close(raw: Raw) {
        if raw.is_null() || raw == INVALID {
            return;
        }
        let ok = unsafe { winapi::um::handleapi::CloseHandle(raw as _) };
        if ok == 0 {
            log::warn!(
                "closing handle {raw:?} failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

pub(crate) use os::Raw;

struct Inner {
    raw: Raw,
    owned: bool,
    // Set once the handle has been released, either explicitly via
    // `release()` or implicitly by `Drop`, so that both paths agree on
    // "closed exactly once" even when the `Handle` is shared via `Clone`.
    closed: AtomicBool,
}

impl Inner {
    fn close_once(&self) {
        if self.owned && !self.closed.swap(true, Ordering::AcqRel) {
            os::close(self.raw);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.close_once();
    }
}

/// A handle to an OS-level resource (file descriptor or `HANDLE`).
///
/// `Handle` is cheaply `Clone` - clones share the same underlying raw value
/// and the same ownership; the object is released only once the last clone
/// is dropped. This is what lets [`crate::options::Stdio::Borrowed`] place a
/// single caller handle into more than one stdio slot (e.g. a socketpair
/// used as both stdin and stdout of a child).
#[derive(Clone)]
pub struct Handle(Arc<Inner>);

impl Handle {
    /// Wraps a raw value, taking ownership: it will be closed when the last
    /// clone of the returned `Handle` is dropped.
    pub fn owned(raw: Raw) -> Handle {
        Handle(Arc::new(Inner {
            raw,
            owned: true,
            closed: AtomicBool::new(false),
        }))
    }

    /// Wraps a raw value without taking ownership. The caller remains
    /// responsible for eventually closing it; dropping the `Handle` never
    /// closes the underlying object.
    pub fn borrowed(raw: Raw) -> Handle {
        Handle(Arc::new(Inner {
            raw,
            owned: false,
            closed: AtomicBool::new(false),
        }))
    }

    /// The raw platform value, for passing to syscalls. Does not transfer
    /// ownership.
    pub fn as_raw(&self) -> Raw {
        self.0.raw
    }

    /// True if this handle is invalid (`-1` on Unix, `INVALID_HANDLE_VALUE`
    /// on Windows).
    pub fn is_invalid(&self) -> bool {
        self.0.raw == os::INVALID
    }

    /// True if this `Handle` (or one of its clones) owns the underlying
    /// object and will close it on drop.
    pub fn is_owned(&self) -> bool {
        self.0.owned
    }

    /// Releases the handle immediately rather than waiting for drop.
    ///
    /// Idempotent: releasing an already-released or non-owning handle is a
    /// no-op. Safe to call on a handle with outstanding clones - the
    /// underlying object is still closed exactly once, and every clone
    /// (including ones produced after this call) will see it as released.
    pub fn release(&self) {
        self.0.close_once();
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("raw", &self.0.raw)
            .field("owned", &self.0.owned)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn borrowed_handle_does_not_close() {
        let h = Handle::borrowed(999);
        assert!(!h.is_owned());
        drop(h);
        // nothing to assert syscall-side; absence of a panic/abort is the point
    }

    #[test]
    fn invalid_handle_is_detected() {
        assert!(Handle::owned(os::INVALID).is_invalid());
    }

    #[test]
    fn release_is_idempotent() {
        let h = Handle::borrowed(os::INVALID);
        h.release();
        h.release();
    }
}
