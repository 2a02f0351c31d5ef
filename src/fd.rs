//! Move-only ownership of kernel file descriptors.

use std::os::fd::RawFd;

use crate::error::{Error, Result};

/// Owns a raw file descriptor and closes it exactly once.
///
/// `-1` is the empty state. Ownership moves with the value; [`release`]
/// transfers the descriptor out without closing it.
///
/// [`release`]: UniqueFd::release
#[derive(Debug)]
pub struct UniqueFd {
    fd: RawFd,
}

impl UniqueFd {
    /// Creates an empty handle.
    pub fn new() -> Self {
        Self { fd: -1 }
    }

    /// Takes ownership of an existing descriptor.
    pub fn from_raw(fd: RawFd) -> Self {
        Self { fd }
    }

    /// The owned descriptor, or `-1` when empty.
    pub fn get(&self) -> RawFd {
        self.fd
    }

    /// Whether a valid descriptor is owned.
    pub fn valid(&self) -> bool {
        self.fd >= 0
    }

    /// Releases ownership without closing.
    pub fn release(&mut self) -> RawFd {
        std::mem::replace(&mut self.fd, -1)
    }

    /// Replaces the owned descriptor, closing the previous one.
    pub fn reset(&mut self, fd: RawFd) {
        let previous = std::mem::replace(&mut self.fd, fd);
        if previous >= 0 {
            unsafe {
                libc::close(previous);
            }
        }
    }
}

impl Default for UniqueFd {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for UniqueFd {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

/// Closes a descriptor, reporting the errno on failure.
pub fn close_fd(fd: RawFd) -> Result<()> {
    if fd < 0 {
        return Err(Error::from_raw(libc::EBADF));
    }
    if unsafe { libc::close(fd) } == 0 {
        Ok(())
    } else {
        Err(Error::from_errno())
    }
}
