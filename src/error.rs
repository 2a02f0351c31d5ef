//! Errno-valued errors threaded through every fallible API.
//!
//! Errors are plain values on the fast path: every operation that can fail
//! returns [`Result<T>`], and the error carries the raw POSIX code it was
//! born with. The code is captured at the failing call site; callers never
//! consult a thread-global afterwards.

use std::fmt;
use std::io;

/// A POSIX error code wrapped as a copyable value.
///
/// Code `0` is never used for a failure; constructing an `Error` means
/// something went wrong.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Error {
    code: i32,
}

impl Error {
    /// Captures the calling thread's current `errno`.
    ///
    /// Must be called immediately after the failing syscall, before anything
    /// else can clobber `errno`.
    pub fn from_errno() -> Self {
        let code = io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
        Self { code }
    }

    /// Wraps an explicit errno value.
    pub fn from_raw(code: i32) -> Self {
        Self { code }
    }

    /// The raw errno value.
    pub fn code(&self) -> i32 {
        self.code
    }

    /// Human-readable description derived from the code.
    pub fn message(&self) -> String {
        io::Error::from_raw_os_error(self.code).to_string()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (errno {})", self.message(), self.code)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Error")
            .field("code", &self.code)
            .field("message", &self.message())
            .finish()
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self {
            code: err.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

/// Crate-wide result alias carrying [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_raw_preserves_code() {
        let err = Error::from_raw(libc::ETIMEDOUT);
        assert_eq!(err.code(), libc::ETIMEDOUT);
        assert!(!err.message().is_empty());
    }

    #[test]
    fn from_errno_captures_call_site() {
        let path = b"/nonexistent/riptide\0";
        let fd = unsafe { libc::open(path.as_ptr().cast(), libc::O_RDONLY) };
        assert!(fd < 0);
        let err = Error::from_errno();
        assert_eq!(err.code(), libc::ENOENT);
    }

    #[test]
    fn io_error_conversion() {
        let io_err = io::Error::from_raw_os_error(libc::EAGAIN);
        let err: Error = io_err.into();
        assert_eq!(err.code(), libc::EAGAIN);
    }

    #[test]
    fn errors_compare_by_code() {
        assert_eq!(Error::from_raw(libc::EPIPE), Error::from_raw(libc::EPIPE));
        assert_ne!(Error::from_raw(libc::EPIPE), Error::from_raw(libc::EBADF));
    }
}
