//! Nonblocking TCP stream and listener over raw sockets.
//!
//! Every socket is created `O_NONBLOCK | CLOEXEC`. Streams coming out of
//! [`TcpStream::connect`] may still be mid-handshake; callers poll
//! [`TcpStream::finish_connect`] after a writability wait.

use std::mem;
use std::os::fd::RawFd;

use crate::error::{Error, Result};
use crate::fd::UniqueFd;
use crate::net::Endpoint;

fn sockaddr_from(endpoint: &Endpoint) -> libc::sockaddr_in {
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = endpoint.port.to_be();
    addr.sin_addr = libc::in_addr {
        s_addr: u32::from(endpoint.addr).to_be(),
    };
    addr
}

/// Puts a descriptor into nonblocking mode via `fcntl`.
pub(crate) fn set_nonblocking(fd: RawFd) -> Result<()> {
    if fd < 0 {
        return Err(Error::from_raw(libc::EBADF));
    }
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(Error::from_errno());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } == 0 {
        Ok(())
    } else {
        Err(Error::from_errno())
    }
}

// Prefer atomic creation flags; fall back to fcntl on kernels that refuse them.
fn nonblocking_stream_socket() -> Result<UniqueFd> {
    let fd = unsafe {
        libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            0,
        )
    };
    if fd >= 0 {
        return Ok(UniqueFd::from_raw(fd));
    }

    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(Error::from_errno());
    }
    let owned = UniqueFd::from_raw(fd);
    set_nonblocking(owned.get())?;
    Ok(owned)
}

fn set_reuse_addr(fd: RawFd) -> Result<()> {
    let enabled: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            (&enabled as *const libc::c_int).cast(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(Error::from_errno())
    }
}

/// `true` for `EAGAIN`/`EWOULDBLOCK`.
pub fn is_would_block(err: &Error) -> bool {
    err.code() == libc::EAGAIN || err.code() == libc::EWOULDBLOCK
}

/// `true` for `EINPROGRESS` (connect still in flight).
pub fn is_in_progress(err: &Error) -> bool {
    err.code() == libc::EINPROGRESS
}

/// A nonblocking TCP connection.
#[derive(Debug)]
pub struct TcpStream {
    fd: UniqueFd,
}

impl TcpStream {
    pub(crate) fn from_fd(fd: UniqueFd) -> Self {
        Self { fd }
    }

    /// Starts a nonblocking connect.
    ///
    /// A returned stream may still be connecting; `EINPROGRESS` is absorbed
    /// here and resolved later through [`finish_connect`].
    ///
    /// [`finish_connect`]: TcpStream::finish_connect
    pub fn connect(remote: &Endpoint) -> Result<Self> {
        let owned = nonblocking_stream_socket()?;
        let addr = sockaddr_from(remote);

        let rc = unsafe {
            libc::connect(
                owned.get(),
                (&addr as *const libc::sockaddr_in).cast(),
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rc == 0 {
            return Ok(Self { fd: owned });
        }

        let err = Error::from_errno();
        if is_in_progress(&err) {
            return Ok(Self { fd: owned });
        }
        Err(err)
    }

    /// Resolves an in-progress connect by reading `SO_ERROR`.
    pub fn finish_connect(&self) -> Result<()> {
        if !self.valid() {
            return Err(Error::from_raw(libc::EBADF));
        }

        let mut socket_error: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                self.fd.get(),
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                (&mut socket_error as *mut libc::c_int).cast(),
                &mut len,
            )
        };
        if rc != 0 {
            return Err(Error::from_errno());
        }
        if socket_error == 0 {
            Ok(())
        } else {
            Err(Error::from_raw(socket_error))
        }
    }

    /// One nonblocking `recv`. Zero means EOF, `EAGAIN` means retry later.
    pub fn read_some(&self, buffer: &mut [u8]) -> Result<usize> {
        if !self.valid() {
            return Err(Error::from_raw(libc::EBADF));
        }
        if buffer.is_empty() {
            return Ok(0);
        }

        let count = unsafe {
            libc::recv(
                self.fd.get(),
                buffer.as_mut_ptr().cast(),
                buffer.len(),
                0,
            )
        };
        if count < 0 {
            return Err(Error::from_errno());
        }
        Ok(count as usize)
    }

    /// One nonblocking `send` with `MSG_NOSIGNAL`.
    pub fn write_some(&self, buffer: &[u8]) -> Result<usize> {
        if !self.valid() {
            return Err(Error::from_raw(libc::EBADF));
        }
        if buffer.is_empty() {
            return Ok(0);
        }

        let count = unsafe {
            libc::send(
                self.fd.get(),
                buffer.as_ptr().cast(),
                buffer.len(),
                libc::MSG_NOSIGNAL,
            )
        };
        if count < 0 {
            return Err(Error::from_errno());
        }
        Ok(count as usize)
    }

    /// Half-closes the write side.
    pub fn shutdown_write(&self) -> Result<()> {
        if !self.valid() {
            return Err(Error::from_raw(libc::EBADF));
        }
        if unsafe { libc::shutdown(self.fd.get(), libc::SHUT_WR) } == 0 {
            Ok(())
        } else {
            Err(Error::from_errno())
        }
    }

    /// Shrinks or grows the kernel send buffer (`SO_SNDBUF`).
    pub fn set_send_buffer_size(&self, bytes: i32) -> Result<()> {
        if !self.valid() {
            return Err(Error::from_raw(libc::EBADF));
        }
        if bytes <= 0 {
            return Err(Error::from_raw(libc::EINVAL));
        }
        let rc = unsafe {
            libc::setsockopt(
                self.fd.get(),
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                (&bytes as *const i32).cast(),
                mem::size_of::<i32>() as libc::socklen_t,
            )
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(Error::from_errno())
        }
    }

    pub fn native_handle(&self) -> RawFd {
        self.fd.get()
    }

    pub fn valid(&self) -> bool {
        self.fd.valid()
    }
}

/// A nonblocking TCP listening socket.
#[derive(Debug)]
pub struct TcpListener {
    fd: UniqueFd,
}

impl TcpListener {
    /// Binds and listens on `local` with `SO_REUSEADDR`.
    pub fn bind(local: &Endpoint, backlog: i32) -> Result<Self> {
        let owned = nonblocking_stream_socket()?;
        set_reuse_addr(owned.get())?;

        let addr = sockaddr_from(local);
        let rc = unsafe {
            libc::bind(
                owned.get(),
                (&addr as *const libc::sockaddr_in).cast(),
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(Error::from_errno());
        }
        if unsafe { libc::listen(owned.get(), backlog) } != 0 {
            return Err(Error::from_errno());
        }

        Ok(Self { fd: owned })
    }

    /// One nonblocking `accept4`; the accepted stream inherits
    /// `CLOEXEC | NONBLOCK` atomically.
    pub fn accept(&self) -> Result<TcpStream> {
        if !self.valid() {
            return Err(Error::from_raw(libc::EBADF));
        }

        let accepted = unsafe {
            libc::accept4(
                self.fd.get(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            )
        };
        if accepted < 0 {
            return Err(Error::from_errno());
        }
        Ok(TcpStream::from_fd(UniqueFd::from_raw(accepted)))
    }

    /// The kernel-assigned local port, useful after binding port 0.
    pub fn local_port(&self) -> Result<u16> {
        if !self.valid() {
            return Err(Error::from_raw(libc::EBADF));
        }

        let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockname(
                self.fd.get(),
                (&mut addr as *mut libc::sockaddr_in).cast(),
                &mut len,
            )
        };
        if rc != 0 {
            return Err(Error::from_errno());
        }
        Ok(u16::from_be(addr.sin_port))
    }

    pub fn native_handle(&self) -> RawFd {
        self.fd.get()
    }

    pub fn valid(&self) -> bool {
        self.fd.valid()
    }
}
