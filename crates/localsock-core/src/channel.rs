//! Byte channel: one owned local-domain stream socket.
//!
//! The channel is a handle only. It keeps no byte buffer of its own; every
//! byte lives in the kernel's send/receive queues until `read` copies it
//! out, and `available_bytes` asks the kernel (`FIONREAD`) each time.
//!
//! All operations take `&self` so that one thread can read while another
//! writes, and so that `close` can be called from a third thread to wake
//! both. The descriptor itself is released only after every in-flight
//! operation has returned, so a racing `close` can never make an operation
//! act on a recycled descriptor number.

use crate::address::EndpointAddress;
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, trace};

pub struct ByteChannel {
    stream: RwLock<Option<UnixStream>>,
    closed: AtomicBool,
}

impl ByteChannel {
    /// Take exclusive ownership of a connected stream.
    ///
    /// The stream is switched to blocking mode; `read` relies on a zero
    /// return meaning end of stream.
    pub fn new(stream: UnixStream) -> Result<Self> {
        stream
            .set_nonblocking(false)
            .map_err(|source| Error::IoFailure {
                op: "set_nonblocking",
                source,
            })?;
        Ok(Self {
            stream: RwLock::new(Some(stream)),
            closed: AtomicBool::new(false),
        })
    }

    /// Connect to a listening endpoint.
    pub fn connect(address: &EndpointAddress) -> Result<Self> {
        let addr = address.to_socket_addr()?;
        let stream = UnixStream::connect_addr(&addr)
            .map_err(|source| Error::IoFailure { op: "connect", source })?;
        debug!(fd = stream.as_raw_fd(), %address, "connected");
        Self::new(stream)
    }

    /// An unnamed pair of connected channels.
    pub fn pair() -> Result<(Self, Self)> {
        let (a, b) = UnixStream::pair().map_err(|source| Error::IoFailure {
            op: "socketpair",
            source,
        })?;
        Ok((Self::new(a)?, Self::new(b)?))
    }

    /// Run `f` against the live stream, or fail with `Closed`.
    ///
    /// The read guard is held for the duration of `f`, which keeps `close`
    /// from releasing the descriptor underneath it.
    fn with_stream<T>(&self, f: impl FnOnce(&UnixStream) -> Result<T>) -> Result<T> {
        let guard = self.stream.read();
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        match guard.as_ref() {
            Some(stream) => f(stream),
            None => Err(Error::Closed),
        }
    }

    /// Map an OS error, reporting `Closed` when a concurrent `close` caused it.
    fn failure(&self, op: &'static str, source: io::Error) -> Error {
        if self.is_closed() {
            Error::Closed
        } else {
            Error::from_io(op, source)
        }
    }

    /// Block until at least one byte can be copied into `buf`.
    ///
    /// Returns the number of bytes copied, or 0 at end of stream (the peer
    /// shut down its write side and everything it sent has been read). An
    /// empty `buf` returns 0 at once.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.with_stream(|stream| {
            if buf.is_empty() {
                return Ok(0);
            }
            let mut sock = stream;
            loop {
                match sock.read(buf) {
                    Ok(0) => {
                        if self.is_closed() {
                            return Err(Error::Closed);
                        }
                        trace!(fd = stream.as_raw_fd(), op = "read", "end of stream");
                        return Ok(0);
                    }
                    Ok(n) => {
                        trace!(fd = stream.as_raw_fd(), op = "read", bytes = n);
                        return Ok(n);
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                    Err(err) => return Err(self.failure("read", err)),
                }
            }
        })
    }

    /// Block until every byte of `buf` has been accepted by the kernel.
    ///
    /// This says nothing about whether the peer has read them. If a write
    /// deadline elapses part way, the prefix already sent stays sent.
    pub fn write(&self, buf: &[u8]) -> Result<()> {
        self.with_stream(|stream| {
            let mut sock = stream;
            let mut remaining = buf;
            while !remaining.is_empty() {
                match sock.write(remaining) {
                    Ok(0) => {
                        return Err(Error::IoFailure {
                            op: "write",
                            source: io::Error::from(io::ErrorKind::WriteZero),
                        });
                    }
                    Ok(n) => remaining = &remaining[n..],
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                    Err(err) => return Err(self.failure("write", err)),
                }
            }
            trace!(fd = stream.as_raw_fd(), op = "write", bytes = buf.len());
            Ok(())
        })
    }

    /// Bytes queued in the receive buffer right now, readable without
    /// blocking.
    ///
    /// Never blocks and never caches. A result of 0 is inconclusive: the
    /// peer may have written bytes that are not yet delivered.
    pub fn available_bytes(&self) -> Result<usize> {
        self.with_stream(|stream| {
            let fd = stream.as_raw_fd();
            let count = pending_bytes(fd).map_err(|err| self.failure("available", err))?;
            trace!(fd, op = "available", bytes = count);
            Ok(count)
        })
    }

    /// Shut down one or both directions of the socket without releasing
    /// the descriptor.
    pub fn shutdown(&self, how: Shutdown) -> Result<()> {
        self.with_stream(|stream| match stream.shutdown(how) {
            Ok(()) => Ok(()),
            // The peer is already gone; the direction is down either way.
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(self.failure("shutdown", err)),
        })
    }

    /// Release the descriptor. Idempotent.
    ///
    /// Operations blocked in other threads are woken by shutting the socket
    /// down first and return `Closed`; the descriptor is closed once they
    /// have left.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(stream) = self.stream.read().as_ref() {
            if let Err(err) = stream.shutdown(Shutdown::Both) {
                trace!(fd = stream.as_raw_fd(), error = %err, "shutdown before close");
            }
        }
        if let Some(stream) = self.stream.write().take() {
            let fd = stream.as_raw_fd();
            drop(stream);
            debug!(fd, "channel closed");
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The descriptor, while the channel is open.
    #[must_use]
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.with_stream(|stream| Ok(stream.as_raw_fd())).ok()
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.with_stream(|stream| {
            stream
                .set_read_timeout(timeout)
                .map_err(|source| Error::IoFailure {
                    op: "set_read_timeout",
                    source,
                })
        })
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.with_stream(|stream| {
            stream
                .set_write_timeout(timeout)
                .map_err(|source| Error::IoFailure {
                    op: "set_write_timeout",
                    source,
                })
        })
    }

    /// Local address; `None` for unnamed sockets (the connecting side).
    pub fn local_address(&self) -> Result<Option<EndpointAddress>> {
        self.with_stream(|stream| {
            let addr = stream.local_addr().map_err(|source| Error::IoFailure {
                op: "local_addr",
                source,
            })?;
            Ok(EndpointAddress::from_socket_addr(&addr))
        })
    }

    /// Peer address; `None` when the peer socket is unnamed.
    pub fn peer_address(&self) -> Result<Option<EndpointAddress>> {
        self.with_stream(|stream| {
            let addr = stream.peer_addr().map_err(|source| Error::IoFailure {
                op: "peer_addr",
                source,
            })?;
            Ok(EndpointAddress::from_socket_addr(&addr))
        })
    }
}

impl fmt::Debug for ByteChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteChannel")
            .field("fd", &self.raw_fd())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Ask the kernel how many bytes sit in the receive queue of `fd`.
#[allow(unsafe_code)]
fn pending_bytes(fd: RawFd) -> io::Result<usize> {
    let mut count: libc::c_int = 0;
    // SAFETY: FIONREAD stores one c_int through the pointer, which refers
    // to a live local; `fd` is kept open by the caller's read guard.
    let rc = unsafe { libc::ioctl(fd, libc::FIONREAD, &raw mut count) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(usize::try_from(count).unwrap_or(0))
}
