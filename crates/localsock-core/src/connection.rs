//! Bidirectional connection over one byte channel, with half-close.
//!
//! A socket stream is bidirectional over a single descriptor, so a
//! connection owns exactly one [`ByteChannel`] and two flags. Shutting down
//! one direction leaves the other usable; the descriptor is released when
//! both directions are down.
//!
//! Callers serialize same-direction operations themselves. Reading in one
//! thread while writing in another is fine, which is what [`Connection::reader`]
//! and [`Connection::writer`] are for.

use crate::address::EndpointAddress;
use crate::channel::ByteChannel;
use crate::config::SocketOptions;
use crate::error::{Error, Result};
use std::io;
use std::net::Shutdown;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

#[derive(Debug)]
pub struct Connection {
    channel: ByteChannel,
    read_open: AtomicBool,
    write_open: AtomicBool,
}

impl Connection {
    pub fn new(channel: ByteChannel) -> Self {
        Self {
            channel,
            read_open: AtomicBool::new(true),
            write_open: AtomicBool::new(true),
        }
    }

    /// Connect to a listening endpoint with default options.
    pub fn connect(address: &EndpointAddress) -> Result<Self> {
        Self::connect_with(address, &SocketOptions::default())
    }

    pub fn connect_with(address: &EndpointAddress, options: &SocketOptions) -> Result<Self> {
        let conn = Self::new(ByteChannel::connect(address)?);
        conn.apply_options(options)?;
        Ok(conn)
    }

    /// Two connected, unnamed ends.
    pub fn pair() -> Result<(Self, Self)> {
        let (a, b) = ByteChannel::pair()?;
        Ok((Self::new(a), Self::new(b)))
    }

    pub fn apply_options(&self, options: &SocketOptions) -> Result<()> {
        self.channel.set_read_timeout(options.read_timeout())?;
        self.channel.set_write_timeout(options.write_timeout())
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if !self.is_read_open() {
            return Err(Error::Closed);
        }
        self.channel.read(buf)
    }

    pub fn write(&self, buf: &[u8]) -> Result<()> {
        if !self.is_write_open() {
            return Err(Error::Closed);
        }
        self.channel.write(buf)
    }

    pub fn available_bytes(&self) -> Result<usize> {
        if !self.is_read_open() {
            return Err(Error::Closed);
        }
        self.channel.available_bytes()
    }

    /// Stop reading. Writes keep working until `shutdown_write`.
    pub fn shutdown_read(&self) -> Result<()> {
        if !self.read_open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.shutdown_channel(Shutdown::Read);
        self.release_if_done();
        result
    }

    /// Stop writing; the peer sees end of stream once it has drained what
    /// was already sent. Reads keep working until `shutdown_read`.
    pub fn shutdown_write(&self) -> Result<()> {
        if !self.write_open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.shutdown_channel(Shutdown::Write);
        self.release_if_done();
        result
    }

    /// A racing shutdown of the other direction may already have released
    /// the channel; that still counts as success.
    fn shutdown_channel(&self, how: Shutdown) -> Result<()> {
        match self.channel.shutdown(how) {
            Err(Error::Closed) => Ok(()),
            other => other,
        }
    }

    fn release_if_done(&self) {
        if !self.is_read_open() && !self.is_write_open() {
            debug!(fd = ?self.channel.raw_fd(), "both directions shut down");
            self.channel.close();
        }
    }

    /// Shut down both directions and release the descriptor. Idempotent.
    pub fn close(&self) {
        self.read_open.store(false, Ordering::Release);
        self.write_open.store(false, Ordering::Release);
        self.channel.close();
    }

    #[must_use]
    pub fn is_read_open(&self) -> bool {
        self.read_open.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_write_open(&self) -> bool {
        self.write_open.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }

    #[must_use]
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.channel.raw_fd()
    }

    pub fn local_address(&self) -> Result<Option<EndpointAddress>> {
        self.channel.local_address()
    }

    pub fn peer_address(&self) -> Result<Option<EndpointAddress>> {
        self.channel.peer_address()
    }

    /// `std::io::Read` view of the read direction.
    #[must_use]
    pub fn reader(&self) -> ReadHalf<'_> {
        ReadHalf { conn: self }
    }

    /// `std::io::Write` view of the write direction.
    #[must_use]
    pub fn writer(&self) -> WriteHalf<'_> {
        WriteHalf { conn: self }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReadHalf<'a> {
    conn: &'a Connection,
}

impl ReadHalf<'_> {
    pub fn available(&self) -> Result<usize> {
        self.conn.available_bytes()
    }

    pub fn shutdown(&self) -> Result<()> {
        self.conn.shutdown_read()
    }
}

impl io::Read for ReadHalf<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.conn.read(buf).map_err(Into::into)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WriteHalf<'a> {
    conn: &'a Connection,
}

impl WriteHalf<'_> {
    pub fn shutdown(&self) -> Result<()> {
        self.conn.shutdown_write()
    }
}

impl io::Write for WriteHalf<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.conn.write(buf)?;
        Ok(buf.len())
    }

    /// Nothing is buffered above the kernel.
    fn flush(&mut self) -> io::Result<()> {
        if self.conn.is_write_open() {
            Ok(())
        } else {
            Err(Error::Closed.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::sync::Arc;

    // ── Half-close ─────────────────────────────────────────────

    #[test]
    fn shutdown_read_keeps_writes_working() {
        let (a, b) = Connection::pair().unwrap();
        a.shutdown_read().unwrap();
        assert!(!a.is_read_open());
        assert!(a.is_write_open());
        assert!(!a.is_closed());

        a.write(b"still here").unwrap();
        let mut buf = [0u8; 32];
        let n = b.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"still here");
    }

    #[test]
    fn reads_fail_after_shutdown_read() {
        let (a, _b) = Connection::pair().unwrap();
        a.shutdown_read().unwrap();
        let mut buf = [0u8; 4];
        assert!(a.read(&mut buf).unwrap_err().is_closed());
        assert!(a.available_bytes().unwrap_err().is_closed());
    }

    #[test]
    fn shutdown_write_gives_peer_end_of_stream() {
        let (a, b) = Connection::pair().unwrap();
        a.write(b"bye").unwrap();
        a.shutdown_write().unwrap();
        assert!(a.write(b"more").unwrap_err().is_closed());

        let mut buf = [0u8; 8];
        let n = b.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"bye");
        assert_eq!(b.read(&mut buf).unwrap(), 0);

        // The reverse direction is untouched.
        b.write(b"ack").unwrap();
        let n = a.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ack");
    }

    #[test]
    fn both_shutdowns_release_descriptor() {
        let (a, b) = Connection::pair().unwrap();
        a.shutdown_read().unwrap();
        assert!(a.raw_fd().is_some());
        a.shutdown_write().unwrap();
        assert!(a.is_closed());
        assert!(a.raw_fd().is_none());

        let mut buf = [0u8; 4];
        assert_eq!(b.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn shutdowns_are_idempotent() {
        let (a, _b) = Connection::pair().unwrap();
        a.shutdown_write().unwrap();
        a.shutdown_write().unwrap();
        a.shutdown_read().unwrap();
        a.shutdown_read().unwrap();
        a.close();
        a.shutdown_read().unwrap();
    }

    #[test]
    fn close_is_idempotent() {
        let (a, _b) = Connection::pair().unwrap();
        a.close();
        a.close();
        assert!(a.is_closed());
        assert!(!a.is_read_open());
        assert!(!a.is_write_open());
    }

    #[test]
    fn concurrent_shutdowns_release_once() {
        for _ in 0..50 {
            let (a, _b) = Connection::pair().unwrap();
            let a = Arc::new(a);
            let t = std::thread::spawn({
                let a = Arc::clone(&a);
                move || a.shutdown_read()
            });
            a.shutdown_write().unwrap();
            t.join().unwrap().unwrap();
            assert!(a.is_closed());
        }
    }

    // ── Stream views ───────────────────────────────────────────

    #[test]
    fn reader_and_writer_views() {
        let (a, b) = Connection::pair().unwrap();
        let mut w = a.writer();
        w.write_all(b"via views").unwrap();
        w.flush().unwrap();

        let r = b.reader();
        assert_eq!(r.available().unwrap(), 9);
        let mut s = String::new();
        a.shutdown_write().unwrap();
        b.reader().read_to_string(&mut s).unwrap();
        assert_eq!(s, "via views");
        assert_eq!(r.available().unwrap(), 0);
    }

    #[test]
    fn views_in_separate_threads() {
        let (a, b) = Connection::pair().unwrap();
        let a = Arc::new(a);
        let reader = std::thread::spawn({
            let a = Arc::clone(&a);
            move || {
                let mut buf = Vec::new();
                a.reader().read_to_end(&mut buf).unwrap();
                buf
            }
        });
        a.writer().write_all(b"request").unwrap();

        let mut buf = [0u8; 16];
        let n = b.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"request");
        b.write(b"response").unwrap();
        b.shutdown_write().unwrap();

        assert_eq!(reader.join().unwrap(), b"response");
    }

    #[test]
    fn closed_view_maps_to_io_error() {
        let (a, _b) = Connection::pair().unwrap();
        a.shutdown_write().unwrap();
        let err = a.writer().write(b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert!(a.writer().flush().is_err());
    }

    // ── Options ────────────────────────────────────────────────

    #[test]
    fn read_timeout_option_applies() {
        let (a, _b) = Connection::pair().unwrap();
        a.apply_options(&SocketOptions {
            read_timeout_ms: 20,
            write_timeout_ms: 0,
        })
        .unwrap();
        let mut buf = [0u8; 4];
        let err = a.read(&mut buf).unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }), "{err:?}");

        let err = a.reader().read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
