//! Listener: binds an endpoint address and accepts connections one by one.

use crate::address::EndpointAddress;
use crate::channel::ByteChannel;
use crate::config::{ListenerOptions, SocketOptions};
use crate::connection::Connection;
use crate::error::{Error, Result};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use tracing::{debug, warn};

/// Identity of the socket file a listener created, so that `close` never
/// unlinks a file somebody else put at the same path afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SocketFileId {
    dev: u64,
    ino: u64,
}

impl SocketFileId {
    fn of(path: &Path) -> Option<Self> {
        let meta = std::fs::symlink_metadata(path).ok()?;
        meta.file_type().is_socket().then(|| Self {
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }
}

#[derive(Debug)]
pub struct Listener {
    inner: Option<UnixListener>,
    address: EndpointAddress,
    created: Option<SocketFileId>,
    socket_options: SocketOptions,
}

impl Listener {
    /// Bind with default options.
    pub fn bind(address: &EndpointAddress) -> Result<Self> {
        Self::bind_with(address, &ListenerOptions::default())
    }

    /// Bind `address`.
    ///
    /// Fails with `AddressInUse` when a live listener owns the address. A
    /// leftover socket file nobody listens on any more is removed first when
    /// `options.reclaim_stale` is set.
    pub fn bind_with(address: &EndpointAddress, options: &ListenerOptions) -> Result<Self> {
        let addr = address.to_socket_addr()?;
        let listener = match UnixListener::bind_addr(&addr) {
            Ok(listener) => listener,
            Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
                if !options.reclaim_stale || !reclaim_stale_socket(address) {
                    return Err(Error::AddressInUse(address.clone()));
                }
                UnixListener::bind_addr(&addr).map_err(|err| bind_error(address, err))?
            }
            Err(err) => return Err(bind_error(address, err)),
        };

        let created = address.as_path().and_then(SocketFileId::of);
        if let (Some(mode), Some(path)) = (options.socket_mode, address.as_path()) {
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(
                |source| Error::IoFailure {
                    op: "chmod socket",
                    source,
                },
            )?;
        }

        debug!(fd = listener.as_raw_fd(), %address, "listening");
        Ok(Self {
            inner: Some(listener),
            address: address.clone(),
            created,
            socket_options: SocketOptions::default(),
        })
    }

    /// Options applied to every accepted connection.
    pub fn set_socket_options(&mut self, options: SocketOptions) {
        self.socket_options = options;
    }

    /// Block until a peer connects.
    pub fn accept(&self) -> Result<Connection> {
        let listener = self.inner.as_ref().ok_or(Error::Closed)?;
        let stream = loop {
            match listener.accept() {
                Ok((stream, _addr)) => break stream,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(source) => return Err(Error::IoFailure { op: "accept", source }),
            }
        };
        debug!(fd = stream.as_raw_fd(), address = %self.address, "accepted");
        let conn = Connection::new(ByteChannel::new(stream)?);
        conn.apply_options(&self.socket_options)?;
        Ok(conn)
    }

    /// Endless iterator over `accept`.
    pub fn incoming(&self) -> impl Iterator<Item = Result<Connection>> + '_ {
        std::iter::repeat_with(move || self.accept())
    }

    /// Stop accepting and remove the socket file this listener created.
    /// Idempotent.
    pub fn close(&mut self) {
        let Some(listener) = self.inner.take() else {
            return;
        };
        drop(listener);
        if let (Some(path), Some(created)) = (self.address.as_path(), self.created.take()) {
            if SocketFileId::of(path) == Some(created) {
                if let Err(err) = std::fs::remove_file(path) {
                    warn!(path = %path.display(), error = %err, "failed to unlink socket");
                }
            }
        }
        debug!(address = %self.address, "listener closed");
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    #[must_use]
    pub fn address(&self) -> &EndpointAddress {
        &self.address
    }

    #[must_use]
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.inner.as_ref().map(AsRawFd::as_raw_fd)
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

fn bind_error(address: &EndpointAddress, source: io::Error) -> Error {
    if source.kind() == io::ErrorKind::AddrInUse {
        Error::AddressInUse(address.clone())
    } else {
        Error::IoFailure { op: "bind", source }
    }
}

/// Remove a socket file whose listener has gone away.
///
/// Probing connects to the path: a refused connection means nobody is
/// listening. A live listener sees (and can ignore) one empty connection.
fn reclaim_stale_socket(address: &EndpointAddress) -> bool {
    let Some(path) = address.as_path() else {
        return false;
    };
    if SocketFileId::of(path).is_none() {
        return false;
    }
    match UnixStream::connect(path) {
        Ok(_) => false,
        Err(err) if err.kind() == io::ErrorKind::ConnectionRefused => {
            match std::fs::remove_file(path) {
                Ok(()) => {
                    warn!(path = %path.display(), "removed stale socket file");
                    true
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "cannot remove stale socket");
                    false
                }
            }
        }
        Err(_) => false,
    }
}
