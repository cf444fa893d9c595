//! Error types for localsock-core

use crate::address::EndpointAddress;
use crate::config::ConfigError;
use std::io;
use thiserror::Error;

/// Errors surfaced by channels, connections and listeners.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The channel was closed, or the direction was shut down, before or
    /// during the operation.
    #[error("socket channel is closed")]
    Closed,

    /// Underlying transport error (peer reset, broken pipe, refused, ...).
    #[error("{op} failed")]
    IoFailure {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// Another live listener already owns the address.
    #[error("address {0} is already in use")]
    AddressInUse(EndpointAddress),

    /// A configured read/write deadline elapsed.
    #[error("{op} timed out")]
    Timeout { op: &'static str },

    #[error("invalid endpoint address: {0}")]
    InvalidAddress(String),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

impl Error {
    /// Classify an OS error raised by `op`.
    ///
    /// Deadlines installed through `set_read_timeout`/`set_write_timeout`
    /// surface as `WouldBlock` (Linux) or `TimedOut` (some BSDs).
    pub(crate) fn from_io(op: &'static str, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Self::Timeout { op },
            _ => Self::IoFailure { op, source },
        }
    }

    /// True for `Closed`.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// The OS error kind for transport failures, if any.
    #[must_use]
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Self::IoFailure { source, .. } => Some(source.kind()),
            _ => None,
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Closed => io::Error::new(io::ErrorKind::NotConnected, err),
            Error::IoFailure { source, .. } => source,
            Error::AddressInUse(_) => io::Error::new(io::ErrorKind::AddrInUse, err),
            Error::Timeout { .. } => io::Error::new(io::ErrorKind::TimedOut, err),
            Error::InvalidAddress(_) => io::Error::new(io::ErrorKind::InvalidInput, err),
            Error::Config(_) => io::Error::other(err),
        }
    }
}

/// Result type alias using localsock's Error
pub type Result<T> = std::result::Result<T, Error>;
