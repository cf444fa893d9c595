//! Endpoint addresses for local-domain sockets.
//!
//! An address is either a filesystem path or, on Linux, a name in the
//! abstract socket namespace. Abstract names are written with a leading `@`
//! on the command line and in config files (`@my-service`), mirroring the
//! notation used by `ss` and `netstat`.

use crate::error::{Error, Result};
use std::fmt;
use std::os::unix::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Prefix that selects the abstract namespace when parsing.
pub const ABSTRACT_PREFIX: char = '@';

/// Identifies a local-domain socket endpoint.
///
/// Addresses compare bit-for-bit: two listeners binding equal addresses
/// collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EndpointAddress {
    /// A socket file in the filesystem.
    Path(PathBuf),
    /// A Linux abstract-namespace name (without the leading NUL).
    Abstract(Vec<u8>),
}

impl EndpointAddress {
    /// Parse the textual form: `@name` is abstract, anything else a path.
    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::InvalidAddress("address is empty".to_string()));
        }
        if s.contains('\0') {
            return Err(Error::InvalidAddress(format!(
                "address {s:?} contains a NUL byte"
            )));
        }
        match s.strip_prefix(ABSTRACT_PREFIX) {
            Some("") => Err(Error::InvalidAddress(
                "abstract name after '@' is empty".to_string(),
            )),
            Some(name) => Ok(Self::Abstract(name.as_bytes().to_vec())),
            None => Ok(Self::Path(PathBuf::from(s))),
        }
    }

    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self::Path(path.into())
    }

    pub fn from_abstract(name: impl Into<Vec<u8>>) -> Self {
        Self::Abstract(name.into())
    }

    /// The socket file path, for filesystem addresses.
    #[must_use]
    pub fn as_path(&self) -> Option<&Path> {
        match self {
            Self::Path(path) => Some(path),
            Self::Abstract(_) => None,
        }
    }

    #[must_use]
    pub fn is_abstract(&self) -> bool {
        matches!(self, Self::Abstract(_))
    }

    /// Convert into the std socket address used for bind/connect.
    ///
    /// Fails with `InvalidAddress` for paths that do not fit `sun_path` and
    /// for abstract names on platforms without an abstract namespace.
    pub fn to_socket_addr(&self) -> Result<SocketAddr> {
        match self {
            Self::Path(path) => SocketAddr::from_pathname(path)
                .map_err(|err| Error::InvalidAddress(format!("{}: {err}", path.display()))),
            Self::Abstract(name) => abstract_socket_addr(name),
        }
    }

    /// Recover an address from a std socket address; `None` when unnamed.
    #[must_use]
    pub fn from_socket_addr(addr: &SocketAddr) -> Option<Self> {
        if let Some(path) = addr.as_pathname() {
            return Some(Self::Path(path.to_path_buf()));
        }
        abstract_name_of(addr).map(Self::Abstract)
    }
}

#[cfg(target_os = "linux")]
fn abstract_socket_addr(name: &[u8]) -> Result<SocketAddr> {
    use std::os::linux::net::SocketAddrExt;
    SocketAddr::from_abstract_name(name).map_err(|err| {
        Error::InvalidAddress(format!(
            "@{}: {err}",
            String::from_utf8_lossy(name)
        ))
    })
}

#[cfg(not(target_os = "linux"))]
fn abstract_socket_addr(name: &[u8]) -> Result<SocketAddr> {
    Err(Error::InvalidAddress(format!(
        "@{}: abstract socket names are only supported on Linux",
        String::from_utf8_lossy(name)
    )))
}

#[cfg(target_os = "linux")]
fn abstract_name_of(addr: &SocketAddr) -> Option<Vec<u8>> {
    use std::os::linux::net::SocketAddrExt;
    addr.as_abstract_name().map(<[u8]>::to_vec)
}

#[cfg(not(target_os = "linux"))]
fn abstract_name_of(_addr: &SocketAddr) -> Option<Vec<u8>> {
    None
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => write!(f, "{}", path.display()),
            Self::Abstract(name) => {
                write!(f, "{ABSTRACT_PREFIX}{}", String::from_utf8_lossy(name))
            }
        }
    }
}

impl FromStr for EndpointAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl From<PathBuf> for EndpointAddress {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<&Path> for EndpointAddress {
    fn from(path: &Path) -> Self {
        Self::Path(path.to_path_buf())
    }
}
