//! localsock-core: blocking stream I/O over Unix domain sockets
//!
//! # Architecture
//!
//! ```text
//! Listener ──accept──▶ Connection ──owns──▶ ByteChannel ──▶ kernel socket
//!                          ▲
//!                 Session Driver (scripted send/sleep/receive)
//! ```
//!
//! # Modules
//!
//! - `address`: endpoint addresses (filesystem path or `@abstract` name)
//! - `channel`: one owned socket: blocking read/write, `available_bytes`, close
//! - `connection`: bidirectional handle with half-close
//! - `listener`: bind/accept/close, stale socket reclaim
//! - `session`: client/server scenarios exercising the available-bytes contract
//! - `config`: localsock.toml
//! - `logging`: tracing subscriber setup
//! - `error`: error taxonomy
//!
//! # Safety
//!
//! The only unsafe code is the `FIONREAD` ioctl in `channel`.

pub mod address;
pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod listener;
pub mod logging;
pub mod session;

pub use address::EndpointAddress;
pub use channel::ByteChannel;
pub use config::{Config, ListenerOptions, SocketOptions};
pub use connection::{Connection, ReadHalf, WriteHalf};
pub use error::{Error, Result};
pub use listener::Listener;

/// Connect to a listening endpoint.
pub fn connect(address: &EndpointAddress) -> Result<Connection> {
    Connection::connect(address)
}
