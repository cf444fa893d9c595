//! Session driver: scripted client/server exchanges that check the
//! available-bytes contract end to end.
//!
//! One side writes a run of sequential bytes (`A`, `B`, `C`, ...), sleeps,
//! then receives the same run from its peer; the other side sleeps,
//! receives, then writes. [`receive_bytes`] checks the byte counts reported
//! by `available_bytes()` along the way.
//!
//! The server side runs on its own thread. Whatever it returns, error or
//! panic included, is handed back to the thread that joins it.

use crate::address::EndpointAddress;
use crate::config::{MAX_SCENARIO_BYTES, ScenarioConfig};
use crate::connection::Connection;
use crate::error::Error;
use crate::listener::Listener;
use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// First byte of every test payload.
pub const FIRST_PAYLOAD_BYTE: u8 = b'A';

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Socket(#[from] Error),

    #[error("{what}: expected {expected}, got {actual}")]
    Mismatch {
        what: String,
        expected: usize,
        actual: usize,
    },

    #[error("server handler panicked: {0}")]
    ServerPanicked(String),

    #[error("server did not finish within {0:?}")]
    ServerTimeout(Duration),

    #[error("server thread exited without reporting a result")]
    ServerVanished,

    #[error("scenario payload of {bytes} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { bytes: usize, max: usize },
}

fn expect_eq(what: impl Into<String>, expected: usize, actual: usize) -> Result<(), SessionError> {
    if expected == actual {
        Ok(())
    } else {
        Err(SessionError::Mismatch {
            what: what.into(),
            expected,
            actual,
        })
    }
}

/// `len` sequential bytes starting at `A`, wrapping past 255.
#[must_use]
pub fn test_payload(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| FIRST_PAYLOAD_BYTE.wrapping_add(i as u8))
        .collect()
}

/// Write `test_payload(len)` in a single call.
pub fn send_bytes(conn: &Connection, len: usize) -> Result<(), SessionError> {
    conn.write(&test_payload(len))?;
    debug!(bytes = len, "sent payload");
    Ok(())
}

/// What one side observed while receiving.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReceiveReport {
    /// `available_bytes()` before anything was read.
    pub initial_available: usize,
    /// The first query returned 0 and a one-byte priming read was needed.
    pub primed: bool,
    /// Bytes returned by the main read (not counting the priming byte).
    pub bytes_read: usize,
    /// Everything received, priming byte included.
    pub data: Vec<u8>,
}

/// Receive exactly `expected` payload bytes and check how
/// `available_bytes()` moves.
///
/// A first query of 0 is inconclusive (the peer's bytes may not be
/// delivered yet). In that case one byte is read with a blocking read, it
/// must be `A`, and the rest is expected to follow from `B`. The count then
/// reported must match what is still expected, a single read must return
/// all of it, and the channel must report 0 afterwards.
pub fn receive_bytes(conn: &Connection, expected: usize) -> Result<ReceiveReport, SessionError> {
    let mut to_expect = expected;
    let mut first = FIRST_PAYLOAD_BYTE;
    let mut data = Vec::with_capacity(expected);

    let initial_available = conn.available_bytes()?;
    let mut available = initial_available;
    let primed = available == 0 && expected != 0;
    if primed {
        let mut one = [0u8; 1];
        let n = conn.read(&mut one)?;
        expect_eq("priming read length", 1, n)?;
        expect_eq("priming byte", usize::from(first), usize::from(one[0]))?;
        data.push(one[0]);
        to_expect -= 1;
        first = first.wrapping_add(1);
        available = conn.available_bytes()?;
        debug!(available, "available after priming read");
    }
    expect_eq("available bytes", to_expect, available)?;

    let mut buf = vec![0u8; expected];
    let bytes_read = if to_expect == 0 { 0 } else { conn.read(&mut buf)? };
    expect_eq("bytes read", to_expect, bytes_read)?;
    for (i, &byte) in buf[..bytes_read].iter().enumerate() {
        let want = first.wrapping_add(i as u8);
        expect_eq(format!("byte {i}"), usize::from(want), usize::from(byte))?;
    }
    data.extend_from_slice(&buf[..bytes_read]);

    expect_eq("available bytes after read", 0, conn.available_bytes()?)?;
    debug!(initial_available, primed, bytes_read, "received payload");

    Ok(ReceiveReport {
        initial_available,
        primed,
        bytes_read,
        data,
    })
}

/// A handler running on its own thread against one accepted connection.
pub struct ServerThread<T> {
    handle: JoinHandle<()>,
    outcome: Receiver<Result<T, SessionError>>,
    /// Signalled once the thread has dropped its listener.
    released: Receiver<()>,
    abandoned: Arc<AtomicBool>,
    address: EndpointAddress,
}

impl<T: Send + 'static> ServerThread<T> {
    /// Accept one connection on `listener` in a new thread and run
    /// `handler` on it. The listener is closed as soon as `accept` returns
    /// and the connection when the handler returns.
    pub fn spawn<F>(listener: Listener, handler: F) -> Result<Self, SessionError>
    where
        F: FnOnce(&Connection) -> Result<T, SessionError> + Send + 'static,
    {
        let (tx, rx) = channel::bounded(1);
        let (released_tx, released) = channel::bounded(1);
        let abandoned = Arc::new(AtomicBool::new(false));
        let address = listener.address().clone();
        let handle = std::thread::Builder::new()
            .name("localsock-server".to_string())
            .spawn({
                let abandoned = Arc::clone(&abandoned);
                move || {
                    let accepted = listener.accept();
                    drop(listener);
                    let _ = released_tx.send(());
                    let outcome = accepted.map_err(SessionError::from).and_then(|conn| {
                        if abandoned.load(Ordering::Acquire) {
                            debug!("server abandoned; dropping late connection");
                            conn.close();
                            return Err(SessionError::ServerVanished);
                        }
                        let result = handler(&conn);
                        conn.close();
                        result
                    });
                    // The driver may have given up waiting.
                    let _ = tx.send(outcome);
                }
            })
            .map_err(|source| Error::IoFailure {
                op: "spawn server thread",
                source,
            })?;
        Ok(Self {
            handle,
            outcome: rx,
            released,
            abandoned,
            address,
        })
    }

    #[must_use]
    pub fn address(&self) -> &EndpointAddress {
        &self.address
    }

    /// Wait for the handler and return its result, re-raising a panic as
    /// `ServerPanicked`.
    pub fn join(self) -> Result<T, SessionError> {
        match self.outcome.recv() {
            Ok(outcome) => {
                let _ = self.handle.join();
                outcome
            }
            Err(_) => Err(reap_failed(self.handle)),
        }
    }

    /// Like `join`, giving up after `deadline`.
    ///
    /// On timeout the listener is released before returning: a thread still
    /// waiting in `accept` is woken and exits without running the handler.
    /// A thread already inside the handler is left running detached.
    pub fn join_timeout(self, deadline: Duration) -> Result<T, SessionError> {
        match self.outcome.recv_timeout(deadline) {
            Ok(outcome) => {
                let _ = self.handle.join();
                outcome
            }
            Err(RecvTimeoutError::Timeout) => {
                self.abandon(deadline);
                Err(SessionError::ServerTimeout(deadline))
            }
            Err(RecvTimeoutError::Disconnected) => Err(reap_failed(self.handle)),
        }
    }

    fn abandon(&self, grace: Duration) {
        self.abandoned.store(true, Ordering::Release);
        if self.released.try_recv().is_ok() {
            return;
        }
        // Fails harmlessly when accept already returned.
        if let Ok(wake) = Connection::connect(&self.address) {
            wake.close();
        }
        if self.released.recv_timeout(grace).is_err() {
            warn!(address = %self.address, "server listener not released after timeout");
        }
    }
}

/// The thread dropped its sender without sending: it panicked.
fn reap_failed(handle: JoinHandle<()>) -> SessionError {
    match handle.join() {
        Err(payload) => SessionError::ServerPanicked(panic_message(payload.as_ref())),
        Ok(()) => SessionError::ServerVanished,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Which side of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => f.write_str("client"),
            Self::Server => f.write_str("server"),
        }
    }
}

/// One availability scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scenario {
    /// The side that writes first. The other side is the one whose
    /// `available_bytes()` is exercised first.
    pub first_writer: Role,
    pub bytes: usize,
    pub settle: Duration,
    pub deadline: Duration,
}

impl Scenario {
    /// Server writes, client checks `available_bytes()`, then reversed.
    #[must_use]
    pub fn available_at_client() -> Self {
        Self::from_config(Role::Server, &ScenarioConfig::default())
    }

    /// Client writes, server checks `available_bytes()`, then reversed.
    #[must_use]
    pub fn available_at_server() -> Self {
        Self::from_config(Role::Client, &ScenarioConfig::default())
    }

    #[must_use]
    pub fn from_config(first_writer: Role, config: &ScenarioConfig) -> Self {
        Self {
            first_writer,
            bytes: config.bytes,
            settle: Duration::from_millis(config.settle_ms),
            deadline: Duration::from_millis(config.deadline_ms),
        }
    }

    /// The side whose availability is checked first.
    #[must_use]
    pub fn checked_side(&self) -> Role {
        match self.first_writer {
            Role::Client => Role::Server,
            Role::Server => Role::Client,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self.first_writer {
            Role::Server => "available-at-client",
            Role::Client => "available-at-server",
        }
    }

    /// Run this side's script: write, sleep, receive for the first writer;
    /// sleep, receive, write for its peer.
    pub fn run_side(&self, conn: &Connection, side: Role) -> Result<ReceiveReport, SessionError> {
        let span = tracing::debug_span!("scenario_side", role = %side, scenario = self.name());
        let _guard = span.enter();
        if side == self.first_writer {
            send_bytes(conn, self.bytes)?;
            std::thread::sleep(self.settle);
            receive_bytes(conn, self.bytes)
        } else {
            std::thread::sleep(self.settle);
            let report = receive_bytes(conn, self.bytes)?;
            send_bytes(conn, self.bytes)?;
            Ok(report)
        }
    }
}

/// Outcome of a completed scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub scenario: &'static str,
    pub first_writer: Role,
    pub bytes: usize,
    pub client: ReceiveReport,
    pub server: ReceiveReport,
    pub elapsed_ms: u64,
}

/// A side's failure and when it happened.
type TimedFailure = (SessionError, Instant);

/// Bind `address`, run `scenario` between a server thread and a client on
/// the calling thread, and return both sides' observations.
///
/// When both sides fail, the earlier failure is reported: the later one is
/// usually the peer seeing the connection close underneath it.
pub fn run_scenario(
    address: &EndpointAddress,
    scenario: &Scenario,
) -> Result<ScenarioReport, SessionError> {
    let script = *scenario;
    run_with_server(address, scenario, move |conn| {
        script.run_side(conn, Role::Server)
    })
}

fn run_with_server<F>(
    address: &EndpointAddress,
    scenario: &Scenario,
    server_side: F,
) -> Result<ScenarioReport, SessionError>
where
    F: FnOnce(&Connection) -> Result<ReceiveReport, SessionError> + Send + 'static,
{
    if scenario.bytes > MAX_SCENARIO_BYTES {
        return Err(SessionError::PayloadTooLarge {
            bytes: scenario.bytes,
            max: MAX_SCENARIO_BYTES,
        });
    }
    let started = Instant::now();
    let listener = Listener::bind(address)?;
    let server = ServerThread::spawn(listener, move |conn| {
        Ok(server_side(conn).map_err(|err| (err, Instant::now())))
    })?;

    let client = Connection::connect(address)
        .map_err(SessionError::from)
        .and_then(|conn| {
            let report = scenario
                .run_side(&conn, Role::Client)
                .map_err(|err| (err, Instant::now()));
            conn.close();
            Ok(report)
        })
        .unwrap_or_else(|err| Err((err, Instant::now())));
    let server = server.join_timeout(scenario.deadline);

    let (client, server) = settle_outcomes(client, server)?;

    let report = ScenarioReport {
        scenario: scenario.name(),
        first_writer: scenario.first_writer,
        bytes: scenario.bytes,
        client,
        server,
        elapsed_ms: started.elapsed().as_millis() as u64,
    };
    info!(
        scenario = report.scenario,
        bytes = report.bytes,
        client_primed = report.client.primed,
        server_primed = report.server.primed,
        elapsed_ms = report.elapsed_ms,
        "scenario passed"
    );
    Ok(report)
}

/// Pick the result of a two-sided run.
fn settle_outcomes(
    client: Result<ReceiveReport, TimedFailure>,
    server: Result<Result<ReceiveReport, TimedFailure>, SessionError>,
) -> Result<(ReceiveReport, ReceiveReport), SessionError> {
    match (client, server) {
        (Ok(client), Ok(Ok(server))) => Ok((client, server)),
        (Err((client, client_at)), Ok(Err((server, server_at)))) => {
            debug!(%client, %server, "both sides failed");
            Err(if server_at < client_at { server } else { client })
        }
        // The server never got a peer to talk to.
        (Err((err, _)), Err(SessionError::ServerTimeout(_))) => Err(err),
        (_, Err(err)) | (Err((err, _)), Ok(Ok(_))) | (Ok(_), Ok(Err((err, _)))) => Err(err),
    }
}
