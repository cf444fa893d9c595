//! Listener and connection lifecycle across threads.

#![cfg(unix)]

use localsock_core::config::{ListenerOptions, SocketOptions};
use localsock_core::{Connection, EndpointAddress, Error, Listener};
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn socket_in(dir: &TempDir, name: &str) -> EndpointAddress {
    EndpointAddress::from_path(dir.path().join(name))
}

// =============================================================================
// Accept / connect
// =============================================================================

#[test]
fn accept_serves_several_clients_in_order() {
    let dir = TempDir::new().unwrap();
    let addr = socket_in(&dir, "multi.sock");
    let listener = Listener::bind(&addr).unwrap();

    let clients: Vec<_> = (0u8..3)
        .map(|i| {
            let addr = addr.clone();
            thread::spawn(move || {
                let conn = localsock_core::connect(&addr).unwrap();
                conn.write(&[i]).unwrap();
                conn.shutdown_write().unwrap();
                let mut buf = [0u8; 1];
                assert_eq!(conn.read(&mut buf).unwrap(), 1);
                assert_eq!(buf[0], i + 100);
            })
        })
        .collect();

    for conn in listener.incoming().take(3) {
        let conn = conn.unwrap();
        let mut buf = Vec::new();
        conn.reader().read_to_end(&mut buf).unwrap();
        assert_eq!(buf.len(), 1);
        conn.writer().write_all(&[buf[0] + 100]).unwrap();
        conn.close();
    }
    for client in clients {
        client.join().unwrap();
    }
}

#[test]
fn accepted_connections_inherit_socket_options() {
    let dir = TempDir::new().unwrap();
    let addr = socket_in(&dir, "opts.sock");
    let mut listener = Listener::bind(&addr).unwrap();
    listener.set_socket_options(SocketOptions {
        read_timeout_ms: 30,
        write_timeout_ms: 0,
    });

    let _client = Connection::connect(&addr).unwrap();
    let server = listener.accept().unwrap();
    let mut buf = [0u8; 4];
    let err = server.read(&mut buf).unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }), "{err:?}");
}

// =============================================================================
// Close semantics
// =============================================================================

#[test]
fn close_from_another_thread_unblocks_read() {
    let (a, _b) = Connection::pair().unwrap();
    let a = Arc::new(a);
    let reader = thread::spawn({
        let a = Arc::clone(&a);
        move || {
            let mut buf = [0u8; 8];
            a.read(&mut buf)
        }
    });
    thread::sleep(Duration::from_millis(50));
    a.close();
    let result = reader.join().unwrap();
    assert!(
        matches!(result, Err(Error::Closed) | Ok(0)),
        "unexpected read result: {result:?}"
    );
    assert!(a.read(&mut [0u8; 1]).unwrap_err().is_closed());
}

#[test]
fn peer_close_after_write_delivers_then_ends() {
    let dir = TempDir::new().unwrap();
    let addr = socket_in(&dir, "eof.sock");
    let listener = Listener::bind(&addr).unwrap();

    let client = Connection::connect(&addr).unwrap();
    let server = listener.accept().unwrap();
    client.write(b"last words").unwrap();
    client.close();

    let mut buf = [0u8; 32];
    let n = server.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"last words");
    assert_eq!(server.read(&mut buf).unwrap(), 0);
    assert_eq!(server.read(&mut buf).unwrap(), 0);
    assert_eq!(server.available_bytes().unwrap(), 0);
}

#[test]
fn listener_close_unlinks_and_frees_address() {
    let dir = TempDir::new().unwrap();
    let addr = socket_in(&dir, "rebind.sock");
    let path = addr.as_path().unwrap().to_path_buf();

    let mut first = Listener::bind(&addr).unwrap();
    assert!(path.exists());
    first.close();
    first.close();
    assert!(!path.exists());

    let second = Listener::bind(&addr).unwrap();
    assert!(path.exists());
    drop(second);
    assert!(!path.exists());
}

#[test]
fn stale_socket_file_is_reclaimed() {
    let dir = TempDir::new().unwrap();
    let addr = socket_in(&dir, "stale.sock");
    let path = addr.as_path().unwrap().to_path_buf();

    // A socket file whose owner went away without unlinking it.
    drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
    assert!(path.exists());

    let listener = Listener::bind(&addr).unwrap();
    let client = Connection::connect(&addr).unwrap();
    let server = listener.accept().unwrap();
    client.write(b"ok").unwrap();
    assert_eq!(server.available_bytes().unwrap(), 2);
}

#[test]
fn stale_socket_kept_when_reclaim_disabled() {
    let dir = TempDir::new().unwrap();
    let addr = socket_in(&dir, "keep.sock");
    drop(std::os::unix::net::UnixListener::bind(addr.as_path().unwrap()).unwrap());

    let options = ListenerOptions {
        reclaim_stale: false,
        ..ListenerOptions::default()
    };
    let err = Listener::bind_with(&addr, &options).unwrap_err();
    assert!(matches!(err, Error::AddressInUse(_)), "{err:?}");
}

#[test]
fn socket_mode_is_applied() {
    let dir = TempDir::new().unwrap();
    let addr = socket_in(&dir, "mode.sock");
    let options = ListenerOptions {
        socket_mode: Some(0o600),
        ..ListenerOptions::default()
    };
    let _listener = Listener::bind_with(&addr, &options).unwrap();
    let mode = std::fs::metadata(addr.as_path().unwrap())
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o600);
}
