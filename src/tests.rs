//! End-to-end establishment and acquisition scenarios against an
//! in-process server speaking the startup protocol.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;

use crate::{
    connect, ConnInfo, Connection, ConnectionProvider, ConnectionSource, Connector, Deadline,
    Error, Pool, PoolConfig,
};

// ============================================================================
// Scripted server helpers
// ============================================================================

/// Frame a backend message: tag, length (including itself), body.
fn msg(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    out.extend(((body.len() + 4) as i32).to_be_bytes());
    out.extend(body);
    out
}

fn auth_ok() -> Vec<u8> {
    msg(b'R', &0i32.to_be_bytes())
}

fn auth_cleartext() -> Vec<u8> {
    msg(b'R', &3i32.to_be_bytes())
}

fn parameter_status(name: &str, value: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend(name.as_bytes());
    body.push(0);
    body.extend(value.as_bytes());
    body.push(0);
    msg(b'S', &body)
}

fn backend_key(pid: i32, secret: i32) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend(pid.to_be_bytes());
    body.extend(secret.to_be_bytes());
    msg(b'K', &body)
}

fn ready_for_query() -> Vec<u8> {
    msg(b'Z', b"I")
}

fn error_response(severity: &str, code: &str, message: &str) -> Vec<u8> {
    let mut body = Vec::new();
    for (tag, value) in [(b'S', severity), (b'C', code), (b'M', message)] {
        body.push(tag);
        body.extend(value.as_bytes());
        body.push(0);
    }
    body.push(0);
    msg(b'E', &body)
}

/// Read the client's startup packet (length-prefixed, untagged).
async fn read_startup(sock: &mut TcpStream) {
    let mut len_buf = [0u8; 4];
    sock.read_exact(&mut len_buf).await.unwrap();
    let len = i32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len - 4];
    sock.read_exact(&mut body).await.unwrap();
}

/// Drain the socket until the client goes away, so the scripted bytes
/// are never clobbered by an early close.
async fn hold_until_eof(mut sock: TcpStream) {
    let mut sink = [0u8; 256];
    while matches!(sock.read(&mut sink).await, Ok(n) if n > 0) {}
}

/// Serve one connection: consume the startup packet, send `script`,
/// then hold the socket open.
async fn serve_once(script: Vec<u8>) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        read_startup(&mut sock).await;
        sock.write_all(&script).await.unwrap();
        hold_until_eof(sock).await;
    });
    addr
}

fn happy_script() -> Vec<u8> {
    let mut script = auth_ok();
    script.extend(parameter_status("server_version", "16.3"));
    script.extend(backend_key(4242, 117));
    script.extend(ready_for_query());
    script
}

// ============================================================================
// Establishment scenarios
// ============================================================================

#[tokio::test]
async fn establishes_against_cooperative_server() {
    let addr = serve_once(happy_script()).await;
    let source = ConnInfo::new(format!("postgresql://postgres@{addr}/postgres"));

    let conn = source
        .open(Handle::current(), Deadline::After(Duration::from_secs(5)))
        .await
        .unwrap();

    assert!(conn.is_open());
    assert!(!conn.is_bad());
    assert_eq!(conn.error_context(), "");
    let raw = conn.native_handle().unwrap();
    assert_eq!(raw.parameter("server_version"), Some("16.3"));
    assert_eq!(raw.backend_pid(), 4242);
}

#[tokio::test]
async fn authenticates_with_cleartext_password() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        read_startup(&mut sock).await;
        sock.write_all(&auth_cleartext()).await.unwrap();

        let mut tag = [0u8; 1];
        sock.read_exact(&mut tag).await.unwrap();
        assert_eq!(tag[0], b'p');
        let mut len_buf = [0u8; 4];
        sock.read_exact(&mut len_buf).await.unwrap();
        let len = i32::from_be_bytes(len_buf) as usize;
        let mut password = vec![0u8; len - 4];
        sock.read_exact(&mut password).await.unwrap();
        assert_eq!(password, b"sesame\0");

        let mut script = auth_ok();
        script.extend(ready_for_query());
        sock.write_all(&script).await.unwrap();
        hold_until_eof(sock).await;
    });

    let source = ConnInfo::new(format!("postgresql://postgres:sesame@{addr}/postgres"));
    let conn = source
        .open(Handle::current(), Deadline::After(Duration::from_secs(5)))
        .await
        .unwrap();
    assert!(!conn.is_bad());
}

#[tokio::test]
async fn server_error_during_startup_fails_polling() {
    let addr = serve_once(error_response(
        "FATAL",
        "28P01",
        "password authentication failed",
    ))
    .await;

    let mut conn = Connection::new(Handle::current());
    let res = connect(
        &mut conn,
        &format!("postgres://postgres@{addr}/postgres"),
        Deadline::After(Duration::from_secs(5)),
    )
    .await;

    assert!(matches!(res, Err(Error::ConnectPollFailed)));
    assert!(conn.is_bad());
    assert!(conn.error_message().contains("password authentication failed"));
    assert!(conn.error_context().contains("password authentication failed"));
}

#[tokio::test]
async fn refused_connection_fails_polling() {
    // Bind then drop to obtain a port that actively refuses
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut conn = Connection::new(Handle::current());
    let res = connect(
        &mut conn,
        &format!("postgres://postgres@{addr}/postgres"),
        Deadline::After(Duration::from_secs(5)),
    )
    .await;

    assert!(matches!(res, Err(Error::ConnectPollFailed)));
    assert!(conn.is_bad());
}

#[tokio::test]
async fn silent_server_hits_the_deadline() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (sock, _) = listener.accept().await.unwrap();
        hold_until_eof(sock).await;
    });

    let mut conn = Connection::new(Handle::current());
    let res = connect(
        &mut conn,
        &format!("postgres://postgres@{addr}/postgres"),
        Deadline::After(Duration::from_millis(50)),
    )
    .await;

    assert!(matches!(res, Err(Error::TimedOut)));
}

// ============================================================================
// Acquisition scenarios
// ============================================================================

#[tokio::test]
async fn connector_opens_through_its_source() {
    let addr = serve_once(happy_script()).await;
    let connector = Connector::new(
        ConnInfo::new(format!("postgres://postgres@{addr}/postgres")),
        Handle::current(),
    );

    let conn = (&connector)
        .get(Deadline::After(Duration::from_secs(5)))
        .await
        .unwrap();
    assert!(!conn.is_bad());
}

#[tokio::test]
async fn pool_lends_and_recycles_a_real_connection() {
    let addr = serve_once(happy_script()).await;
    let pool = Pool::new(
        ConnInfo::new(format!("postgres://postgres@{addr}/postgres")),
        PoolConfig::new().capacity(1),
    );
    let provider = pool.provider(Handle::current());

    let lease = (&provider)
        .get(Deadline::After(Duration::from_secs(5)))
        .await
        .unwrap();
    assert!(!lease.is_bad());
    assert_eq!(pool.stats().leased, 1);
    let first_generation = lease.generation();
    drop(lease);

    // The same connection comes back; the single-accept server would
    // reject a second establishment
    let lease = (&provider)
        .get(Deadline::After(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(lease.generation(), first_generation);
    assert!(!lease.is_bad());
}

#[tokio::test]
async fn held_connection_passes_through_provider() {
    let addr = serve_once(happy_script()).await;
    let source = ConnInfo::new(format!("postgres://postgres@{addr}/postgres"));
    let mut conn = source
        .open(Handle::current(), Deadline::After(Duration::from_secs(5)))
        .await
        .unwrap();

    conn.set_error_context("left over from a previous request");
    let conn = conn.get(Deadline::None).await.unwrap();
    assert_eq!(conn.error_context(), "");
    assert!(conn.is_open());
}
