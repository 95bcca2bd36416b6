//! The asynchronous connection object.
//!
//! A [`Connection`] binds a [`NativeHandle`] to a reactor
//! ([`tokio::runtime::Handle`]) and exposes the readiness-wait primitives
//! that the establishment and request drivers are built from. The socket
//! registration is a non-owning view over the handle's file descriptor:
//! releasing or reassigning the handle first detaches the view, never
//! closing a descriptor it does not own.
//!
//! ### Thread safety
//!
//! Distinct connections are independent. A single connection is meant to
//! be driven by one task; at most one read-wait and one write-wait may be
//! in flight at any instant, which is enforced at runtime.

use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::runtime::Handle;
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::handle::NativeHandle;
use crate::protocol::{ConnStatus, RawConnection};
use crate::types::OidMap;

/// Non-owning registration view over a raw file descriptor.
///
/// Dropping the view deregisters the descriptor from the reactor but
/// never closes it; the [`NativeHandle`] owns the descriptor.
#[derive(Debug)]
struct SocketView(RawFd);

impl AsRawFd for SocketView {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// Cancellation state shared by both wait directions.
///
/// Each cancellation bumps the generation; a wait that started under an
/// older generation completes with [`Error::Cancelled`], while waits
/// started afterwards proceed normally.
#[derive(Debug, Default)]
struct CancelToken {
    generation: AtomicU64,
    notify: Notify,
}

impl CancelToken {
    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::Release);
        self.notify.notify_waiters();
    }

    async fn cancelled(&self, since: u64) {
        let mut notified = std::pin::pin!(self.notify.notified());
        loop {
            notified.as_mut().enable();
            if self.generation.load(Ordering::Acquire) != since {
                return;
            }
            notified.as_mut().await;
            notified.set(self.notify.notified());
        }
    }
}

/// One-per-direction wait registration guard.
struct WaitSlot<'a>(&'a AtomicBool);

impl<'a> WaitSlot<'a> {
    fn claim(flag: &'a AtomicBool) -> Result<Self> {
        if flag.swap(true, Ordering::AcqRel) {
            return Err(Error::BusyConnection);
        }
        Ok(Self(flag))
    }
}

impl Drop for WaitSlot<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Wait counters, opaque to establishment and pooling.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    read_waits: AtomicU64,
    write_waits: AtomicU64,
    cancellations: AtomicU64,
}

impl ConnectionStats {
    pub fn read_waits(&self) -> u64 {
        self.read_waits.load(Ordering::Relaxed)
    }

    pub fn write_waits(&self) -> u64 {
        self.write_waits.load(Ordering::Relaxed)
    }

    pub fn cancellations(&self) -> u64 {
        self.cancellations.load(Ordering::Relaxed)
    }
}

/// An asynchronous PostgreSQL connection.
#[derive(Debug)]
pub struct Connection {
    // The socket view must detach before the handle closes its fd, so it
    // is declared (and therefore dropped) first.
    socket: Option<AsyncFd<SocketView>>,
    handle: NativeHandle,
    reactor: Handle,
    oid_map: OidMap,
    error_context: String,
    stats: ConnectionStats,
    cancel: CancelToken,
    read_waiting: AtomicBool,
    write_waiting: AtomicBool,
}

impl Connection {
    /// Construct an empty connection bound to a reactor.
    pub fn new(reactor: Handle) -> Self {
        Self {
            socket: None,
            handle: NativeHandle::null(),
            reactor,
            oid_map: OidMap::empty(),
            error_context: String::new(),
            stats: ConnectionStats::default(),
            cancel: CancelToken::default(),
            read_waiting: AtomicBool::new(false),
            write_waiting: AtomicBool::new(false),
        }
    }

    /// Borrow the raw protocol connection, if any.
    pub fn native_handle(&self) -> Option<&RawConnection> {
        self.handle.get()
    }

    pub(crate) fn handle_mut(&mut self) -> Option<&mut RawConnection> {
        self.handle.get_mut()
    }

    pub fn oid_map(&self) -> &OidMap {
        &self.oid_map
    }

    pub fn oid_map_mut(&mut self) -> &mut OidMap {
        &mut self.oid_map
    }

    /// Additional narrative for the last error on this connection.
    pub fn error_context(&self) -> &str {
        &self.error_context
    }

    /// Set the error context; an empty string clears it.
    pub fn set_error_context(&mut self, context: impl Into<String>) {
        self.error_context = context.into();
    }

    /// The protocol engine's own narrative for its last failure.
    pub fn error_message(&self) -> &str {
        self.handle
            .get()
            .map(RawConnection::error_message)
            .unwrap_or("")
    }

    /// The reactor this connection is bound to.
    pub fn executor(&self) -> &Handle {
        &self.reactor
    }

    /// Wait counters for this connection.
    pub fn statistics(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Whether a handle is attached.
    pub fn is_open(&self) -> bool {
        !self.handle.is_null()
    }

    /// Whether the connection cannot perform operations.
    ///
    /// A connection with no handle is bad; an attached connection is bad
    /// when the protocol engine reports so.
    pub fn is_bad(&self) -> bool {
        match self.handle.get() {
            None => true,
            Some(raw) => raw.status() == ConnStatus::Bad,
        }
    }

    fn waits_outstanding(&self) -> bool {
        self.read_waiting.load(Ordering::Acquire) || self.write_waiting.load(Ordering::Acquire)
    }

    /// Begin establishment: parse `conninfo` and attach a handle with a
    /// non-blocking connect in flight.
    pub fn start_connection(&mut self, conninfo: &str) -> Result<()> {
        if self.waits_outstanding() {
            return Err(Error::BusyConnection);
        }
        self.socket = None;
        match RawConnection::start(conninfo) {
            Ok(raw) => {
                self.handle = NativeHandle::new(raw);
                Ok(())
            }
            Err(e) => {
                self.handle = NativeHandle::null();
                self.error_context = format!("failed to start connection establishment: {e}");
                Err(Error::ConnectionStartFailed)
            }
        }
    }

    /// Register the handle's descriptor with the reactor.
    pub fn assign_socket(&mut self) -> Result<()> {
        let fd = self.handle.socket().ok_or(Error::ConnectionStatusBad)?;
        let _enter = self.reactor.enter();
        match AsyncFd::with_interest(SocketView(fd), Interest::READABLE.add(Interest::WRITABLE)) {
            Ok(registered) => {
                self.socket = Some(registered);
                Ok(())
            }
            Err(e) => {
                self.error_context = format!("could not register socket with the reactor: {e}");
                Err(Error::AssignSocketFailed)
            }
        }
    }

    /// Replace the current handle.
    ///
    /// Fails with [`Error::BusyConnection`] while waits are outstanding
    /// and with [`Error::AssignSocketFailed`] when the new descriptor
    /// cannot be registered. The previous handle is closed either way.
    pub fn assign(&mut self, handle: NativeHandle) -> Result<()> {
        if self.waits_outstanding() {
            return Err(Error::BusyConnection);
        }
        // Detach the view before the old handle closes its descriptor
        self.socket = None;
        self.handle = handle;
        if self.handle.is_null() {
            return Ok(());
        }
        self.assign_socket()
    }

    /// Rebind the connection to a different reactor.
    ///
    /// Used by the pool when a connection migrates between reactors.
    /// Fails with [`Error::BusyConnection`] while waits are outstanding.
    pub fn rebind_executor(&mut self, reactor: &Handle) -> Result<()> {
        if self.waits_outstanding() {
            return Err(Error::BusyConnection);
        }
        self.socket = None;
        self.reactor = reactor.clone();
        if self.handle.is_null() {
            return Ok(());
        }
        self.assign_socket()
    }

    /// Detach and return the handle without closing it.
    ///
    /// Outstanding waits complete with [`Error::Cancelled`]. Afterwards
    /// `is_open()` is false.
    pub fn release(&mut self) -> NativeHandle {
        self.cancel();
        self.socket = None;
        std::mem::take(&mut self.handle)
    }

    /// Cancel outstanding waits and drop the handle. Idempotent.
    pub fn close(&mut self) {
        self.cancel();
        self.socket = None;
        self.handle = NativeHandle::null();
    }

    /// Cancel all outstanding waits, keeping the handle.
    pub fn cancel(&self) {
        self.stats.cancellations.fetch_add(1, Ordering::Relaxed);
        self.cancel.bump();
    }

    /// Wait until the socket is ready to write or has a pending error.
    pub async fn wait_write(&self) -> Result<()> {
        let _slot = WaitSlot::claim(&self.write_waiting)?;
        self.stats.write_waits.fetch_add(1, Ordering::Relaxed);
        let fd = self.socket.as_ref().ok_or(Error::ConnectionStatusBad)?;
        let since = self.cancel.generation();
        tokio::select! {
            _ = self.cancel.cancelled(since) => Err(Error::Cancelled),
            ready = fd.writable() => {
                let mut guard = ready?;
                guard.clear_ready();
                Ok(())
            }
        }
    }

    /// Wait until the socket is ready to read or has a pending error.
    pub async fn wait_read(&self) -> Result<()> {
        let _slot = WaitSlot::claim(&self.read_waiting)?;
        self.stats.read_waits.fetch_add(1, Ordering::Relaxed);
        let fd = self.socket.as_ref().ok_or(Error::ConnectionStatusBad)?;
        let since = self.cancel.generation();
        tokio::select! {
            _ = self.cancel.cancelled(since) => Err(Error::Cancelled),
            ready = fd.readable() => {
                let mut guard = ready?;
                guard.clear_ready();
                Ok(())
            }
        }
    }
}

/// Scope guard that closes a connection on every exit path unless
/// disarmed.
pub struct DeferClose<'a> {
    conn: Option<&'a mut Connection>,
}

impl<'a> DeferClose<'a> {
    pub fn new(conn: &'a mut Connection) -> Self {
        Self { conn: Some(conn) }
    }

    /// Keep the connection open and hand the borrow back.
    pub fn disarm(mut self) -> &'a mut Connection {
        self.conn.take().expect("guard is armed until disarm or drop")
    }
}

impl std::ops::Deref for DeferClose<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("guard is armed until disarm or drop")
    }
}

impl std::ops::DerefMut for DeferClose<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("guard is armed until disarm or drop")
    }
}

impl Drop for DeferClose<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.close();
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::protocol::RawConnection;

    /// A connected loopback pair: a client-side std stream and the
    /// server-side peer.
    pub(crate) fn stream_pair() -> (std::net::TcpStream, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind loopback");
        let addr = listener.local_addr().expect("local addr");
        let client = std::net::TcpStream::connect(addr).expect("connect loopback");
        let (server, _) = listener.accept().expect("accept loopback");
        (client, server)
    }

    /// An established connection on the current reactor plus the server
    /// side of its socket.
    pub(crate) fn open_connection() -> (Connection, std::net::TcpStream) {
        let (client, server) = stream_pair();
        let mut conn = Connection::new(Handle::current());
        conn.assign(NativeHandle::new(RawConnection::test_open(client)))
            .expect("assign test handle");
        (conn, server)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Duration;

    use super::testing::open_connection;
    use super::*;

    #[tokio::test]
    async fn empty_connection_is_closed_and_bad() {
        let conn = Connection::new(Handle::current());
        assert!(!conn.is_open());
        assert!(conn.is_bad());
        assert_eq!(conn.error_message(), "");
    }

    #[tokio::test]
    async fn assigned_connection_is_open_and_good() {
        let (conn, _server) = open_connection();
        assert!(conn.is_open());
        assert!(!conn.is_bad());
        assert!(conn.native_handle().is_some());
    }

    #[tokio::test]
    async fn wait_write_resolves_on_connected_socket() {
        let (conn, _server) = open_connection();
        conn.wait_write().await.unwrap();
        assert_eq!(conn.statistics().write_waits(), 1);
    }

    #[tokio::test]
    async fn wait_read_resolves_when_data_arrives() {
        let (conn, mut server) = open_connection();
        server.write_all(b"x").unwrap();
        conn.wait_read().await.unwrap();
        assert_eq!(conn.statistics().read_waits(), 1);
    }

    #[tokio::test]
    async fn cancel_completes_outstanding_wait_and_keeps_connection_usable() {
        let (conn, _server) = open_connection();
        let (wait, _) = tokio::join!(conn.wait_read(), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            conn.cancel();
        });
        assert!(matches!(wait, Err(Error::Cancelled)));
        assert!(!conn.is_bad());
        // A wait started after the cancellation proceeds normally
        conn.wait_write().await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_wait_registration_is_rejected() {
        let (conn, _server) = open_connection();
        let (first, second) = tokio::join!(conn.wait_read(), async {
            tokio::task::yield_now().await;
            let res = conn.wait_read().await;
            conn.cancel();
            res
        });
        assert!(matches!(first, Err(Error::Cancelled)));
        assert!(matches!(second, Err(Error::BusyConnection)));
    }

    #[tokio::test]
    async fn release_detaches_without_closing() {
        let (mut conn, _server) = open_connection();
        let handle = conn.release();
        assert!(!conn.is_open());
        assert!(conn.is_bad());

        // The descriptor is still alive under the released handle
        let fd = handle.socket().unwrap();
        assert_ne!(unsafe { libc::fcntl(fd, libc::F_GETFD) }, -1);

        drop(handle);
        assert_eq!(unsafe { libc::fcntl(fd, libc::F_GETFD) }, -1);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (mut conn, _server) = open_connection();
        conn.close();
        assert!(!conn.is_open());
        conn.close();
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn rebind_executor_keeps_waits_working() {
        let (mut conn, mut server) = open_connection();
        let reactor = Handle::current();
        conn.rebind_executor(&reactor).unwrap();
        server.write_all(b"x").unwrap();
        conn.wait_read().await.unwrap();
    }

    #[tokio::test]
    async fn error_context_set_and_clear() {
        let (mut conn, _server) = open_connection();
        conn.set_error_context("while fetching a connection");
        assert_eq!(conn.error_context(), "while fetching a connection");
        conn.set_error_context("");
        assert_eq!(conn.error_context(), "");
    }

    #[tokio::test]
    async fn defer_close_closes_unless_disarmed() {
        let (mut conn, _server) = open_connection();
        {
            let _guard = DeferClose::new(&mut conn);
        }
        assert!(!conn.is_open());

        let (mut conn, _server) = open_connection();
        {
            let guard = DeferClose::new(&mut conn);
            guard.disarm();
        }
        assert!(conn.is_open());
    }
}
