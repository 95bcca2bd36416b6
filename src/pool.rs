//! Bounded connection pool with a FIFO wait queue.
//!
//! The pool keeps a LIFO stack of idle connections (warm TCP state is
//! reused first), opens new connections through its inner source while
//! below capacity, and parks excess acquisitions in a bounded FIFO
//! queue. All bookkeeping lives behind a single mutex held only for
//! O(1) sections; nothing user-visible runs under it. Hand-offs travel
//! over per-waiter oneshot channels, so a freed connection is always
//! offered to the head of the queue before any later caller can see it.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::connection::Connection;
use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::source::ConnectionSource;

// ============================================================================
// Configuration
// ============================================================================

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections, idle and lent combined.
    pub capacity: usize,
    /// Maximum number of queued acquisitions when all connections are lent.
    pub queue_capacity: usize,
    /// Idle connections older than this are closed instead of reused.
    pub idle_timeout: Duration,
    /// Time budget for opening a connection through the source.
    pub connect_timeout: Duration,
    /// Time budget for waiting in the queue.
    pub queue_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            queue_capacity: 128,
            idle_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            queue_timeout: Duration::from_secs(10),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn queue_timeout(mut self, queue_timeout: Duration) -> Self {
        self.queue_timeout = queue_timeout;
        self
    }
}

/// A point-in-time snapshot of the pool's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub leased: usize,
    pub opening: usize,
    pub waiting: usize,
}

impl PoolStats {
    /// Total connections the pool accounts for.
    pub fn size(&self) -> usize {
        self.idle + self.leased + self.opening
    }
}

// ============================================================================
// Poolable connections
// ============================================================================

/// What the pool needs from the connections it manages: a health test
/// used before reuse and on release, and reactor migration before a
/// connection is handed to a caller on a different reactor.
pub trait PoolableConnection: Send + 'static {
    fn is_bad(&self) -> bool;

    fn rebind(&mut self, reactor: &Handle) -> Result<()>;
}

impl PoolableConnection for Connection {
    fn is_bad(&self) -> bool {
        Connection::is_bad(self)
    }

    fn rebind(&mut self, reactor: &Handle) -> Result<()> {
        self.rebind_executor(reactor)
    }
}

// ============================================================================
// Internal state
// ============================================================================

#[derive(Debug)]
struct Slot<C> {
    conn: C,
    idle_since: Instant,
    generation: u64,
}

struct Waiter<C> {
    tx: oneshot::Sender<Result<Slot<C>>>,
    id: u64,
    reactor: Handle,
}

struct PoolState<C> {
    idle: Vec<Slot<C>>,
    waiters: VecDeque<Waiter<C>>,
    leased: usize,
    opening: usize,
    next_generation: u64,
    next_waiter_id: u64,
}

impl<C> PoolState<C> {
    fn new() -> Self {
        Self {
            idle: Vec::new(),
            waiters: VecDeque::new(),
            leased: 0,
            opening: 0,
            next_generation: 0,
            next_waiter_id: 0,
        }
    }

    fn size(&self) -> usize {
        self.idle.len() + self.leased + self.opening
    }
}

enum Claim<C> {
    Ready(Slot<C>),
    Open,
    Wait(oneshot::Receiver<Result<Slot<C>>>, u64),
    Overflow,
}

struct PoolInner<S>
where
    S: ConnectionSource,
    S::Connection: PoolableConnection,
{
    source: S,
    config: PoolConfig,
    state: Mutex<PoolState<S::Connection>>,
}

impl<S> PoolInner<S>
where
    S: ConnectionSource,
    S::Connection: PoolableConnection,
{
    fn evict_expired(config: &PoolConfig, state: &mut PoolState<S::Connection>) {
        let before = state.idle.len();
        state
            .idle
            .retain(|slot| slot.idle_since.elapsed() < config.idle_timeout);
        let evicted = before - state.idle.len();
        if evicted > 0 {
            trace!(evicted, "closed expired idle connections");
        }
    }

    fn claim(&self, reactor: &Handle) -> Claim<S::Connection> {
        let mut state = self.state.lock();
        Self::evict_expired(&self.config, &mut state);

        while let Some(slot) = state.idle.pop() {
            if slot.conn.is_bad() {
                debug!(generation = slot.generation, "dropping bad idle connection");
                continue;
            }
            state.leased += 1;
            return Claim::Ready(slot);
        }

        if state.size() < self.config.capacity {
            state.opening += 1;
            return Claim::Open;
        }

        if state.waiters.len() < self.config.queue_capacity {
            let (tx, rx) = oneshot::channel();
            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            state.waiters.push_back(Waiter {
                tx,
                id,
                reactor: reactor.clone(),
            });
            return Claim::Wait(rx, id);
        }

        Claim::Overflow
    }

    /// Offer a slot to the head of the queue, or shelve it as idle.
    fn route(state: &mut PoolState<S::Connection>, mut slot: Slot<S::Connection>) {
        while let Some(waiter) = state.waiters.pop_front() {
            state.leased += 1;
            match waiter.tx.send(Ok(slot)) {
                Ok(()) => return,
                Err(rejected) => {
                    // That waiter gave up; the next one inherits the slot
                    state.leased -= 1;
                    match rejected {
                        Ok(back) => slot = back,
                        Err(_) => return,
                    }
                }
            }
        }
        slot.idle_since = Instant::now();
        state.idle.push(slot);
    }

    /// Re-enter the acquisition path on behalf of queued waiters after
    /// capacity freed up or idle connections appeared.
    fn pump(inner: &Arc<Self>, state: &mut PoolState<S::Connection>) {
        loop {
            if state.waiters.is_empty() {
                return;
            }
            match state.idle.pop() {
                Some(slot) => {
                    if slot.conn.is_bad() {
                        continue;
                    }
                    Self::route(state, slot);
                }
                None => {
                    if state.size() < inner.config.capacity {
                        if let Some(head) = state.waiters.front() {
                            let reactor = head.reactor.clone();
                            state.opening += 1;
                            Self::spawn_open(inner, reactor, None);
                        }
                    }
                    return;
                }
            }
        }
    }

    /// Open a connection on a detached task, so that an abandoned
    /// requester does not abort an establishment the pool can still use.
    fn spawn_open(
        inner: &Arc<Self>,
        reactor: Handle,
        requester: Option<oneshot::Sender<Result<Slot<S::Connection>>>>,
    ) {
        let pool = Arc::clone(inner);
        let connect_timeout = inner.config.connect_timeout;
        let spawner = reactor.clone();
        spawner.spawn(async move {
            let res = pool
                .source
                .open(reactor, Deadline::After(connect_timeout))
                .await;
            pool.finish_open(res, requester);
        });
    }

    fn finish_open(
        self: &Arc<Self>,
        res: Result<S::Connection>,
        requester: Option<oneshot::Sender<Result<Slot<S::Connection>>>>,
    ) {
        let mut state = self.state.lock();
        state.opening -= 1;

        match res {
            Ok(conn) => {
                let generation = state.next_generation;
                state.next_generation += 1;
                let slot = Slot {
                    conn,
                    idle_since: Instant::now(),
                    generation,
                };
                let unclaimed = match requester {
                    Some(tx) => {
                        state.leased += 1;
                        match tx.send(Ok(slot)) {
                            Ok(()) => None,
                            Err(rejected) => {
                                state.leased -= 1;
                                match rejected {
                                    Ok(back) => Some(back),
                                    Err(_) => None,
                                }
                            }
                        }
                    }
                    None => Some(slot),
                };
                if let Some(slot) = unclaimed {
                    trace!(
                        generation = slot.generation,
                        "requester left; offering fresh connection onwards"
                    );
                    Self::route(&mut state, slot);
                }
            }
            Err(e) => {
                debug!(error = %e, "pool open failed");
                let e = match requester {
                    Some(tx) => match tx.send(Err(e)) {
                        Ok(()) => {
                            Self::pump(self, &mut state);
                            return;
                        }
                        Err(rejected) => match rejected {
                            Err(e) => e,
                            Ok(_) => return,
                        },
                    },
                    None => e,
                };
                // The requester is gone; the head waiter inherits the failure
                if let Some(waiter) = state.waiters.pop_front() {
                    let _ = waiter.tx.send(Err(e));
                }
                Self::pump(self, &mut state);
            }
        }
    }

    /// Return a lent slot to the pool.
    fn release(self: &Arc<Self>, slot: Slot<S::Connection>) {
        let mut state = self.state.lock();
        state.leased -= 1;
        Self::evict_expired(&self.config, &mut state);

        if slot.conn.is_bad() {
            debug!(
                generation = slot.generation,
                "discarding bad connection on release"
            );
            drop(slot);
            Self::pump(self, &mut state);
        } else {
            let mut slot = slot;
            slot.idle_since = Instant::now();
            Self::route(&mut state, slot);
        }
    }

    /// A lent connection left the pool's custody for good.
    fn release_detached(self: &Arc<Self>) {
        let mut state = self.state.lock();
        state.leased -= 1;
        Self::pump(self, &mut state);
    }

    fn discard_unbindable(self: &Arc<Self>, slot: Slot<S::Connection>) {
        let mut state = self.state.lock();
        state.leased -= 1;
        drop(slot);
        Self::pump(self, &mut state);
    }

    fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            idle: state.idle.len(),
            leased: state.leased,
            opening: state.opening,
            waiting: state.waiters.len(),
        }
    }
}

// ============================================================================
// Pool
// ============================================================================

/// A bounded pool of connections produced by a [`ConnectionSource`].
pub struct Pool<S>
where
    S: ConnectionSource,
    S::Connection: PoolableConnection,
{
    inner: Arc<PoolInner<S>>,
}

impl<S> Clone for Pool<S>
where
    S: ConnectionSource,
    S::Connection: PoolableConnection,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> Pool<S>
where
    S: ConnectionSource,
    S::Connection: PoolableConnection,
{
    pub fn new(source: S, config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                source,
                config,
                state: Mutex::new(PoolState::new()),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Counter snapshot, taken under the pool mutex.
    pub fn stats(&self) -> PoolStats {
        self.inner.stats()
    }

    /// A provider facade lending connections onto `reactor`.
    pub fn provider(&self, reactor: Handle) -> PoolProvider<'_, S> {
        PoolProvider {
            pool: self,
            reactor,
        }
    }

    /// Acquire a connection under `deadline`, lending it until the
    /// returned [`Lease`] is dropped.
    pub async fn get(&self, reactor: &Handle, deadline: Deadline) -> Result<Lease<S>> {
        let expiry = deadline.resolve();
        loop {
            match self.inner.claim(reactor) {
                Claim::Ready(slot) => {
                    if let Some(lease) = self.prepare(slot, reactor) {
                        return Ok(lease);
                    }
                }
                Claim::Open => {
                    let slot = self.open_direct(reactor, expiry).await?;
                    if let Some(lease) = self.prepare(slot, reactor) {
                        return Ok(lease);
                    }
                }
                Claim::Wait(rx, id) => {
                    let slot = self.wait_in_queue(rx, id, expiry).await?;
                    if let Some(lease) = self.prepare(slot, reactor) {
                        return Ok(lease);
                    }
                }
                Claim::Overflow => return Err(Error::QueueOverflow),
            }
        }
    }

    /// Close all idle connections. Lent connections are discarded as
    /// their leases drop.
    pub fn close(&self) {
        let drained = {
            let mut state = self.inner.state.lock();
            std::mem::take(&mut state.idle)
        };
        drop(drained);
    }

    /// Rebind a claimed slot onto the requester's reactor and wrap it
    /// into a lease; an unbindable connection is discarded.
    fn prepare(&self, mut slot: Slot<S::Connection>, reactor: &Handle) -> Option<Lease<S>> {
        match slot.conn.rebind(reactor) {
            Ok(()) => Some(Lease {
                slot: Some(slot),
                pool: Arc::downgrade(&self.inner),
            }),
            Err(e) => {
                debug!(error = %e, "discarding connection that could not be rebound");
                self.inner.discard_unbindable(slot);
                None
            }
        }
    }

    async fn open_direct(
        &self,
        reactor: &Handle,
        expiry: Option<Instant>,
    ) -> Result<Slot<S::Connection>> {
        let (tx, rx) = oneshot::channel();
        PoolInner::spawn_open(&self.inner, reactor.clone(), Some(tx));

        let outcome = match expiry {
            None => rx.await,
            Some(at) => match tokio::time::timeout_at(at, rx).await {
                Ok(received) => received,
                // The open keeps running; its result is offered onwards
                Err(_) => return Err(Error::TimedOut),
            },
        };
        match outcome {
            Ok(res) => res,
            Err(_) => Err(Error::Cancelled),
        }
    }

    async fn wait_in_queue(
        &self,
        mut rx: oneshot::Receiver<Result<Slot<S::Connection>>>,
        id: u64,
        expiry: Option<Instant>,
    ) -> Result<Slot<S::Connection>> {
        enum Outcome<T> {
            Served(T),
            QueueExpired,
            DeadlineExpired,
        }

        let queue_deadline = Instant::now() + self.inner.config.queue_timeout;
        let outcome = tokio::select! {
            received = &mut rx => Outcome::Served(match received {
                Ok(res) => res,
                Err(_) => Err(Error::Cancelled),
            }),
            _ = tokio::time::sleep_until(queue_deadline) => Outcome::QueueExpired,
            _ = sleep_until_opt(expiry) => Outcome::DeadlineExpired,
        };
        match outcome {
            Outcome::Served(res) => res,
            Outcome::QueueExpired => self.abandon_queue(rx, id, Error::QueueTimeout).await,
            Outcome::DeadlineExpired => self.abandon_queue(rx, id, Error::TimedOut).await,
        }
    }

    /// Leave the wait queue, unless a hand-off won the race.
    async fn abandon_queue(
        &self,
        rx: oneshot::Receiver<Result<Slot<S::Connection>>>,
        id: u64,
        err: Error,
    ) -> Result<Slot<S::Connection>> {
        let removed = {
            let mut state = self.inner.state.lock();
            let before = state.waiters.len();
            state.waiters.retain(|w| w.id != id);
            state.waiters.len() != before
        };
        if removed {
            trace!(waiter = id, error = %err, "left the wait queue");
            return Err(err);
        }
        // Already served: the hand-off is in flight on the channel
        match rx.await {
            Ok(res) => res,
            Err(_) => Err(err),
        }
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

// ============================================================================
// Lease
// ============================================================================

/// Exclusive permission to use a pooled connection.
///
/// Dropping the lease returns a healthy connection to the pool and
/// discards a bad one, releasing its capacity either way.
pub struct Lease<S>
where
    S: ConnectionSource,
    S::Connection: PoolableConnection,
{
    slot: Option<Slot<S::Connection>>,
    pool: Weak<PoolInner<S>>,
}

impl<S> Lease<S>
where
    S: ConnectionSource,
    S::Connection: PoolableConnection,
{
    /// The establishment generation of the held connection.
    pub fn generation(&self) -> u64 {
        self.slot
            .as_ref()
            .expect("lease holds its slot until drop")
            .generation
    }

    /// Take the connection out of the pool's custody entirely.
    pub fn detach(mut self) -> S::Connection {
        let slot = self
            .slot
            .take()
            .expect("lease holds its slot until drop");
        if let Some(pool) = self.pool.upgrade() {
            pool.release_detached();
        }
        slot.conn
    }
}

impl<S> std::ops::Deref for Lease<S>
where
    S: ConnectionSource,
    S::Connection: PoolableConnection,
{
    type Target = S::Connection;

    fn deref(&self) -> &S::Connection {
        &self
            .slot
            .as_ref()
            .expect("lease holds its slot until drop")
            .conn
    }
}

impl<S> std::ops::DerefMut for Lease<S>
where
    S: ConnectionSource,
    S::Connection: PoolableConnection,
{
    fn deref_mut(&mut self) -> &mut S::Connection {
        &mut self
            .slot
            .as_mut()
            .expect("lease holds its slot until drop")
            .conn
    }
}

impl<S> Drop for Lease<S>
where
    S: ConnectionSource,
    S::Connection: PoolableConnection,
{
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            if let Some(pool) = self.pool.upgrade() {
                pool.release(slot);
            }
        }
    }
}

impl<S> std::fmt::Debug for Lease<S>
where
    S: ConnectionSource,
    S::Connection: PoolableConnection,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("generation", &self.slot.as_ref().map(|s| s.generation))
            .finish()
    }
}

// ============================================================================
// Pool provider
// ============================================================================

/// Provider facade over a pool, bound to the acquiring reactor.
pub struct PoolProvider<'a, S>
where
    S: ConnectionSource,
    S::Connection: PoolableConnection,
{
    pool: &'a Pool<S>,
    reactor: Handle,
}

impl<'a, S> crate::provider::ConnectionProvider for &PoolProvider<'a, S>
where
    S: ConnectionSource,
    S::Connection: PoolableConnection,
{
    type Connection = Lease<S>;

    fn get(
        self,
        deadline: Deadline,
    ) -> impl std::future::Future<Output = Result<Lease<S>>> + Send {
        self.pool.get(&self.reactor, deadline)
    }
}
