//! Asynchronous PostgreSQL client core.
//!
//! This crate provides non-blocking access to a PostgreSQL server over
//! the v3 frontend/backend protocol:
//! - readiness-driven connection establishment (the startup handshake is
//!   advanced one socket-readiness step at a time),
//! - a bounded connection pool with LIFO idle reuse and a FIFO wait
//!   queue,
//! - a provider abstraction unifying "a held connection", "a source that
//!   opens one" and "a pool that lends one" behind a single acquisition
//!   contract with uniform deadline semantics.
//!
//! Architecture:
//! - `protocol`: startup-phase wire codec, SCRAM, and the non-blocking
//!   establishment engine
//! - `connection`: the connection object and its readiness-wait
//!   primitives
//! - `connect`: the generic poll driver and the establishment operation
//! - `source` / `provider` / `pool`: acquisition
//! - `types`: binary value framing and the OID map
//!
//! The reactor is injected everywhere a connection is created or lent;
//! the crate holds no global state.

mod connect;
mod connection;
mod deadline;
mod error;
mod handle;
pub mod pool;
pub mod protocol;
mod provider;
mod source;
pub mod types;

#[cfg(test)]
mod tests;

pub use connect::{connect, poll_drive};
pub use connection::{Connection, ConnectionStats, DeferClose};
pub use deadline::Deadline;
pub use error::{Error, Result};
pub use handle::NativeHandle;
pub use pool::{Lease, Pool, PoolConfig, PoolProvider, PoolStats, PoolableConnection};
pub use protocol::{ConnStatus, PollingStatus};
pub use provider::{ConnectionProvider, Connector};
pub use source::{ConnInfo, ConnectionSource};
pub use types::{Oid, OidMap, Value};
