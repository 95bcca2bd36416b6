//! Connection providers: the unified asynchronous acquisition facade.
//!
//! A provider is anything that can produce a ready-to-use connection
//! under a time constraint: an already-held [`Connection`] (which
//! provides itself), a [`Connector`] wrapping a source and a reactor, or
//! a pool (see [`Pool::provider`](crate::pool::Pool::provider)).

use std::future::Future;

use tokio::runtime::Handle;

use crate::connection::Connection;
use crate::deadline::Deadline;
use crate::error::Result;
use crate::source::ConnectionSource;

/// Asynchronous acquisition of a ready-to-use connection.
///
/// `get` consumes the provider value; providers that hand out more than
/// one connection implement the trait on a shared reference.
pub trait ConnectionProvider {
    /// What acquisition yields: a connection value or a pool lease.
    type Connection;

    fn get(self, deadline: Deadline) -> impl Future<Output = Result<Self::Connection>> + Send;
}

/// An already-held connection is a provider returning itself.
impl ConnectionProvider for Connection {
    type Connection = Connection;

    fn get(mut self, _deadline: Deadline) -> impl Future<Output = Result<Connection>> + Send {
        // A fresh acquisition starts with a clean slate
        self.set_error_context("");
        std::future::ready(Ok(self))
    }
}

/// Source-backed provider: opens a fresh connection per acquisition.
#[derive(Debug, Clone)]
pub struct Connector<S> {
    source: S,
    reactor: Handle,
}

impl<S: ConnectionSource> Connector<S> {
    pub fn new(source: S, reactor: Handle) -> Self {
        Self { source, reactor }
    }

    pub fn source(&self) -> &S {
        &self.source
    }
}

impl<S: ConnectionSource> ConnectionProvider for &Connector<S> {
    type Connection = S::Connection;

    fn get(self, deadline: Deadline) -> impl Future<Output = Result<S::Connection>> + Send {
        self.source.open(self.reactor.clone(), deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::open_connection;
    use crate::error::Error;

    #[derive(Debug)]
    struct FailingSource;

    impl ConnectionSource for FailingSource {
        type Connection = u8;

        fn open(
            &self,
            _reactor: Handle,
            _deadline: Deadline,
        ) -> impl Future<Output = Result<u8>> + Send {
            std::future::ready(Err(Error::ConnectionStartFailed))
        }
    }

    #[tokio::test]
    async fn held_connection_provides_itself_with_clean_context() {
        let (mut conn, _server) = open_connection();
        conn.set_error_context("stale narrative");
        let conn = conn.get(Deadline::None).await.unwrap();
        assert_eq!(conn.error_context(), "");
        assert!(conn.is_open());
    }

    #[tokio::test]
    async fn connector_forwards_source_results() {
        let connector = Connector::new(FailingSource, Handle::current());
        let res = (&connector).get(Deadline::After(std::time::Duration::from_secs(1))).await;
        assert!(matches!(res, Err(Error::ConnectionStartFailed)));
    }
}
