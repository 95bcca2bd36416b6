//! Connection sources: factories that yield established connections.

use std::future::Future;

use tokio::runtime::Handle;
use tracing::debug;

use crate::connect::connect;
use crate::connection::{Connection, DeferClose};
use crate::deadline::Deadline;
use crate::error::Result;

/// A factory whose invocation yields a newly established connection.
///
/// Implementations must honour the deadline: when it is reached, the
/// open completes with [`Error::TimedOut`](crate::Error::TimedOut) and
/// in-flight I/O is cancelled.
pub trait ConnectionSource: Send + Sync + 'static {
    /// The connection type this source produces.
    type Connection: Send + 'static;

    /// Open a connection by means of the given reactor.
    fn open(
        &self,
        reactor: Handle,
        deadline: Deadline,
    ) -> impl Future<Output = Result<Self::Connection>> + Send;
}

/// The default source: a connection string opened with the startup
/// handshake driver.
#[derive(Debug, Clone)]
pub struct ConnInfo {
    conninfo: String,
}

impl ConnInfo {
    pub fn new(conninfo: impl Into<String>) -> Self {
        Self {
            conninfo: conninfo.into(),
        }
    }

    /// The connection string this source opens.
    pub fn conninfo(&self) -> &str {
        &self.conninfo
    }
}

impl ConnectionSource for ConnInfo {
    type Connection = Connection;

    fn open(
        &self,
        reactor: Handle,
        deadline: Deadline,
    ) -> impl Future<Output = Result<Connection>> + Send {
        let conninfo = self.conninfo.clone();
        async move {
            let mut conn = Connection::new(reactor);
            let result = {
                let mut guard = DeferClose::new(&mut conn);
                match connect(&mut guard, &conninfo, deadline).await {
                    Ok(()) => {
                        guard.disarm();
                        Ok(())
                    }
                    Err(e) => {
                        // The guard closes the failed connection; keep its
                        // narrative for the log line below.
                        let context = guard.error_context().to_string();
                        debug!(error = %e, context = %context, "source open failed");
                        Err(e)
                    }
                }
            };
            result.map(|()| conn)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[tokio::test]
    async fn conninfo_source_surfaces_start_failures() {
        let source = ConnInfo::new("%%%");
        let res = source.open(Handle::current(), Deadline::None).await;
        assert!(matches!(res, Err(Error::ConnectionStartFailed)));
    }

    #[test]
    fn conninfo_is_stored_verbatim() {
        let source = ConnInfo::new("host=localhost user=app");
        assert_eq!(source.conninfo(), "host=localhost user=app");
    }
}
