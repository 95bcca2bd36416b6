//! Readiness-driven operation drivers.
//!
//! [`poll_drive`] alternates between a protocol step and the matching
//! socket readiness wait until the step settles; [`connect`] specialises
//! it around the startup handshake.

use tracing::debug;

use crate::connection::Connection;
use crate::deadline::{bounded, Deadline};
use crate::error::{Error, Result};
use crate::protocol::{PollingStatus, RawConnection};

/// Drive a polling protocol step to completion.
///
/// Calls `step` and then waits for whichever readiness the step asks
/// for, looping until the step reports `Ok` or `Failed`. `Active` is
/// treated as a failure: the driver never busy-spins. A connection that
/// is already bad at entry fails with [`Error::ConnectionStatusBad`]; a
/// cancelled wait surfaces [`Error::Cancelled`] and leaves the
/// connection usable if it is still healthy.
pub async fn poll_drive<S>(conn: &mut Connection, mut step: S) -> Result<()>
where
    S: FnMut(&mut RawConnection) -> PollingStatus,
{
    if conn.is_bad() {
        return Err(Error::ConnectionStatusBad);
    }
    loop {
        let status = match conn.handle_mut() {
            Some(raw) => step(raw),
            None => return Err(Error::ConnectionStatusBad),
        };
        match status {
            PollingStatus::Writing => conn.wait_write().await?,
            PollingStatus::Reading => conn.wait_read().await?,
            PollingStatus::Ok => return Ok(()),
            PollingStatus::Failed | PollingStatus::Active => {
                return Err(Error::ConnectPollFailed)
            }
        }
    }
}

/// Establish a connection to the server named by `conninfo`.
///
/// Attaches a fresh handle to `conn`, registers its socket with the
/// connection's reactor, and drives the handshake under `deadline`. On
/// failure the connection keeps its handle (where one was attached) and
/// its error context for diagnostics; deadline expiry cancels the
/// in-flight wait and surfaces [`Error::TimedOut`].
pub async fn connect(conn: &mut Connection, conninfo: &str, deadline: Deadline) -> Result<()> {
    let expiry = deadline.resolve();

    conn.start_connection(conninfo)?;
    if conn.is_bad() {
        return Err(Error::ConnectionStatusBad);
    }
    conn.assign_socket()?;

    match bounded(expiry, poll_drive(conn, RawConnection::connect_poll)).await {
        Ok(()) => {
            debug!(server_version = conn
                .native_handle()
                .and_then(|raw| raw.parameter("server_version"))
                .unwrap_or(""), "connection established");
            Ok(())
        }
        Err(Error::TimedOut) => {
            conn.cancel();
            conn.set_error_context("connection establishment timed out");
            Err(Error::TimedOut)
        }
        Err(e) => {
            let narrative = conn.error_message().to_string();
            if !narrative.is_empty() {
                conn.set_error_context(narrative);
            }
            debug!(error = %e, context = conn.error_context(), "connection establishment failed");
            Err(e)
        }
    }
}
