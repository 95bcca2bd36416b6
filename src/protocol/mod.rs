//! The wire-protocol collaborator: startup message codec, SCRAM
//! authentication, and the non-blocking establishment engine.
//!
//! Everything above this module drives connections through the narrow
//! contract of [`RawConnection`]: `start` / `socket` / `connect_poll` /
//! `status` / `error_message`. The readiness waiting itself lives with
//! the owner of the reactor registration, not here.

pub mod handshake;
pub mod message;
pub mod scram;

pub use handshake::{ConnStatus, Conninfo, PollingStatus, RawConnection};
