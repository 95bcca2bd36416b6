//! Time constraints for asynchronous operations.
//!
//! Every acquisition and establishment operation takes a [`Deadline`]:
//! either no constraint, a relative duration, or an absolute time point.
//! A relative duration is resolved to an absolute expiry at the moment it
//! is first consumed, so the reactor only ever sees one timer kind.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{Error, Result};

/// A time constraint: no deadline, a relative duration, or an absolute
/// time point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Deadline {
    /// No time constraint.
    #[default]
    None,
    /// Expires the given duration after the constraint is first consumed.
    After(Duration),
    /// Expires at the given time point.
    At(Instant),
}

impl Deadline {
    /// Resolve the constraint to an absolute expiry, consuming it.
    ///
    /// `After` durations are anchored at the current instant; call this
    /// once per operation.
    pub fn resolve(self) -> Option<Instant> {
        match self {
            Deadline::None => None,
            Deadline::After(d) => Some(Instant::now() + d),
            Deadline::At(t) => Some(t),
        }
    }
}

impl From<Duration> for Deadline {
    fn from(d: Duration) -> Self {
        Deadline::After(d)
    }
}

impl From<Instant> for Deadline {
    fn from(t: Instant) -> Self {
        Deadline::At(t)
    }
}

/// Run `fut` bounded by an optional expiry, mapping expiry to
/// [`Error::TimedOut`].
pub(crate) async fn bounded<T>(
    expiry: Option<Instant>,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match expiry {
        None => fut.await,
        Some(at) => match tokio::time::timeout_at(at, fut).await {
            Ok(res) => res,
            Err(_) => Err(Error::TimedOut),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_resolves_to_no_expiry() {
        assert_eq!(Deadline::None.resolve(), None);
    }

    #[test]
    fn time_point_is_used_directly() {
        let at = Instant::now() + Duration::from_secs(5);
        assert_eq!(Deadline::At(at).resolve(), Some(at));
    }

    #[test]
    fn duration_is_anchored_at_first_use() {
        let before = Instant::now();
        let expiry = Deadline::After(Duration::from_secs(5)).resolve().unwrap();
        assert!(expiry >= before + Duration::from_secs(5));
        assert!(expiry <= Instant::now() + Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_maps_expiry_to_timed_out() {
        let expiry = Some(Instant::now() + Duration::from_millis(10));
        let res: Result<()> = bounded(expiry, std::future::pending()).await;
        assert!(matches!(res, Err(Error::TimedOut)));
    }

    #[tokio::test]
    async fn bounded_passes_through_without_expiry() {
        let res = bounded(None, async { Ok(7) }).await.unwrap();
        assert_eq!(res, 7);
    }
}
