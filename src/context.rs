//! Cancellation and deadlines for individual requests.

use crate::error::Error;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

//------------ RequestContext ------------------------------------------------

/// Cancellation signal and optional deadline for a single exchange.
///
/// A context combines a [`CancellationToken`] with an optional deadline.
/// Clones share the same token, so cancelling any clone cancels them all.
/// The transport checks the context at every suspension point of an
/// exchange and returns the context's own error, [`Error::Cancelled`] or
/// [`Error::DeadlineExceeded`], as soon as it fires.
///
/// A context without a deadline never expires on its own; bound such a
/// request with [`Config::dial_timeout`][crate::transport::Config] and the
/// per-operation timeouts of the transport instead.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    /// Cancellation signal shared between clones.
    cancel: CancellationToken,

    /// Optional point in time after which the request is abandoned.
    deadline: Option<Instant>,
}

impl RequestContext {
    /// Creates a new context without a deadline.
    pub fn new() -> Self {
        Default::default()
    }

    /// Creates a new context that expires at the given instant.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    /// Creates a new context that expires after the given duration.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// Returns the deadline, if one was set.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cancels the request, on this context and all its clones.
    pub fn cancel(&self) {
        self.cancel.cancel()
    }

    /// Returns the context's error if it has been cancelled or expired.
    pub fn err(&self) -> Option<Error> {
        if self.cancel.is_cancelled() {
            return Some(Error::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                Some(Error::DeadlineExceeded)
            }
            _ => None,
        }
    }

    /// Waits until the context fires and returns its error.
    ///
    /// Resolves to [`Error::Cancelled`] on cancellation and to
    /// [`Error::DeadlineExceeded`] when the deadline passes. Without a
    /// deadline the future only resolves on cancellation.
    pub async fn done(&self) -> Error {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => Error::Cancelled,
                    _ = sleep_until(deadline) => Error::DeadlineExceeded,
                }
            }
            None => {
                self.cancel.cancelled().await;
                Error::Cancelled
            }
        }
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_context_has_no_error() {
        let ctx = RequestContext::new();
        assert!(ctx.err().is_none());
    }

    #[tokio::test]
    async fn cancel_is_shared_between_clones() {
        let ctx = RequestContext::new();
        let clone = ctx.clone();
        clone.cancel();
        assert!(matches!(ctx.err(), Some(Error::Cancelled)));
        assert!(matches!(ctx.done().await, Error::Cancelled));
    }

    #[tokio::test]
    async fn expired_deadline_reports_deadline_exceeded() {
        let ctx = RequestContext::with_timeout(Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(ctx.err(), Some(Error::DeadlineExceeded)));
        assert!(matches!(ctx.done().await, Error::DeadlineExceeded));
    }

    #[tokio::test]
    async fn cancellation_beats_a_far_deadline() {
        let ctx =
            RequestContext::with_timeout(Duration::from_secs(3600));
        ctx.cancel();
        assert!(matches!(ctx.done().await, Error::Cancelled));
    }
}
