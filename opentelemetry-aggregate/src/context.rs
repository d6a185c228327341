//! The calling context a measurement is recorded under.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

/// Carries cancellation and deadline information alongside a measurement.
///
/// Measurements recorded with a context that is already [done] are dropped
/// before they reach any aggregator. The check is made once, on entry; a
/// measurement that has started being aggregated is always fully applied.
///
/// [done]: Context::is_done
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use opentelemetry_aggregate::Context;
/// use tokio_util::sync::CancellationToken;
///
/// let token = CancellationToken::new();
/// let cx = Context::new()
///     .with_cancellation(token.clone())
///     .with_timeout(Duration::from_secs(5));
/// assert!(!cx.is_done());
///
/// token.cancel();
/// assert!(cx.is_done());
/// ```
#[derive(Clone, Debug, Default)]
pub struct Context {
    cancellation: Option<CancellationToken>,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    pub fn new() -> Self {
        Context::default()
    }

    /// Ties this context to `token`; the context is done once it is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Sets an absolute deadline after which the context is done.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Sets a deadline `timeout` from now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// The deadline of this context, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns `true` if the context was cancelled or its deadline has passed.
    pub fn is_done(&self) -> bool {
        let cancelled = self
            .cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled);
        cancelled || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}
