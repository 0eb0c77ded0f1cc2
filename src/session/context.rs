use crate::error::{CancelReason, Phase};
use crate::{PgReportError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Deadline and cancellation signal for one caller's request.
///
/// Every database round-trip made on behalf of the request runs through
/// [`QueryContext::run`], so a cancelled or expired context aborts whatever
/// call is in flight.
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl QueryContext {
    /// A context with no deadline that is never cancelled unless asked to
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        QueryContext {
            deadline: Some(deadline),
            cancel: CancellationToken::new(),
        }
    }

    /// Tie this context to an externally owned token
    pub fn cancelled_by(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Fail fast if the context is already done
    pub fn check(&self, phase: Phase) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(PgReportError::Cancelled { phase, reason: CancelReason::Cancelled });
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(PgReportError::Cancelled { phase, reason: CancelReason::DeadlineExceeded });
        }
        Ok(())
    }

    /// Drive `fut` until it finishes, the deadline passes or the context is
    /// cancelled. The future is dropped on the two latter paths.
    pub async fn run<T, F>(&self, phase: Phase, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                Err(PgReportError::Cancelled { phase, reason: CancelReason::Cancelled })
            }
            _ = deadline => {
                Err(PgReportError::Cancelled { phase, reason: CancelReason::DeadlineExceeded })
            }
            result = fut => result,
        }
    }
}
