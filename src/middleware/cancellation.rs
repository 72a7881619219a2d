// Caller-supplied cancellation and deadline for one database call
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::DbError;

/// Cancellation signal and optional deadline carried through a call.
///
/// Every handler sees it through [`CallContext::cancellation`](crate::CallContext::cancellation)
/// and the driver call runs under it: once the token fires or the deadline
/// passes, the call fails with `DbError::Cancelled` or
/// `DbError::DeadlineExceeded`. The chain itself never checks it between
/// handlers.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    token: Option<CancellationToken>,
    deadline: Option<Instant>,
}

impl Cancellation {
    /// No token and no deadline; the call runs to completion
    pub fn none() -> Self {
        Self::default()
    }

    pub fn from_token(token: CancellationToken) -> Self {
        Self { token: Some(token), deadline: None }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::none().with_timeout(after)
    }

    /// Keep the earlier of the current deadline and `deadline`
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn with_timeout(self, after: Duration) -> Self {
        self.with_deadline(Instant::now() + after)
    }

    pub fn token(&self) -> Option<&CancellationToken> {
        self.token.as_ref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, zero once it has passed
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Whether a token or deadline is present at all
    pub fn is_cancellable(&self) -> bool {
        self.token.is_some() || self.deadline.is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token_fired() || self.deadline_passed()
    }

    /// Resolves once the token fires or the deadline passes. Never resolves for [`none`](Self::none).
    pub async fn cancelled(&self) {
        match (&self.token, self.deadline) {
            (None, None) => futures::future::pending().await,
            (Some(token), None) => token.cancelled().await,
            (None, Some(deadline)) => tokio::time::sleep_until(deadline).await,
            (Some(token), Some(deadline)) => {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
        }
    }

    /// Run `call` unless cancelled first; a call in flight is dropped on cancellation
    pub async fn run<T, F>(&self, call: F) -> Result<T, DbError>
    where
        F: Future<Output = Result<T, DbError>>,
    {
        if !self.is_cancellable() {
            return call.await;
        }
        if self.is_cancelled() {
            return Err(self.error());
        }
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(self.error()),
            result = call => result,
        }
    }

    fn token_fired(&self) -> bool {
        self.token.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= Instant::now())
    }

    fn error(&self) -> DbError {
        if self.token_fired() {
            DbError::Cancelled
        } else {
            DbError::DeadlineExceeded
        }
    }
}
