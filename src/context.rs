//! Deadline and cancellation carried through dial operations.

use std::fmt;
use std::io;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// Reason a [`Context`] finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Done {
    Cancelled,
    DeadlineExceeded,
}

impl From<Done> for Error {
    fn from(done: Done) -> Self {
        match done {
            Done::Cancelled => Error::Cancelled,
            Done::DeadlineExceeded => Error::DeadlineExceeded,
        }
    }
}

impl From<Done> for io::Error {
    fn from(done: Done) -> Self {
        match done {
            Done::Cancelled => io::Error::new(io::ErrorKind::Interrupted, "context canceled"),
            Done::DeadlineExceeded => {
                io::Error::new(io::ErrorKind::TimedOut, "context deadline exceeded")
            }
        }
    }
}

/// Call context with an optional deadline and a cancellation token.
///
/// Derived contexts share cancellation with their parent: cancelling the
/// parent cancels every child, never the other way round.
#[derive(Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl Context {
    /// A context that never expires and is never cancelled.
    pub fn background() -> Self {
        Self::default()
    }

    /// Child context that expires after `timeout`, or at the parent's
    /// deadline if that comes first.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        };
        Self {
            deadline: Some(deadline),
            cancel: self.cancel.child_token(),
        }
    }

    /// Child context plus the token that cancels it.
    pub fn with_cancel(&self) -> (Self, CancellationToken) {
        let cancel = self.cancel.child_token();
        let ctx = Self {
            deadline: self.deadline,
            cancel: cancel.clone(),
        };
        (ctx, cancel)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Returns the reason the context is finished, if it is.
    pub fn err(&self) -> Option<Done> {
        if self.cancel.is_cancelled() {
            return Some(Done::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Done::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> Done {
        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Done::Cancelled,
                _ = tokio::time::sleep_until(deadline) => Done::DeadlineExceeded,
            },
            None => {
                self.cancel.cancelled().await;
                Done::Cancelled
            }
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("remaining", &self.remaining())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
