//! Generic polling loop.
//!
//! [`start`] calls a task repeatedly, threading a value through the calls.
//! The task decides after each call whether to go on, and how long to wait
//! first, by returning a [`Next`].

use crate::error::LoopError;
use crate::policy::format_duration;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// What the loop does after a cycle.
#[derive(Debug)]
pub enum Next {
    /// Run again after the interval. Zero means immediately.
    Continue(Duration),
    /// Stop cleanly.
    Stop,
    /// Stop with an error.
    Fail(LoopError),
}

impl std::fmt::Display for Next {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Continue(interval) => write!(f, "continue after {}", format_duration(*interval)),
            Self::Stop => f.write_str("stop"),
            Self::Fail(err) => write!(f, "stop with error: {err}"),
        }
    }
}

/// Cancellation scope of one cycle: the loop's token plus an optional
/// deadline.
#[derive(Debug, Clone)]
pub struct LoopContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl LoopContext {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// A context that also expires after `timeout`. The outer deadline, if
    /// any, still applies.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        Self {
            token: self.token.clone(),
            deadline: Some(self.deadline.map_or(deadline, |d| d.min(deadline))),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Why this context is done, if it is.
    pub fn err(&self) -> Option<LoopError> {
        if self.token.is_cancelled() {
            return Some(LoopError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(LoopError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once the context is cancelled or expired.
    pub async fn done(&self) -> LoopError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                () = self.token.cancelled() => LoopError::Cancelled,
                () = tokio::time::sleep_until(deadline) => LoopError::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                LoopError::Cancelled
            }
        }
    }

    /// Drive `fut` unless the context ends first, in which case `fut` is
    /// dropped.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, LoopError> {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            out = fut => Ok(out),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LoopOptions {
    /// Per-cycle time limit.
    pub timeout: Option<Duration>,
}

impl LoopOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Run `task` until it stops or `token` is cancelled.
///
/// Returns the last value together with how the loop ended: `Ok` for a
/// clean stop, the task's error, or [`LoopError::Cancelled`].
pub async fn start<T, F, Fut>(
    token: &CancellationToken,
    init: T,
    options: LoopOptions,
    mut task: F,
) -> (T, Result<(), LoopError>)
where
    F: FnMut(LoopContext, T) -> Fut,
    Fut: Future<Output = (T, Next)>,
{
    let root = LoopContext::new(token.clone());
    let mut value = init;
    loop {
        if let Some(err) = root.err() {
            return (value, Err(err));
        }

        let ctx = match options.timeout {
            Some(timeout) => root.with_timeout(timeout),
            None => root.clone(),
        };
        let (next_value, next) = task(ctx, value).await;
        value = next_value;

        match next {
            Next::Continue(interval) if interval.is_zero() => {}
            Next::Continue(interval) => {
                tokio::select! {
                    () = token.cancelled() => return (value, Err(LoopError::Cancelled)),
                    () = tokio::time::sleep(interval) => {}
                }
            }
            Next::Stop => return (value, Ok(())),
            Next::Fail(err) => return (value, Err(err)),
        }
    }
}
