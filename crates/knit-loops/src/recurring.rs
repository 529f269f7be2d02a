//! Glue between phase tasks, policies and the generic loop.

use crate::error::LoopError;
use crate::looping::{self, LoopContext, LoopOptions};
use crate::policy::Policy;
use async_trait::async_trait;
use knit_core::LoopType;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

/// One phase of the run lifecycle, executed one unit of work per cycle.
#[async_trait]
pub trait Task: Send + Sync {
    /// Polling position carried from one cycle to the next.
    type Cursor: std::fmt::Debug + Send + 'static;

    /// Process at most one unit of work. `Ok(true)` means something
    /// happened and more may be waiting.
    async fn cycle(
        &self,
        ctx: LoopContext,
        cursor: Self::Cursor,
    ) -> (Self::Cursor, Result<bool, LoopError>);
}

/// Run `task` under `policy` until the policy stops it or `token` fires.
/// Every cycle is logged with its sequence number, duration and outcome.
pub async fn run<K: Task>(
    kind: LoopType,
    token: &CancellationToken,
    task: &K,
    seed: K::Cursor,
    policy: &Policy,
    options: LoopOptions,
) -> (K::Cursor, Result<(), LoopError>) {
    let span = info_span!("loop", kind = %kind);
    let mut counter: u64 = 0;

    async move {
        info!(policy = %policy, timeout = ?options.timeout, "loop start");
        let (cursor, result) = looping::start(token, seed, options, |ctx, cursor| {
            counter += 1;
            let cycle = counter;
            async move {
                let started = Instant::now();
                debug!(cycle, "task start");

                let (cursor, outcome) = task.cycle(ctx, cursor).await;
                let next = match outcome {
                    Ok(progressed) => policy.next(progressed, None),
                    Err(err) => {
                        warn!(cycle, error = %err, "task failed");
                        policy.next(false, Some(err))
                    }
                };

                debug!(
                    cycle,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    next = %next,
                    cursor = ?cursor,
                    "task end"
                );
                (cursor, next)
            }
        })
        .await;

        match &result {
            Ok(()) => info!("loop stopped"),
            Err(LoopError::Cancelled) => info!("loop cancelled"),
            Err(err) => warn!(error = %err, "loop stopped with error"),
        }
        (cursor, result)
    }
    .instrument(span)
    .await
}
