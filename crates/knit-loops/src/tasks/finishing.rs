use super::pick_and_hook;
use crate::backend::{WorkerBackend, WorkerError};
use crate::error::LoopError;
use crate::hook::{EmptyResponse, Hook};
use crate::looping::LoopContext;
use crate::recurring::Task;
use crate::store::{RunStore, Transition};
use async_trait::async_trait;
use futures_util::FutureExt;
use knit_core::{PseudoPlanName, Run, RunCursor, RunStatus};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Releases the worker of completing and aborting runs and settles them.
pub struct FinishingTask {
    runs: Arc<dyn RunStore>,
    workers: Arc<dyn WorkerBackend>,
    hook: Box<dyn Hook<EmptyResponse>>,
}

impl std::fmt::Debug for FinishingTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FinishingTask").finish_non_exhaustive()
    }
}

impl FinishingTask {
    pub fn new(
        runs: Arc<dyn RunStore>,
        workers: Arc<dyn WorkerBackend>,
        hook: Box<dyn Hook<EmptyResponse>>,
    ) -> Self {
        Self {
            runs,
            workers,
            hook,
        }
    }

    /// Completing and aborting runs of every plan.
    pub fn seed(debounce: Duration) -> RunCursor {
        RunCursor {
            head: None,
            debounce,
            pseudo: vec![PseudoPlanName::uploaded(), PseudoPlanName::imported()],
            pseudo_only: false,
            status: vec![RunStatus::Completing, RunStatus::Aborting],
        }
    }

    async fn finish(&self, run: Run) -> Result<RunStatus, LoopError> {
        let next = match run.status {
            RunStatus::Completing => RunStatus::Done,
            RunStatus::Aborting => RunStatus::Failed,
            other => {
                return Err(LoopError::Assertion(format!(
                    "unexpected run status: {other} (run {})",
                    run.id
                )))
            }
        };

        self.hook.before(&run.detail()).await?;

        if let Some(name) = &run.worker_name {
            match self.workers.find(&run).await {
                Ok(worker) => worker.close().await?,
                Err(WorkerError::Missing(_)) => {
                    debug!(run_id = %run.id, worker = %name, "worker already gone");
                }
                Err(e) => return Err(e.into()),
            }
            self.runs.delete_worker(&run.id).await?;
        }
        info!(run_id = %run.id, status = %next, "run finished");
        Ok(next)
    }
}

#[async_trait]
impl Task for FinishingTask {
    type Cursor = RunCursor;

    async fn cycle(&self, ctx: LoopContext, cursor: RunCursor) -> (RunCursor, Result<bool, LoopError>) {
        let transition: Transition<'_> = Box::new(move |run| {
            async move { ctx.run(self.finish(run)).await.and_then(|outcome| outcome) }.boxed()
        });
        pick_and_hook(self.runs.as_ref(), self.hook.as_ref(), cursor, transition).await
    }
}
