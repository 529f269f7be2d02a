use super::pick_and_hook;
use crate::backend::{VolumeBackend, VolumeError, VolumeSpec};
use crate::error::LoopError;
use crate::hook::{EmptyResponse, Hook};
use crate::looping::LoopContext;
use crate::recurring::Task;
use crate::store::{RunStore, Transition};
use async_trait::async_trait;
use futures_util::FutureExt;
use knit_core::{Run, RunCursor, RunStatus};
use std::sync::Arc;
use tracing::debug;

/// Provisions output volumes of waiting runs and marks them ready.
pub struct InitializeTask {
    runs: Arc<dyn RunStore>,
    volumes: Arc<dyn VolumeBackend>,
    hook: Box<dyn Hook<EmptyResponse>>,
}

impl std::fmt::Debug for InitializeTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitializeTask").finish_non_exhaustive()
    }
}

impl InitializeTask {
    pub fn new(
        runs: Arc<dyn RunStore>,
        volumes: Arc<dyn VolumeBackend>,
        hook: Box<dyn Hook<EmptyResponse>>,
    ) -> Self {
        Self {
            runs,
            volumes,
            hook,
        }
    }

    /// Initial cursor: waiting image based runs.
    pub fn seed() -> RunCursor {
        RunCursor {
            status: vec![RunStatus::Waiting],
            ..RunCursor::default()
        }
    }

    async fn initialize(&self, run: Run) -> Result<RunStatus, LoopError> {
        self.hook.before(&run.detail()).await?;
        for written in run.written_data() {
            let volume = VolumeSpec {
                volume_ref: written.volume_ref.clone(),
                knit_id: written.knit_id.to_string(),
                run_id: run.id.to_string(),
            };
            match self.volumes.create_volume(&volume).await {
                Ok(()) => {}
                Err(VolumeError::Conflict(name)) => {
                    debug!(run_id = %run.id, volume = %name, "volume already provisioned");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(RunStatus::Ready)
    }
}

#[async_trait]
impl Task for InitializeTask {
    type Cursor = RunCursor;

    async fn cycle(&self, ctx: LoopContext, cursor: RunCursor) -> (RunCursor, Result<bool, LoopError>) {
        let transition: Transition<'_> = Box::new(move |run| {
            async move { ctx.run(self.initialize(run)).await.and_then(|outcome| outcome) }.boxed()
        });
        pick_and_hook(self.runs.as_ref(), self.hook.as_ref(), cursor, transition).await
    }
}
