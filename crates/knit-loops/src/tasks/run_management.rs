use super::pick_and_hook;
use crate::error::LoopError;
use crate::hook::{Hook, StartingHookResponse};
use crate::looping::LoopContext;
use crate::manager::ManagerTable;
use crate::recurring::Task;
use crate::store::{RunStore, Transition};
use async_trait::async_trait;
use futures_util::FutureExt;
use knit_core::{RunCursor, RunStatus};
use std::sync::Arc;
use std::time::Duration;

/// Follows started runs through their managers.
pub struct RunManagementTask {
    runs: Arc<dyn RunStore>,
    managers: ManagerTable,
    hook: Box<dyn Hook<StartingHookResponse>>,
}

impl std::fmt::Debug for RunManagementTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunManagementTask")
            .field("managers", &self.managers)
            .finish_non_exhaustive()
    }
}

impl RunManagementTask {
    pub fn new(
        runs: Arc<dyn RunStore>,
        managers: ManagerTable,
        hook: Box<dyn Hook<StartingHookResponse>>,
    ) -> Self {
        Self {
            runs,
            managers,
            hook,
        }
    }

    /// Ready, starting and running runs of image plans and of every pseudo
    /// plan with a manager.
    pub fn seed(&self, debounce: Duration) -> RunCursor {
        RunCursor {
            head: None,
            debounce,
            pseudo: self.managers.pseudo_plans(),
            pseudo_only: false,
            status: vec![RunStatus::Ready, RunStatus::Starting, RunStatus::Running],
        }
    }
}

#[async_trait]
impl Task for RunManagementTask {
    type Cursor = RunCursor;

    async fn cycle(&self, ctx: LoopContext, cursor: RunCursor) -> (RunCursor, Result<bool, LoopError>) {
        let transition: Transition<'_> = Box::new(move |run| {
            async move {
                ctx.run(self.managers.manage(self.hook.as_ref(), &run))
                    .await
                    .and_then(|outcome| outcome)
            }
            .boxed()
        });
        pick_and_hook(self.runs.as_ref(), self.hook.as_ref(), cursor, transition).await
    }
}
