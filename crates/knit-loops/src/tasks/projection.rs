use crate::error::LoopError;
use crate::looping::LoopContext;
use crate::recurring::Task;
use crate::store::RunStore;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Turns updated nominations into runs.
pub struct ProjectionTask {
    runs: Arc<dyn RunStore>,
}

impl std::fmt::Debug for ProjectionTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionTask").finish_non_exhaustive()
    }
}

impl ProjectionTask {
    pub fn new(runs: Arc<dyn RunStore>) -> Self {
        Self { runs }
    }
}

#[async_trait]
impl Task for ProjectionTask {
    type Cursor = ();

    async fn cycle(&self, ctx: LoopContext, cursor: ()) -> ((), Result<bool, LoopError>) {
        let projected = match ctx.run(self.runs.project()).await {
            Ok(Ok(projected)) => projected,
            Ok(Err(e)) => return (cursor, Err(e.into())),
            Err(e) if e.is_benign() => return (cursor, Ok(false)),
            Err(e) => return (cursor, Err(e)),
        };
        let Some(projection) = projected else {
            return (cursor, Ok(false));
        };
        if !projection.run_ids.is_empty() {
            info!(trigger = %projection.trigger, runs = projection.run_ids.len(), "runs projected");
        }
        (cursor, Ok(true))
    }
}
