use crate::error::Result;
use crate::hook::{Hook, StartingHookResponse};
use crate::store::DataStore;
use knit_core::{DataAgentMode, Run, RunStatus};
use std::sync::Arc;
use tracing::{debug, info};

/// Keeps an upload running while a write agent is attached to its data.
pub struct UploadedManager {
    data: Arc<dyn DataStore>,
}

impl std::fmt::Debug for UploadedManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadedManager").finish_non_exhaustive()
    }
}

impl UploadedManager {
    pub fn new(data: Arc<dyn DataStore>) -> Self {
        Self { data }
    }

    pub async fn manage(
        &self,
        hook: &dyn Hook<StartingHookResponse>,
        run: &Run,
    ) -> Result<RunStatus> {
        for written in run.written_data() {
            let agents = self
                .data
                .agent_names(&written.knit_id, DataAgentMode::Write)
                .await?;
            if !agents.is_empty() {
                debug!(run_id = %run.id, knit_id = %written.knit_id, agents = agents.len(), "upload in progress");
                return Ok(run.status);
            }
        }

        hook.before(&run.detail()).await?;
        info!(run_id = %run.id, "upload abandoned");
        Ok(RunStatus::Aborting)
    }
}
