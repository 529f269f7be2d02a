use crate::error::Result;
use crate::hook::{Hook, StartingHookResponse};
use knit_core::{Run, RunStatus};
use tracing::info;

/// An imported run still running once its suspension is over was never
/// finished by the importer, so it is aborted.
pub(super) async fn manage(hook: &dyn Hook<StartingHookResponse>, run: &Run) -> Result<RunStatus> {
    if run.status != RunStatus::Running {
        return Ok(run.status);
    }
    hook.before(&run.detail()).await?;
    info!(run_id = %run.id, "import timed out");
    Ok(RunStatus::Aborting)
}
