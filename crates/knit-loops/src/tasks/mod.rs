//! Loop bodies of the lifecycle phases.
//!
//! Every task does at most one unit of work per cycle and reports whether
//! it did any. Run-picking tasks share [`pick_and_hook`].

mod finishing;
mod gc;
mod housekeeping;
mod initialize;
mod projection;
mod run_management;

pub use finishing::FinishingTask;
pub use gc::GarbageCollectionTask;
pub use housekeeping::HousekeepingTask;
pub use initialize::InitializeTask;
pub use projection::ProjectionTask;
pub use run_management::RunManagementTask;

use crate::error::LoopError;
use crate::hook::{Hook, HookResponse};
use crate::store::{PickError, RunStore, Transition};
use knit_core::{Id, RunCursor};
use tracing::{debug, warn};

/// Pick a run with `transition`; if its status changed, fire the
/// after-hook with the stored run.
///
/// Cancellation, deadlines and rejected transitions end the cycle quietly.
/// Progress means the cursor moved.
pub(crate) async fn pick_and_hook<'a, R: HookResponse>(
    runs: &'a dyn RunStore,
    hook: &dyn Hook<R>,
    cursor: RunCursor,
    transition: Transition<'a>,
) -> (RunCursor, Result<bool, LoopError>) {
    let previous = cursor.clone();
    let (cursor, outcome) = match runs.pick_and_set_status(cursor, transition).await {
        Ok(picked) => {
            if picked.changed {
                if let Some(run_id) = &picked.cursor.head {
                    fire_after(runs, hook, run_id).await;
                }
            }
            (picked.cursor, Ok(()))
        }
        Err(PickError { cursor, source }) if source.is_benign() => {
            debug!(run_id = ?cursor.head, reason = %source, "run left as is");
            (cursor, Ok(()))
        }
        Err(PickError { cursor, source }) => (cursor, Err(source)),
    };
    let progressed = cursor != previous;
    (cursor, outcome.map(|()| progressed))
}

async fn fire_after<R: HookResponse>(runs: &dyn RunStore, hook: &dyn Hook<R>, run_id: &Id) {
    let run = match runs.get(run_id).await {
        Ok(run) => run,
        Err(e) => {
            warn!(run_id = %run_id, error = %e, "cannot load run for after hook");
            return;
        }
    };
    if let Err(e) = hook.after(&run.detail()).await {
        warn!(run_id = %run_id, status = %run.status, error = %e, "after hook failed");
    }
}
