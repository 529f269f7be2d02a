use crate::backend::{WorkerBackend, WorkerError, WorkloadPhase};
use crate::error::Result;
use crate::hook::{Hook, StartingHookResponse};
use crate::store::RunStore;
use knit_core::{Run, RunExit, RunStatus};
use std::sync::Arc;
use tracing::{debug, info};

/// Exit recorded for a run whose worker vanished.
const WORKER_LOST: (u8, &str) = (254, "worker for the run is not found");

/// Drives image based runs from the state of their worker.
pub struct ImageManager {
    workers: Arc<dyn WorkerBackend>,
    runs: Arc<dyn RunStore>,
}

impl std::fmt::Debug for ImageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageManager").finish_non_exhaustive()
    }
}

impl ImageManager {
    pub fn new(workers: Arc<dyn WorkerBackend>, runs: Arc<dyn RunStore>) -> Self {
        Self { workers, runs }
    }

    pub async fn manage(
        &self,
        hook: &dyn Hook<StartingHookResponse>,
        run: &Run,
    ) -> Result<RunStatus> {
        let worker = match self.workers.find(run).await {
            Ok(worker) => worker,
            Err(WorkerError::Missing(_)) if run.status == RunStatus::Ready => {
                let response = hook.before(&run.detail()).await?;
                match self.workers.spawn(run, response.env()).await {
                    Ok(()) => info!(run_id = %run.id, "worker spawned"),
                    Err(WorkerError::AlreadyExists(name)) => {
                        debug!(run_id = %run.id, worker = %name, "worker already spawned");
                    }
                    Err(e) => return Err(e.into()),
                }
                return Ok(RunStatus::Starting);
            }
            Err(WorkerError::Missing(name)) => {
                hook.before(&run.detail()).await?;
                let (code, message) = WORKER_LOST;
                self.runs
                    .set_exit(
                        &run.id,
                        &RunExit {
                            code,
                            message: message.to_string(),
                        },
                    )
                    .await?;
                info!(run_id = %run.id, worker = %name, status = %run.status, "worker lost");
                return Ok(RunStatus::Aborting);
            }
            Err(e) => return Err(e.into()),
        };

        let job = worker.status();
        let next = match job.phase {
            WorkloadPhase::Pending => RunStatus::Starting,
            WorkloadPhase::Running => RunStatus::Running,
            WorkloadPhase::Succeeded => RunStatus::Completing,
            WorkloadPhase::Failed | WorkloadPhase::Stucking => RunStatus::Aborting,
            WorkloadPhase::Unknown => run.status,
        };
        if next == run.status {
            return Ok(next);
        }

        hook.before(&run.detail()).await?;
        if matches!(next, RunStatus::Completing | RunStatus::Aborting) {
            self.runs
                .set_exit(
                    &run.id,
                    &RunExit {
                        code: job.code,
                        message: job.message,
                    },
                )
                .await?;
        }
        debug!(run_id = %run.id, worker = worker.name(), phase = ?job.phase, next = %next, "worker observed");
        Ok(next)
    }
}
