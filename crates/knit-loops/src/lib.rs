//! knit-loops - run lifecycle loops
//!
//! Each process runs one phase of the run lifecycle as a polling loop.
//! Replicas of a phase coordinate only through the shared store.

pub mod backend;
pub mod error;
pub mod filewatch;
pub mod hook;
pub mod kube;
pub mod looping;
pub mod manager;
pub mod policy;
pub mod recurring;
pub mod storage;
pub mod store;
pub mod tasks;

#[cfg(test)]
mod testing;

use std::sync::Arc;
use std::time::Duration;

use backend::{PodBackend, VolumeBackend, WorkerBackend};
use error::LoopError;
use hook::{Hook, HookResponse, WebHook};
use knit_core::{HookConfig, LoopType, PseudoPlanName};
use looping::LoopOptions;
use manager::{ImageManager, Manager, ManagerTable, UploadedManager};
use policy::Policy;
use storage::Storage;
use tasks::{
    FinishingTask, GarbageCollectionTask, HousekeepingTask, InitializeTask, ProjectionTask,
    RunManagementTask,
};
use tokio_util::sync::CancellationToken;

/// Which phase to run and how long to keep running it.
#[derive(Debug, Clone)]
pub struct LoopManifest {
    pub kind: LoopType,
    pub policy: Policy,
}

/// Everything a phase may need.
pub struct Environment {
    pub storage: Arc<Storage>,
    pub workers: Arc<dyn WorkerBackend>,
    pub volumes: Arc<dyn VolumeBackend>,
    pub pods: Arc<dyn PodBackend>,
    pub hooks: HookConfig,
    /// Client for webhooks.
    pub http: reqwest::Client,
    pub debounce: Duration,
    /// Per-cycle limit of initialize and run management.
    pub cycle_timeout: Duration,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("hooks", &self.hooks)
            .field("debounce", &self.debounce)
            .field("cycle_timeout", &self.cycle_timeout)
            .finish_non_exhaustive()
    }
}

impl Environment {
    fn hook<R: HookResponse>(&self, kind: LoopType) -> Result<Box<dyn Hook<R>>, LoopError> {
        let urls = self.hooks.for_phase(kind);
        Ok(Box::new(WebHook::<R>::new(self.http.clone(), &urls)?))
    }

    fn managers(&self) -> ManagerTable {
        ManagerTable::new(ImageManager::new(
            Arc::clone(&self.workers),
            Arc::clone(&self.storage) as _,
        ))
        .with_pseudo(PseudoPlanName::imported(), Manager::Imported)
        .with_pseudo(
            PseudoPlanName::uploaded(),
            Manager::Uploaded(UploadedManager::new(Arc::clone(&self.storage) as _)),
        )
    }
}

/// Run the loop named by `manifest` until its policy stops it, it fails,
/// or `token` is cancelled.
pub async fn start_loop(
    token: &CancellationToken,
    manifest: &LoopManifest,
    env: &Environment,
) -> Result<(), LoopError> {
    let kind = manifest.kind;
    let policy = &manifest.policy;
    let plain = LoopOptions::default();
    let timed = LoopOptions::default().with_timeout(env.cycle_timeout);

    match kind {
        LoopType::Projection => {
            let task = ProjectionTask::new(Arc::clone(&env.storage) as _);
            recurring::run(kind, token, &task, (), policy, plain).await.1
        }
        LoopType::Initialize => {
            let task = InitializeTask::new(
                Arc::clone(&env.storage) as _,
                Arc::clone(&env.volumes),
                env.hook(kind)?,
            );
            recurring::run(kind, token, &task, InitializeTask::seed(), policy, timed).await.1
        }
        LoopType::RunManagement => {
            let task = RunManagementTask::new(
                Arc::clone(&env.storage) as _,
                env.managers(),
                env.hook(kind)?,
            );
            let seed = task.seed(env.debounce);
            recurring::run(kind, token, &task, seed, policy, timed).await.1
        }
        LoopType::Finishing => {
            let task = FinishingTask::new(
                Arc::clone(&env.storage) as _,
                Arc::clone(&env.workers),
                env.hook(kind)?,
            );
            let seed = FinishingTask::seed(env.debounce);
            recurring::run(kind, token, &task, seed, policy, plain).await.1
        }
        LoopType::GarbageCollection => {
            let task = GarbageCollectionTask::new(
                Arc::clone(&env.storage) as _,
                Arc::clone(&env.volumes),
            );
            recurring::run(kind, token, &task, (), policy, plain).await.1
        }
        LoopType::Housekeeping => {
            let task = HousekeepingTask::new(Arc::clone(&env.storage) as _, Arc::clone(&env.pods));
            let seed = HousekeepingTask::seed(env.debounce);
            recurring::run(kind, token, &task, seed, policy, plain).await.1
        }
    }
}
