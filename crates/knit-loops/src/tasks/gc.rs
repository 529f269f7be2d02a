use crate::backend::{VolumeBackend, VolumeError};
use crate::error::LoopError;
use crate::looping::LoopContext;
use crate::recurring::Task;
use crate::store::{GarbageStore, Sweep};
use async_trait::async_trait;
use futures_util::FutureExt;
use knit_core::Garbage;
use std::sync::Arc;
use tracing::{debug, info};

/// Deletes volumes of discarded data.
pub struct GarbageCollectionTask {
    garbage: Arc<dyn GarbageStore>,
    volumes: Arc<dyn VolumeBackend>,
}

impl std::fmt::Debug for GarbageCollectionTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GarbageCollectionTask").finish_non_exhaustive()
    }
}

impl GarbageCollectionTask {
    pub fn new(garbage: Arc<dyn GarbageStore>, volumes: Arc<dyn VolumeBackend>) -> Self {
        Self { garbage, volumes }
    }

    async fn sweep(&self, garbage: Garbage) -> Result<(), LoopError> {
        match self.volumes.delete_volume(&garbage.volume_ref).await {
            Ok(()) => {
                info!(knit_id = %garbage.knit_id, volume = %garbage.volume_ref, "volume deleted");
                Ok(())
            }
            Err(VolumeError::Missing(_)) => {
                debug!(knit_id = %garbage.knit_id, volume = %garbage.volume_ref, "volume already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Task for GarbageCollectionTask {
    type Cursor = ();

    async fn cycle(&self, ctx: LoopContext, cursor: ()) -> ((), Result<bool, LoopError>) {
        let sweep: Sweep<'_> = Box::new(move |garbage| {
            async move { ctx.run(self.sweep(garbage)).await.and_then(|outcome| outcome) }.boxed()
        });

        match self.garbage.pop(sweep).await {
            Ok(popped) => (cursor, Ok(popped)),
            Err(e) if e.is_benign() => (cursor, Ok(false)),
            Err(e) => (cursor, Err(e)),
        }
    }
}
