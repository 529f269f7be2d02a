use crate::backend::{PodBackend, PodError};
use crate::error::LoopError;
use crate::looping::LoopContext;
use crate::recurring::Task;
use crate::store::{AgentDecision, DataStore, PickError};
use async_trait::async_trait;
use futures_util::FutureExt;
use knit_core::{DataAgent, DataAgentCursor};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Forgets data agents whose pod has finished or disappeared.
pub struct HousekeepingTask {
    data: Arc<dyn DataStore>,
    pods: Arc<dyn PodBackend>,
}

impl std::fmt::Debug for HousekeepingTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HousekeepingTask").finish_non_exhaustive()
    }
}

impl HousekeepingTask {
    pub fn new(data: Arc<dyn DataStore>, pods: Arc<dyn PodBackend>) -> Self {
        Self { data, pods }
    }

    pub fn seed(debounce: Duration) -> DataAgentCursor {
        DataAgentCursor {
            head: None,
            debounce,
        }
    }

    /// Whether the agent's record can go.
    async fn settle(&self, agent: DataAgent) -> Result<bool, LoopError> {
        let pod = match self.pods.get_pod(&agent.name).await {
            Ok(pod) => pod,
            Err(PodError::Missing(_)) => {
                info!(agent = %agent.name, knit_id = %agent.knit_id, "data agent vanished");
                return Ok(true);
            }
            Err(e) => return Err(e.into()),
        };
        let phase = pod.phase();
        if !phase.is_terminal() {
            debug!(agent = %agent.name, phase = ?phase, "data agent alive");
            return Ok(false);
        }
        pod.close().await?;
        info!(agent = %agent.name, knit_id = %agent.knit_id, phase = ?phase, "data agent closed");
        Ok(true)
    }
}

#[async_trait]
impl Task for HousekeepingTask {
    type Cursor = DataAgentCursor;

    async fn cycle(
        &self,
        ctx: LoopContext,
        cursor: DataAgentCursor,
    ) -> (DataAgentCursor, Result<bool, LoopError>) {
        let previous = cursor.clone();
        let decide: AgentDecision<'_> = Box::new(move |agent| {
            async move { ctx.run(self.settle(agent)).await.and_then(|outcome| outcome) }.boxed()
        });
        let (cursor, outcome) = match self.data.pick_and_remove_agent(cursor, decide).await {
            Ok(cursor) => (cursor, Ok(())),
            Err(PickError { cursor, source }) if source.is_benign() => (cursor, Ok(())),
            Err(PickError { cursor, source }) => (cursor, Err(source)),
        };
        let progressed = cursor != previous;
        (cursor, outcome.map(|()| progressed))
    }
}
