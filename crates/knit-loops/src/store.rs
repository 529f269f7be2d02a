//! Store seams used by the phase tasks.
//!
//! Every `pick_*` operation hands at most one record to a callback and
//! guarantees no other replica is handed the same record until the callback
//! has finished and its outcome is stored.

use crate::error::LoopError;
use crate::storage;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use knit_core::{
    DataAgent, DataAgentCursor, DataAgentMode, Garbage, Id, ProjectionTrigger, PseudoPlanName,
    Run, RunCursor, RunExit, RunStatus,
};
use std::time::Duration;

/// Decides the next status of a picked run.
pub type Transition<'a> =
    Box<dyn FnOnce(Run) -> BoxFuture<'a, Result<RunStatus, LoopError>> + Send + 'a>;

/// Decides whether a picked data agent can be forgotten.
pub type AgentDecision<'a> =
    Box<dyn FnOnce(DataAgent) -> BoxFuture<'a, Result<bool, LoopError>> + Send + 'a>;

/// Releases the resources of a garbage record.
pub type Sweep<'a> = Box<dyn FnOnce(Garbage) -> BoxFuture<'a, Result<(), LoopError>> + Send + 'a>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Picked<C> {
    pub cursor: C,
    /// Whether the stored status differs from before the pick.
    pub changed: bool,
}

/// A pick whose callback or bookkeeping failed. Nothing was stored, but the
/// cursor still moved past the picked record.
#[derive(Debug)]
pub struct PickError<C> {
    pub cursor: C,
    pub source: LoopError,
}

/// Runs created by one projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Projection {
    pub run_ids: Vec<Id>,
    pub trigger: ProjectionTrigger,
}

#[async_trait]
pub trait RunStore: Send + Sync {
    /// Pick one run matching `cursor`, let `transition` decide its next
    /// status and store it.
    async fn pick_and_set_status<'a>(
        &'a self,
        cursor: RunCursor,
        transition: Transition<'a>,
    ) -> Result<Picked<RunCursor>, PickError<RunCursor>>;

    async fn get(&self, run_id: &Id) -> storage::Result<Run>;

    async fn set_exit(&self, run_id: &Id, exit: &RunExit) -> storage::Result<()>;

    /// Forget the worker of a run. Forgetting twice is ok.
    async fn delete_worker(&self, run_id: &Id) -> storage::Result<()>;

    /// Create runs for one updated nomination. `None` when nothing is
    /// nominated.
    async fn project(&self) -> storage::Result<Option<Projection>>;

    /// Put a finished run back to waiting.
    async fn retry(&self, run_id: &Id) -> storage::Result<()>;

    /// Register a running run of a pseudo plan, left alone for
    /// `lifecycle_suspend`.
    async fn new_pseudo(
        &self,
        name: &PseudoPlanName,
        lifecycle_suspend: Duration,
    ) -> storage::Result<Id>;
}

#[async_trait]
pub trait DataStore: Send + Sync {
    async fn agent_names(&self, knit_id: &Id, mode: DataAgentMode)
        -> storage::Result<Vec<String>>;

    /// Pick one data agent; it is removed when `decide` answers `true`.
    async fn pick_and_remove_agent<'a>(
        &'a self,
        cursor: DataAgentCursor,
        decide: AgentDecision<'a>,
    ) -> Result<DataAgentCursor, PickError<DataAgentCursor>>;
}

#[async_trait]
pub trait GarbageStore: Send + Sync {
    /// Pop one garbage record. It is deleted only if `sweep` succeeds.
    /// `Ok(false)` when there is no garbage.
    async fn pop<'a>(&'a self, sweep: Sweep<'a>) -> Result<bool, LoopError>;
}
