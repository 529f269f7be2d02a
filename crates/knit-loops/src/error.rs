//! Error type shared by loops, tasks and managers.

use crate::backend::{PodError, VolumeError, WorkerError};
use crate::hook::HookError;
use crate::storage::StorageError;
use knit_core::RunStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoopError {
    #[error("loop cancelled")]
    Cancelled,
    #[error("cycle deadline exceeded")]
    DeadlineExceeded,
    #[error("invalid run state changing: {from} -> {to}")]
    InvalidTransition { from: RunStatus, to: RunStatus },
    #[error(transparent)]
    Hook(#[from] HookError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error(transparent)]
    Volume(#[from] VolumeError),
    #[error(transparent)]
    Pod(#[from] PodError),
    #[error("assertion error: {0}")]
    Assertion(String),
}

impl LoopError {
    /// Errors a run-picking cycle absorbs; the run is simply retried later.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::DeadlineExceeded | Self::InvalidTransition { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, LoopError>;
