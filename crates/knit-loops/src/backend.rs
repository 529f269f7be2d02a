//! Seams to the container platform: worker jobs, data volumes and pods.
//!
//! Failures are classified by kind so callers can tolerate the expected
//! ones ("already exists" on spawn, "missing" on delete) without looking
//! at message text.

use async_trait::async_trait;
use knit_core::Run;
use std::collections::BTreeMap;
use thiserror::Error;

/// Failure reported by the platform API.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("api returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("credentials unavailable: {0}")]
    Credentials(String),
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker not found: {0}")]
    Missing(String),
    #[error("worker already exists: {0}")]
    AlreadyExists(String),
    #[error("run {0} has no worker")]
    Unassigned(String),
    #[error("worker api: {0}")]
    Api(#[from] ApiError),
}

#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("volume not found: {0}")]
    Missing(String),
    #[error("volume already exists: {0}")]
    Conflict(String),
    #[error("volume api: {0}")]
    Api(#[from] ApiError),
}

#[derive(Debug, Error)]
pub enum PodError {
    #[error("pod not found: {0}")]
    Missing(String),
    #[error("pod api: {0}")]
    Api(#[from] ApiError),
}

/// Observed phase of a worker job or a pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Cannot make progress, e.g. image pull failure.
    Stucking,
    Unknown,
}

impl WorkloadPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Stucking)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub phase: WorkloadPhase,
    pub code: u8,
    pub message: String,
}

#[async_trait]
pub trait Worker: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;
    fn status(&self) -> JobStatus;
    /// Stop and remove the worker. Removing an already removed worker is ok.
    async fn close(&self) -> Result<(), WorkerError>;
}

#[async_trait]
pub trait WorkerBackend: Send + Sync {
    async fn find(&self, run: &Run) -> Result<Box<dyn Worker>, WorkerError>;
    /// Start the worker of `run` with extra environment variables.
    async fn spawn(&self, run: &Run, env: &BTreeMap<String, String>) -> Result<(), WorkerError>;
}

/// A volume to provision for an output of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    pub volume_ref: String,
    pub knit_id: String,
    pub run_id: String,
}

#[async_trait]
pub trait VolumeBackend: Send + Sync {
    async fn create_volume(&self, volume: &VolumeSpec) -> Result<(), VolumeError>;
    async fn delete_volume(&self, volume_ref: &str) -> Result<(), VolumeError>;
}

#[async_trait]
pub trait Pod: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;
    fn phase(&self) -> WorkloadPhase;
    async fn close(&self) -> Result<(), PodError>;
}

#[async_trait]
pub trait PodBackend: Send + Sync {
    async fn get_pod(&self, name: &str) -> Result<Box<dyn Pod>, PodError>;
}
