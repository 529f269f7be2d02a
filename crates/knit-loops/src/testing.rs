//! In-memory backends and fixtures for unit tests.

use crate::backend::{
    JobStatus, Pod, PodBackend, PodError, VolumeBackend, VolumeError, VolumeSpec, Worker,
    WorkerBackend, WorkerError, WorkloadPhase,
};
use crate::hook::{FuncHook, HookResponse};
use crate::storage::{NewMountpoint, NewPlan, Storage};
use crate::store::RunStore;
use async_trait::async_trait;
use knit_core::{Id, PseudoPlanName, Run, RunStatus};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub struct TestStorage {
    pub storage: Arc<Storage>,
    _dir: TempDir,
}

pub async fn create_test_storage() -> TestStorage {
    let dir = TempDir::new().unwrap();
    let storage = Storage::new(&dir.path().join("test.db")).await.unwrap();
    storage.migrate_embedded().await.unwrap();
    TestStorage {
        storage: Arc::new(storage),
        _dir: dir,
    }
}

/// Register a one-input plan, upload matching data and project it.
/// Returns the id of the waiting run.
pub async fn waiting_run(storage: &Storage) -> Id {
    storage
        .register_plan(&NewPlan {
            plan_id: "plan-train".to_string(),
            image: "repo/train:1.0".to_string(),
            active: true,
            inputs: vec![NewMountpoint::new("/in", &["type:dataset"])],
            outputs: vec![NewMountpoint::new("/out", &["type:model"])],
            log: Some(NewMountpoint::new("/log", &[])),
        })
        .await
        .unwrap();
    let upload = storage
        .new_pseudo(&PseudoPlanName::uploaded(), Duration::ZERO)
        .await
        .unwrap();
    let knit_id = storage.get(&upload).await.unwrap().outputs[0].knit_id.clone();
    storage.tag_data(&knit_id, "type:dataset").await.unwrap();
    storage.set_status(&upload, RunStatus::Completing).await.unwrap();
    storage.set_status(&upload, RunStatus::Done).await.unwrap();
    storage.project().await.unwrap().unwrap().run_ids[0].clone()
}

/// Move a run along `path` outside the loops.
pub async fn walk(storage: &Storage, run_id: &Id, path: &[RunStatus]) {
    for status in path {
        storage.set_status(run_id, *status).await.unwrap();
    }
}

pub type Journal = Arc<Mutex<Vec<String>>>;

pub fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn entries(journal: &Journal) -> Vec<String> {
    journal.lock().unwrap().clone()
}

/// A hook writing `before <status>` and `after <status>` lines.
pub fn recording_hook<R: HookResponse>(journal: &Journal) -> FuncHook<R> {
    let before = journal.clone();
    let after = journal.clone();
    FuncHook::new()
        .with_before(move |d| {
            before.lock().unwrap().push(format!("before {}", d.status));
            Ok(R::default())
        })
        .with_after(move |d| {
            after.lock().unwrap().push(format!("after {}", d.status));
            Ok(())
        })
}

#[derive(Debug)]
pub struct FakeWorker {
    name: String,
    status: JobStatus,
    journal: Journal,
}

#[async_trait]
impl Worker for FakeWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn status(&self) -> JobStatus {
        self.status.clone()
    }

    async fn close(&self) -> Result<(), WorkerError> {
        self.journal.lock().unwrap().push(format!("close {}", self.name));
        Ok(())
    }
}

/// Workers by name. Spawning records the environment.
#[derive(Debug, Default)]
pub struct FakeWorkers {
    pub jobs: Mutex<HashMap<String, JobStatus>>,
    pub spawned: Mutex<Vec<(String, BTreeMap<String, String>)>>,
    pub journal: Journal,
}

impl FakeWorkers {
    pub fn with_journal(journal: &Journal) -> Self {
        Self {
            journal: journal.clone(),
            ..Self::default()
        }
    }

    pub fn set(&self, name: &str, phase: WorkloadPhase, code: u8, message: &str) {
        self.jobs.lock().unwrap().insert(
            name.to_string(),
            JobStatus {
                phase,
                code,
                message: message.to_string(),
            },
        );
    }
}

#[async_trait]
impl WorkerBackend for FakeWorkers {
    async fn find(&self, run: &Run) -> Result<Box<dyn Worker>, WorkerError> {
        let name = run
            .worker_name
            .clone()
            .ok_or_else(|| WorkerError::Unassigned(run.id.to_string()))?;
        let status = self
            .jobs
            .lock()
            .unwrap()
            .get(&name)
            .cloned()
            .ok_or_else(|| WorkerError::Missing(name.clone()))?;
        Ok(Box::new(FakeWorker {
            name,
            status,
            journal: self.journal.clone(),
        }))
    }

    async fn spawn(&self, run: &Run, env: &BTreeMap<String, String>) -> Result<(), WorkerError> {
        let name = run
            .worker_name
            .clone()
            .ok_or_else(|| WorkerError::Unassigned(run.id.to_string()))?;
        self.journal.lock().unwrap().push(format!("spawn {name}"));
        self.spawned.lock().unwrap().push((name.clone(), env.clone()));
        let mut jobs = self.jobs.lock().unwrap();
        if jobs.contains_key(&name) {
            return Err(WorkerError::AlreadyExists(name));
        }
        jobs.insert(
            name,
            JobStatus {
                phase: WorkloadPhase::Pending,
                code: 0,
                message: String::new(),
            },
        );
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FakeVolumes {
    pub existing: Mutex<HashSet<String>>,
    pub created: Mutex<Vec<String>>,
    pub deleted: Mutex<Vec<String>>,
    pub fail: Mutex<bool>,
}

#[async_trait]
impl VolumeBackend for FakeVolumes {
    async fn create_volume(&self, volume: &VolumeSpec) -> Result<(), VolumeError> {
        if *self.fail.lock().unwrap() {
            return Err(VolumeError::Api(crate::backend::ApiError::Status {
                status: 500,
                message: "internal error".to_string(),
            }));
        }
        self.created.lock().unwrap().push(volume.volume_ref.clone());
        if !self.existing.lock().unwrap().insert(volume.volume_ref.clone()) {
            return Err(VolumeError::Conflict(volume.volume_ref.clone()));
        }
        Ok(())
    }

    async fn delete_volume(&self, volume_ref: &str) -> Result<(), VolumeError> {
        self.deleted.lock().unwrap().push(volume_ref.to_string());
        if !self.existing.lock().unwrap().remove(volume_ref) {
            return Err(VolumeError::Missing(volume_ref.to_string()));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct FakePod {
    name: String,
    phase: WorkloadPhase,
    closed: Journal,
}

#[async_trait]
impl Pod for FakePod {
    fn name(&self) -> &str {
        &self.name
    }

    fn phase(&self) -> WorkloadPhase {
        self.phase
    }

    async fn close(&self) -> Result<(), PodError> {
        self.closed.lock().unwrap().push(self.name.clone());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FakePods {
    pub pods: Mutex<HashMap<String, WorkloadPhase>>,
    pub closed: Journal,
}

#[async_trait]
impl PodBackend for FakePods {
    async fn get_pod(&self, name: &str) -> Result<Box<dyn Pod>, PodError> {
        let phase = self
            .pods
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .ok_or_else(|| PodError::Missing(name.to_string()))?;
        Ok(Box::new(FakePod {
            name: name.to_string(),
            phase,
            closed: self.closed.clone(),
        }))
    }
}
