//! Core types shared by the lifecycle loops.
//!
//! A Run is one execution of a Plan. Its status only moves forward along
//! the graph encoded in [`RunStatus::can_transition_to`], except for the
//! explicit retry path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for runs and data.
/// Uses `UUIDv7` for time-ordered lexicographic sorting.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind}: {value:?}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

// --- Run status ---

/// Run lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The plan of this run is deactivated.
    Deactivated,
    Waiting,
    /// Output volumes are provisioned; a worker can be started.
    Ready,
    Starting,
    Running,
    /// The worker is observed to have stopped successfully.
    Completing,
    /// The worker stopped unsuccessfully, or should be stopped.
    Aborting,
    Done,
    Failed,
    Invalidated,
}

impl RunStatus {
    pub const ALL: [RunStatus; 10] = [
        Self::Deactivated,
        Self::Waiting,
        Self::Ready,
        Self::Starting,
        Self::Running,
        Self::Completing,
        Self::Aborting,
        Self::Done,
        Self::Failed,
        Self::Invalidated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deactivated => "deactivated",
            Self::Waiting => "waiting",
            Self::Ready => "ready",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Completing => "completing",
            Self::Aborting => "aborting",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Invalidated => "invalidated",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Invalidated)
    }

    /// Whether a loop may move a run from `self` to `next`.
    ///
    /// Staying in the same non-terminal status is allowed; it only refreshes
    /// the run's debounce window. Retry (`Done | Failed -> Waiting`) is not a
    /// loop transition and is rejected here.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::{
            Aborting, Completing, Deactivated, Done, Failed, Invalidated, Ready, Running,
            Starting, Waiting,
        };
        match (*self, next) {
            (Done | Failed | Invalidated, _) => false,
            (current, next) if current == next => true,
            (Deactivated, Waiting | Aborting)
            | (Waiting, Deactivated | Ready | Aborting)
            | (Ready, Starting | Running | Completing | Aborting)
            | (Starting, Running | Completing | Aborting)
            | (Running, Completing | Aborting)
            | (Completing, Done)
            | (Aborting, Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deactivated" => Ok(Self::Deactivated),
            "waiting" => Ok(Self::Waiting),
            "ready" => Ok(Self::Ready),
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "completing" => Ok(Self::Completing),
            "aborting" => Ok(Self::Aborting),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "invalidated" => Ok(Self::Invalidated),
            _ => Err(UnknownVariant {
                kind: "run status",
                value: s.to_string(),
            }),
        }
    }
}

// --- Loop types ---

/// The lifecycle phase a loop process drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopType {
    Projection,
    Initialize,
    RunManagement,
    Finishing,
    GarbageCollection,
    Housekeeping,
}

impl LoopType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Projection => "projection",
            Self::Initialize => "initialize",
            Self::RunManagement => "run_management",
            Self::Finishing => "finishing",
            Self::GarbageCollection => "garbage_collection",
            Self::Housekeeping => "housekeeping",
        }
    }
}

impl std::fmt::Display for LoopType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoopType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "projection" => Ok(Self::Projection),
            "initialize" => Ok(Self::Initialize),
            "run_management" => Ok(Self::RunManagement),
            "finishing" => Ok(Self::Finishing),
            "garbage_collection" => Ok(Self::GarbageCollection),
            "housekeeping" => Ok(Self::Housekeeping),
            _ => Err(UnknownVariant {
                kind: "loop type",
                value: s.to_string(),
            }),
        }
    }
}

// --- Plans ---

/// Name of a system-defined pseudo plan.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PseudoPlanName(pub String);

impl PseudoPlanName {
    pub const UPLOADED: &'static str = "knit#uploaded";
    pub const IMPORTED: &'static str = "knit#imported";

    pub fn uploaded() -> Self {
        Self(Self::UPLOADED.to_string())
    }

    pub fn imported() -> Self {
        Self(Self::IMPORTED.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PseudoPlanName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Workload kind of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PlanKind {
    /// Runs of this plan execute `image` as a worker job.
    Image { image: String },
    /// Runs of this plan are handled in-process.
    Pseudo { name: PseudoPlanName },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanBody {
    pub plan_id: String,
    pub active: bool,
    #[serde(flatten)]
    pub kind: PlanKind,
}

impl PlanBody {
    pub fn pseudo_name(&self) -> Option<&PseudoPlanName> {
        match &self.kind {
            PlanKind::Pseudo { name } => Some(name),
            PlanKind::Image { .. } => None,
        }
    }
}

// --- Runs ---

/// Binding of one data item to a mount point of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    /// Input or output slot id within the plan.
    pub mountpoint_id: i64,
    pub path: String,
    pub knit_id: Id,
    /// Storage volume holding the data.
    pub volume_ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunExit {
    pub code: u8,
    pub message: String,
}

/// A single run of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub id: Id,
    pub status: RunStatus,
    pub plan: PlanBody,
    /// Name of the backing worker once allocated.
    pub worker_name: Option<String>,
    pub inputs: Vec<Assignment>,
    pub outputs: Vec<Assignment>,
    pub log: Option<Assignment>,
    pub exit: Option<RunExit>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    /// Outputs followed by the log, if any.
    pub fn written_data(&self) -> impl Iterator<Item = &Assignment> {
        self.outputs.iter().chain(self.log.iter())
    }

    pub fn detail(&self) -> RunDetail {
        RunDetail::from(self)
    }
}

/// Externally observable projection of a run handed to hooks.
///
/// Hooks never see the orchestration state beyond this value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunDetail {
    pub run_id: String,
    pub status: RunStatus,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit: Option<RunExit>,
    pub plan: PlanSummary,
    pub inputs: Vec<DataBinding>,
    pub outputs: Vec<DataBinding>,
    pub log: Option<DataBinding>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSummary {
    pub plan_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataBinding {
    pub path: String,
    pub knit_id: String,
}

impl From<&Assignment> for DataBinding {
    fn from(a: &Assignment) -> Self {
        Self {
            path: a.path.clone(),
            knit_id: a.knit_id.to_string(),
        }
    }
}

impl From<&Run> for RunDetail {
    fn from(run: &Run) -> Self {
        let (image, name) = match &run.plan.kind {
            PlanKind::Image { image } => (Some(image.clone()), None),
            PlanKind::Pseudo { name } => (None, Some(name.to_string())),
        };
        Self {
            run_id: run.id.to_string(),
            status: run.status,
            updated_at: run.updated_at,
            exit: run.exit.clone(),
            plan: PlanSummary {
                plan_id: run.plan.plan_id.clone(),
                image,
                name,
            },
            inputs: run.inputs.iter().map(DataBinding::from).collect(),
            outputs: run.outputs.iter().map(DataBinding::from).collect(),
            log: run.log.as_ref().map(DataBinding::from),
        }
    }
}

// --- Cursors ---

/// Resumable polling position of a run-picking loop.
#[derive(Debug, Clone, Default)]
pub struct RunCursor {
    /// Id of the run picked last time.
    pub head: Option<Id>,
    /// Minimum delay before a run picked without a status change can be
    /// picked again.
    pub debounce: Duration,
    /// Pseudo plans whose runs are picked. Empty means none.
    pub pseudo: Vec<PseudoPlanName>,
    /// Skip image-based runs.
    pub pseudo_only: bool,
    /// Statuses of runs to pick.
    pub status: Vec<RunStatus>,
}

impl RunCursor {
    /// Same cursor pointing at `head`.
    pub fn moved_to(&self, head: Id) -> Self {
        Self {
            head: Some(head),
            ..self.clone()
        }
    }
}

impl PartialEq for RunCursor {
    fn eq(&self, other: &Self) -> bool {
        self.head == other.head
            && self.pseudo_only == other.pseudo_only
            && self.pseudo.iter().collect::<BTreeSet<_>>()
                == other.pseudo.iter().collect::<BTreeSet<_>>()
            && self.status.iter().collect::<BTreeSet<_>>()
                == other.status.iter().collect::<BTreeSet<_>>()
    }
}

impl Eq for RunCursor {}

/// Mode of a data agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataAgentMode {
    Read,
    Write,
}

impl DataAgentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

impl FromStr for DataAgentMode {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            _ => Err(UnknownVariant {
                kind: "data agent mode",
                value: s.to_string(),
            }),
        }
    }
}

/// A pod reading or writing one data item on behalf of a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataAgent {
    pub name: String,
    pub mode: DataAgentMode,
    pub knit_id: Id,
}

/// Polling position of the housekeeping loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataAgentCursor {
    pub head: Option<String>,
    pub debounce: Duration,
}

/// A storage volume whose data was deleted and is waiting for removal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Garbage {
    pub knit_id: Id,
    pub volume_ref: String,
}

/// What caused a projection to create runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectionTrigger {
    pub plan_id: String,
    pub input_id: i64,
    pub knit_id: Id,
}

impl std::fmt::Display for ProjectionTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "plan{{{}}}.mountpoint{{{}}} = knit id {}",
            self.plan_id, self.input_id, self.knit_id
        )
    }
}
