//! SQLite storage for runs, data, data agents and garbage.
//!
//! `SQLite` has a single writer and no row locks, so a pick does not hold a
//! transaction while its callback runs. Instead the picked record is claimed
//! by pushing its suspend time into the future (a lease), and the outcome is
//! written with a compare-and-set on that lease. A replica that crashes
//! mid-callback leaves the lease behind; the record becomes pickable again
//! once the lease expires.

use crate::error::LoopError;
use crate::store::{
    AgentDecision, DataStore, GarbageStore, PickError, Picked, Projection, RunStore, Sweep,
    Transition,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use knit_core::{
    Assignment, DataAgent, DataAgentCursor, DataAgentMode, Garbage, Id, PlanBody, PlanKind,
    ProjectionTrigger, PseudoPlanName, Run, RunCursor, RunExit, RunStatus,
};
use sqlx::sqlite::{SqliteConnection, SqlitePoolOptions};
use sqlx::{Pool, QueryBuilder, Sqlite};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Explicit column list for run queries.
const RUNS_COLUMNS: &str = "r.run_id, r.plan_id, r.status, r.updated_at, \
    p.image, p.pseudo_name, p.active, \
    w.name AS worker_name, e.code AS exit_code, e.message AS exit_message";

const RUNS_FROM: &str = "FROM runs r \
    JOIN plans p ON p.plan_id = r.plan_id \
    LEFT JOIN workers w ON w.run_id = r.run_id \
    LEFT JOIN run_exits e ON e.run_id = r.run_id";

/// How long a picked record stays claimed when its callback never returns.
pub const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("io error: {0}")]
    Io(String),
    #[error("run not found: {0}")]
    RunNotFound(String),
    #[error("plan not found: {0}")]
    PlanNotFound(String),
    #[error("run {run_id} cannot be retried: {reason}")]
    RetryProtected { run_id: String, reason: String },
    #[error("claim on {0} expired before its outcome was stored")]
    ClaimLost(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// A plan to register.
#[derive(Debug, Clone, Default)]
pub struct NewPlan {
    pub plan_id: String,
    pub image: String,
    pub active: bool,
    pub inputs: Vec<NewMountpoint>,
    pub outputs: Vec<NewMountpoint>,
    pub log: Option<NewMountpoint>,
}

#[derive(Debug, Clone, Default)]
pub struct NewMountpoint {
    pub path: String,
    pub tags: Vec<String>,
}

impl NewMountpoint {
    pub fn new(path: impl Into<String>, tags: &[&str]) -> Self {
        Self {
            path: path.into(),
            tags: tags.iter().map(|t| (*t).to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredPlan {
    pub plan_id: String,
    pub input_ids: Vec<i64>,
    pub output_ids: Vec<i64>,
}

#[derive(sqlx::FromRow)]
struct RunRow {
    run_id: String,
    plan_id: String,
    status: String,
    updated_at: i64,
    image: Option<String>,
    pseudo_name: Option<String>,
    active: bool,
    worker_name: Option<String>,
    exit_code: Option<i64>,
    exit_message: Option<String>,
}

#[derive(sqlx::FromRow)]
struct MountRow {
    mountpoint_id: i64,
    path: String,
    knit_id: String,
    volume_ref: String,
    is_log: bool,
}

impl MountRow {
    fn into_assignment(self) -> Assignment {
        Assignment {
            mountpoint_id: self.mountpoint_id,
            path: self.path,
            knit_id: Id::from_string(self.knit_id),
            volume_ref: self.volume_ref,
        }
    }
}

impl RunRow {
    fn into_run(self, inputs: Vec<MountRow>, outputs: Vec<MountRow>) -> Result<Run> {
        let status = parse_status(&self.status)?;
        let kind = match (self.image, self.pseudo_name) {
            (Some(image), None) => PlanKind::Image { image },
            (None, Some(name)) => PlanKind::Pseudo {
                name: PseudoPlanName(name),
            },
            _ => {
                return Err(StorageError::Corrupt(format!(
                    "plan {} is neither image based nor pseudo",
                    self.plan_id
                )))
            }
        };
        let exit = match (self.exit_code, self.exit_message) {
            (Some(code), Some(message)) => Some(RunExit {
                code: u8::try_from(code).map_err(|_| {
                    StorageError::Corrupt(format!("exit code {code} of run {}", self.run_id))
                })?,
                message,
            }),
            _ => None,
        };

        let (logs, outputs): (Vec<_>, Vec<_>) = outputs.into_iter().partition(|o| o.is_log);

        Ok(Run {
            id: Id::from_string(self.run_id),
            status,
            plan: PlanBody {
                plan_id: self.plan_id,
                active: self.active,
                kind,
            },
            worker_name: self.worker_name,
            inputs: inputs.into_iter().map(MountRow::into_assignment).collect(),
            outputs: outputs.into_iter().map(MountRow::into_assignment).collect(),
            log: logs.into_iter().next().map(MountRow::into_assignment),
            exit,
            updated_at: from_millis(self.updated_at),
        })
    }
}

#[derive(sqlx::FromRow)]
struct ClaimedRun {
    run_id: String,
    status: String,
}

/// A run held by this process until its lease expires.
#[derive(Debug)]
struct RunClaim {
    run_id: Id,
    status: RunStatus,
    claimed_at: i64,
    lease_until: i64,
}

#[derive(sqlx::FromRow)]
struct ClaimedAgent {
    name: String,
    knit_id: String,
    mode: String,
}

/// Storage backend for the loops.
#[derive(Debug, Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
    claim_lease: Duration,
}

impl Storage {
    /// Create a new storage instance with the given database path.
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Io(e.to_string()))?;
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        Ok(Self {
            pool,
            claim_lease: DEFAULT_CLAIM_LEASE,
        })
    }

    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    /// Run embedded migrations. Safe to run on every start.
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [include_str!("../migrations/0001_init.sql")];

        for migration_sql in migrations {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if let Err(e) = sqlx::query(trimmed).execute(&self.pool).await {
                    let msg = e.to_string();
                    if !msg.contains("duplicate column") && !msg.contains("already exists") {
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }

    // --- Plans and data ---

    /// Register an image based plan and nominate existing data to its
    /// inputs.
    pub async fn register_plan(&self, plan: &NewPlan) -> Result<RegisteredPlan> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO plans (plan_id, image, pseudo_name, active) VALUES (?, ?, NULL, ?)")
            .bind(&plan.plan_id)
            .bind(&plan.image)
            .bind(plan.active)
            .execute(&mut *tx)
            .await?;

        let mut input_ids = Vec::with_capacity(plan.inputs.len());
        for input in &plan.inputs {
            let input_id: i64 = sqlx::query_scalar(
                "INSERT INTO plan_inputs (plan_id, path) VALUES (?, ?) RETURNING input_id",
            )
            .bind(&plan.plan_id)
            .bind(&input.path)
            .fetch_one(&mut *tx)
            .await?;
            for tag in &input.tags {
                sqlx::query("INSERT OR IGNORE INTO input_tags (input_id, tag) VALUES (?, ?)")
                    .bind(input_id)
                    .bind(tag)
                    .execute(&mut *tx)
                    .await?;
            }
            nominate_for_input(&mut *tx, input_id).await?;
            input_ids.push(input_id);
        }

        let mut output_ids = Vec::with_capacity(plan.outputs.len() + 1);
        let outputs = plan.outputs.iter().map(|o| (o, false));
        for (output, is_log) in outputs.chain(plan.log.iter().map(|l| (l, true))) {
            let output_id: i64 = sqlx::query_scalar(
                "INSERT INTO plan_outputs (plan_id, path, is_log) VALUES (?, ?, ?) RETURNING output_id",
            )
            .bind(&plan.plan_id)
            .bind(&output.path)
            .bind(is_log)
            .fetch_one(&mut *tx)
            .await?;
            for tag in &output.tags {
                sqlx::query("INSERT OR IGNORE INTO output_tags (output_id, tag) VALUES (?, ?)")
                    .bind(output_id)
                    .bind(tag)
                    .execute(&mut *tx)
                    .await?;
            }
            output_ids.push(output_id);
        }

        tx.commit().await?;
        info!(plan_id = %plan.plan_id, inputs = input_ids.len(), "registered plan");
        Ok(RegisteredPlan {
            plan_id: plan.plan_id.clone(),
            input_ids,
            output_ids,
        })
    }

    /// Add a tag to data. Data of a finished run is nominated again.
    pub async fn tag_data(&self, knit_id: &Id, tag: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT OR IGNORE INTO data_tags (knit_id, tag) VALUES (?, ?)")
            .bind(knit_id.as_ref())
            .bind(tag)
            .execute(&mut *tx)
            .await?;

        let done: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM data d JOIN runs r ON r.run_id = d.run_id \
             WHERE d.knit_id = ? AND r.status = 'done'",
        )
        .bind(knit_id.as_ref())
        .fetch_optional(&mut *tx)
        .await?;
        if done.is_some() {
            nominate_data(&mut *tx, knit_id.as_ref()).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn add_data_agent(&self, agent: &DataAgent, lifecycle_suspend: Duration) -> Result<()> {
        sqlx::query(
            "INSERT INTO data_agents (name, knit_id, mode, lifecycle_suspend_until) VALUES (?, ?, ?, ?)",
        )
        .bind(&agent.name)
        .bind(agent.knit_id.as_ref())
        .bind(agent.mode.as_str())
        .bind(now_millis() + millis(lifecycle_suspend))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn add_garbage(&self, garbage: &Garbage) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO garbage (knit_id, volume_ref) VALUES (?, ?)")
            .bind(garbage.knit_id.as_ref())
            .bind(&garbage.volume_ref)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn garbage_count(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM garbage")
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn data_agent_names(&self) -> Result<Vec<String>> {
        Ok(
            sqlx::query_scalar("SELECT name FROM data_agents ORDER BY name")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    /// Runs of a plan, oldest first.
    pub async fn runs_of_plan(&self, plan_id: &str) -> Result<Vec<Id>> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT run_id FROM runs WHERE plan_id = ? ORDER BY run_id")
                .bind(plan_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(ids.into_iter().map(Id::from_string).collect())
    }

    /// Updated nominations not yet projected.
    pub async fn pending_nominations(&self) -> Result<Vec<(i64, Id)>> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT input_id, knit_id FROM nominations WHERE updated = 1 ORDER BY input_id, knit_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(input_id, knit_id)| (input_id, Id::from_string(knit_id)))
            .collect())
    }

    // --- Runs ---

    /// Set the status of a run outside the loops, e.g. abort on request.
    pub async fn set_status(&self, run_id: &Id, status: RunStatus) -> std::result::Result<(), LoopError> {
        let predecessors: Vec<RunStatus> = RunStatus::ALL
            .into_iter()
            .filter(|s| *s != status && s.can_transition_to(status))
            .collect();

        let mut tx = self.pool.begin().await.map_err(StorageError::from)?;
        let now = now_millis();
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE runs SET status = ");
        qb.push_bind(status.as_str());
        qb.push(", updated_at = ");
        qb.push_bind(now);
        qb.push(", lifecycle_suspend_until = ");
        qb.push_bind(now);
        qb.push(" WHERE run_id = ");
        qb.push_bind(run_id.as_ref());
        qb.push(" AND status IN (");
        {
            let mut separated = qb.separated(", ");
            for s in &predecessors {
                separated.push_bind(s.as_str());
            }
        }
        qb.push(")");

        let updated = if predecessors.is_empty() {
            0
        } else {
            qb.build()
                .execute(&mut *tx)
                .await
                .map_err(StorageError::from)?
                .rows_affected()
        };

        if updated == 0 {
            let current: Option<String> =
                sqlx::query_scalar("SELECT status FROM runs WHERE run_id = ?")
                    .bind(run_id.as_ref())
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(StorageError::from)?;
            let Some(current) = current else {
                return Err(StorageError::RunNotFound(run_id.to_string()).into());
            };
            let from = parse_status(&current)?;
            if from == status && !from.is_terminal() {
                return Ok(());
            }
            return Err(LoopError::InvalidTransition { from, to: status });
        }

        if status == RunStatus::Done {
            nominate_run_outputs(&mut *tx, run_id.as_ref()).await?;
        }
        tx.commit().await.map_err(StorageError::from)?;
        info!(run_id = %run_id, status = %status, "run status set");
        Ok(())
    }

    /// Claim one run matching `cursor`.
    async fn claim_run(&self, cursor: &RunCursor) -> Result<Option<RunClaim>> {
        if cursor.status.is_empty() || (cursor.pseudo_only && cursor.pseudo.is_empty()) {
            return Ok(None);
        }

        let now = now_millis();
        let lease_until = now + millis(self.claim_lease);
        let head = cursor.head.as_ref().map_or("", AsRef::as_ref);

        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE runs SET lifecycle_suspend_until = ");
        qb.push_bind(lease_until);
        qb.push(
            " WHERE run_id = (SELECT r.run_id FROM runs r JOIN plans p ON p.plan_id = r.plan_id \
             WHERE r.lifecycle_suspend_until <= ",
        );
        qb.push_bind(now);
        qb.push(" AND r.status IN (");
        {
            let mut separated = qb.separated(", ");
            for status in &cursor.status {
                separated.push_bind(status.as_str());
            }
        }
        qb.push(") AND (");
        qb.push(if cursor.pseudo_only {
            "0"
        } else {
            "p.pseudo_name IS NULL"
        });
        if !cursor.pseudo.is_empty() {
            qb.push(" OR p.pseudo_name IN (");
            let mut separated = qb.separated(", ");
            for name in &cursor.pseudo {
                separated.push_bind(name.as_str());
            }
            separated.push_unseparated(")");
        }
        qb.push(") ORDER BY r.run_id <= ");
        qb.push_bind(head);
        qb.push(", r.run_id LIMIT 1) RETURNING run_id, status");

        let claimed: Option<ClaimedRun> = qb.build_query_as().fetch_optional(&self.pool).await?;
        claimed
            .map(|c| {
                Ok(RunClaim {
                    status: parse_status(&c.status)?,
                    run_id: Id::from_string(c.run_id),
                    claimed_at: now,
                    lease_until,
                })
            })
            .transpose()
    }

    /// Store the outcome of a claimed run. Returns whether the status
    /// changed.
    async fn settle_run(
        &self,
        claim: &RunClaim,
        next: RunStatus,
        debounce: Duration,
    ) -> std::result::Result<bool, LoopError> {
        if !claim.status.can_transition_to(next) {
            return Err(LoopError::InvalidTransition {
                from: claim.status,
                to: next,
            });
        }

        let now = now_millis();
        let mut tx = self.pool.begin().await.map_err(StorageError::from)?;
        let changed = next != claim.status;
        let updated = if changed {
            sqlx::query(
                "UPDATE runs SET status = ?, updated_at = ?, lifecycle_suspend_until = ? \
                 WHERE run_id = ? AND status = ? AND lifecycle_suspend_until = ?",
            )
            .bind(next.as_str())
            .bind(now)
            .bind(now)
        } else {
            sqlx::query(
                "UPDATE runs SET lifecycle_suspend_until = ? \
                 WHERE run_id = ? AND status = ? AND lifecycle_suspend_until = ?",
            )
            .bind(now + millis(debounce))
        }
        .bind(claim.run_id.as_ref())
        .bind(claim.status.as_str())
        .bind(claim.lease_until)
        .execute(&mut *tx)
        .await
        .map_err(StorageError::from)?;

        if updated.rows_affected() == 0 {
            return Err(StorageError::ClaimLost(claim.run_id.to_string()).into());
        }
        if next == RunStatus::Done {
            nominate_run_outputs(&mut *tx, claim.run_id.as_ref()).await?;
        }
        tx.commit().await.map_err(StorageError::from)?;

        if changed {
            info!(run_id = %claim.run_id, from = %claim.status, to = %next, "run status changed");
        }
        Ok(changed)
    }

    /// Give a claimed run back, leaving it as it was.
    async fn release_run(&self, claim: &RunClaim) {
        let released = sqlx::query(
            "UPDATE runs SET lifecycle_suspend_until = ? \
             WHERE run_id = ? AND lifecycle_suspend_until = ?",
        )
        .bind(claim.claimed_at)
        .bind(claim.run_id.as_ref())
        .bind(claim.lease_until)
        .execute(&self.pool)
        .await;
        if let Err(e) = released {
            warn!(run_id = %claim.run_id, error = %e, "failed to release run; it stays claimed until the lease expires");
        }
    }
}

#[async_trait]
impl RunStore for Storage {
    async fn pick_and_set_status<'a>(
        &'a self,
        cursor: RunCursor,
        transition: Transition<'a>,
    ) -> std::result::Result<Picked<RunCursor>, PickError<RunCursor>> {
        let claim = match self.claim_run(&cursor).await {
            Ok(Some(claim)) => claim,
            Ok(None) => {
                return Ok(Picked {
                    cursor,
                    changed: false,
                })
            }
            Err(e) => {
                return Err(PickError {
                    cursor,
                    source: e.into(),
                })
            }
        };
        debug!(run_id = %claim.run_id, status = %claim.status, "picked run");
        let moved = cursor.moved_to(claim.run_id.clone());

        let outcome = match self.get(&claim.run_id).await {
            Ok(run) => transition(run).await,
            Err(e) => Err(e.into()),
        };
        let settled = match outcome {
            Ok(next) => self.settle_run(&claim, next, cursor.debounce).await,
            Err(e) => Err(e),
        };

        match settled {
            Ok(changed) => Ok(Picked {
                cursor: moved,
                changed,
            }),
            Err(source) => {
                self.release_run(&claim).await;
                Err(PickError {
                    cursor: moved,
                    source,
                })
            }
        }
    }

    async fn get(&self, run_id: &Id) -> Result<Run> {
        let mut conn = self.pool.acquire().await?;
        load_run(&mut conn, run_id.as_ref()).await
    }

    async fn set_exit(&self, run_id: &Id, exit: &RunExit) -> Result<()> {
        sqlx::query(
            "INSERT INTO run_exits (run_id, code, message) VALUES (?, ?, ?) \
             ON CONFLICT(run_id) DO UPDATE SET code = excluded.code, message = excluded.message",
        )
        .bind(run_id.as_ref())
        .bind(i64::from(exit.code))
        .bind(&exit.message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_worker(&self, run_id: &Id) -> Result<()> {
        sqlx::query("DELETE FROM workers WHERE run_id = ?")
            .bind(run_id.as_ref())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn project(&self) -> Result<Option<Projection>> {
        let mut tx = self.pool.begin().await?;

        // Clearing the flag first takes the write lock before anything is read.
        let claimed: Option<(i64, String)> = sqlx::query_as(
            "UPDATE nominations SET updated = 0 WHERE rowid = (\
                SELECT n.rowid FROM nominations n \
                JOIN plan_inputs i ON i.input_id = n.input_id \
                JOIN plans p ON p.plan_id = i.plan_id \
                WHERE n.updated = 1 AND p.image IS NOT NULL \
                ORDER BY n.input_id, n.knit_id LIMIT 1\
             ) RETURNING input_id, knit_id",
        )
        .fetch_optional(&mut *tx)
        .await?;
        let Some((trigger_input, trigger_knit)) = claimed else {
            return Ok(None);
        };

        let (plan_id, active): (String, bool) = sqlx::query_as(
            "SELECT p.plan_id, p.active FROM plan_inputs i \
             JOIN plans p ON p.plan_id = i.plan_id WHERE i.input_id = ?",
        )
        .bind(trigger_input)
        .fetch_one(&mut *tx)
        .await?;
        let trigger = ProjectionTrigger {
            plan_id: plan_id.clone(),
            input_id: trigger_input,
            knit_id: Id::from_string(trigger_knit.clone()),
        };

        let input_ids: Vec<i64> =
            sqlx::query_scalar("SELECT input_id FROM plan_inputs WHERE plan_id = ? ORDER BY input_id")
                .bind(&plan_id)
                .fetch_all(&mut *tx)
                .await?;

        let mut candidates: BTreeMap<i64, Vec<String>> = BTreeMap::new();
        for input_id in input_ids {
            if input_id == trigger_input {
                candidates.insert(input_id, vec![trigger_knit.clone()]);
                continue;
            }
            let known: Vec<String> = sqlx::query_scalar(
                "SELECT knit_id FROM nominations WHERE input_id = ? AND updated = 0 ORDER BY knit_id",
            )
            .bind(input_id)
            .fetch_all(&mut *tx)
            .await?;
            if known.is_empty() {
                // An input without data: nothing can run yet.
                tx.commit().await?;
                debug!(trigger = %trigger, input_id, "input has no data; nothing projected");
                return Ok(Some(Projection {
                    run_ids: Vec::new(),
                    trigger,
                }));
            }
            candidates.insert(input_id, known);
        }

        let performed = performed_assignments(&mut *tx, trigger_input, &trigger_knit).await?;
        let initial = if active {
            RunStatus::Waiting
        } else {
            RunStatus::Deactivated
        };

        let now = now_millis();
        let mut run_ids = Vec::new();
        for pattern in cartesian(&candidates) {
            if performed.contains(&pattern) {
                continue;
            }
            let run_id = Id::new();
            sqlx::query(
                "INSERT INTO runs (run_id, plan_id, status, updated_at, lifecycle_suspend_until) \
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(run_id.as_ref())
            .bind(&plan_id)
            .bind(initial.as_str())
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            complete_run(&mut *tx, &run_id, &plan_id, &pattern).await?;
            sqlx::query("INSERT OR IGNORE INTO workers (run_id, name) VALUES (?, ?)")
                .bind(run_id.as_ref())
                .bind(worker_name(&run_id))
                .execute(&mut *tx)
                .await?;
            run_ids.push(run_id);
        }

        tx.commit().await?;
        info!(trigger = %trigger, runs = run_ids.len(), "projected runs");
        Ok(Some(Projection { run_ids, trigger }))
    }

    async fn retry(&self, run_id: &Id) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let now = now_millis();
        let updated = sqlx::query(
            "UPDATE runs SET status = 'waiting', updated_at = ?, lifecycle_suspend_until = ? \
             WHERE run_id = ? AND status IN ('done', 'failed') \
             AND plan_id IN (SELECT plan_id FROM plans WHERE image IS NOT NULL) \
             AND NOT EXISTS (\
                SELECT 1 FROM assigns a JOIN data d ON d.knit_id = a.knit_id \
                WHERE d.run_id = runs.run_id)",
        )
        .bind(now)
        .bind(now)
        .bind(run_id.as_ref())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            let found: Option<(String, Option<String>)> = sqlx::query_as(
                "SELECT r.status, p.image FROM runs r JOIN plans p ON p.plan_id = r.plan_id \
                 WHERE r.run_id = ?",
            )
            .bind(run_id.as_ref())
            .fetch_optional(&mut *tx)
            .await?;
            let protected = |reason: &str| StorageError::RetryProtected {
                run_id: run_id.to_string(),
                reason: reason.to_string(),
            };
            return Err(match found {
                None => StorageError::RunNotFound(run_id.to_string()),
                Some((status, _)) if status == RunStatus::Invalidated.as_str() => {
                    StorageError::RunNotFound(run_id.to_string())
                }
                Some((status, _)) if status != "done" && status != "failed" => {
                    protected(&format!("run is {status}"))
                }
                Some((_, None)) => protected("run is not image based"),
                Some(_) => protected("outputs are used by downstream runs"),
            });
        }

        sqlx::query("DELETE FROM run_exits WHERE run_id = ?")
            .bind(run_id.as_ref())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM nominations WHERE knit_id IN (SELECT knit_id FROM data WHERE run_id = ?)")
            .bind(run_id.as_ref())
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT OR IGNORE INTO workers (run_id, name) VALUES (?, ?)")
            .bind(run_id.as_ref())
            .bind(worker_name(run_id))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        info!(run_id = %run_id, "run retried");
        Ok(())
    }

    async fn new_pseudo(&self, name: &PseudoPlanName, lifecycle_suspend: Duration) -> Result<Id> {
        let mut tx = self.pool.begin().await?;
        let run_id = Id::new();
        let now = now_millis();

        let plan_id: Option<String> = sqlx::query_scalar(
            "INSERT INTO runs (run_id, plan_id, status, updated_at, lifecycle_suspend_until) \
             SELECT ?, plan_id, 'running', ?, ? FROM plans WHERE pseudo_name = ? \
             RETURNING plan_id",
        )
        .bind(run_id.as_ref())
        .bind(now)
        .bind(now + millis(lifecycle_suspend))
        .bind(name.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        let Some(plan_id) = plan_id else {
            return Err(StorageError::PlanNotFound(name.to_string()));
        };

        complete_run(&mut *tx, &run_id, &plan_id, &BTreeMap::new()).await?;
        tx.commit().await?;
        info!(run_id = %run_id, plan = %name, "registered pseudo run");
        Ok(run_id)
    }
}

#[async_trait]
impl DataStore for Storage {
    async fn agent_names(&self, knit_id: &Id, mode: DataAgentMode) -> Result<Vec<String>> {
        Ok(sqlx::query_scalar(
            "SELECT name FROM data_agents WHERE knit_id = ? AND mode = ? ORDER BY name",
        )
        .bind(knit_id.as_ref())
        .bind(mode.as_str())
        .fetch_all(&self.pool)
        .await?)
    }

    async fn pick_and_remove_agent<'a>(
        &'a self,
        cursor: DataAgentCursor,
        decide: AgentDecision<'a>,
    ) -> std::result::Result<DataAgentCursor, PickError<DataAgentCursor>> {
        let now = now_millis();
        let lease_until = now + millis(self.claim_lease);
        let head = cursor.head.clone().unwrap_or_default();

        let claimed: std::result::Result<Option<ClaimedAgent>, sqlx::Error> = sqlx::query_as(
            "UPDATE data_agents SET lifecycle_suspend_until = ? WHERE name = (\
                SELECT name FROM data_agents WHERE lifecycle_suspend_until <= ? \
                ORDER BY name <= ?, name LIMIT 1\
             ) RETURNING name, knit_id, mode",
        )
        .bind(lease_until)
        .bind(now)
        .bind(&head)
        .fetch_optional(&self.pool)
        .await;

        let claimed = match claimed {
            Ok(Some(claimed)) => claimed,
            Ok(None) => return Ok(cursor),
            Err(e) => {
                return Err(PickError {
                    cursor,
                    source: StorageError::from(e).into(),
                })
            }
        };
        let moved = DataAgentCursor {
            head: Some(claimed.name.clone()),
            debounce: cursor.debounce,
        };
        let mode = match claimed.mode.parse::<DataAgentMode>() {
            Ok(mode) => mode,
            Err(e) => {
                return Err(PickError {
                    cursor: moved,
                    source: StorageError::Corrupt(e.to_string()).into(),
                })
            }
        };
        let agent = DataAgent {
            name: claimed.name.clone(),
            mode,
            knit_id: Id::from_string(claimed.knit_id),
        };

        let settled = match decide(agent).await {
            Ok(true) => sqlx::query(
                "DELETE FROM data_agents WHERE name = ? AND lifecycle_suspend_until = ?",
            )
            .bind(&claimed.name)
            .bind(lease_until)
            .execute(&self.pool)
            .await
            .map_err(|e| LoopError::from(StorageError::from(e))),
            Ok(false) => sqlx::query(
                "UPDATE data_agents SET lifecycle_suspend_until = ? \
                 WHERE name = ? AND lifecycle_suspend_until = ?",
            )
            .bind(now_millis() + millis(cursor.debounce))
            .bind(&claimed.name)
            .bind(lease_until)
            .execute(&self.pool)
            .await
            .map_err(|e| LoopError::from(StorageError::from(e))),
            Err(e) => Err(e),
        };

        match settled {
            Ok(_) => Ok(moved),
            Err(source) => {
                let released = sqlx::query(
                    "UPDATE data_agents SET lifecycle_suspend_until = ? \
                     WHERE name = ? AND lifecycle_suspend_until = ?",
                )
                .bind(now)
                .bind(&claimed.name)
                .bind(lease_until)
                .execute(&self.pool)
                .await;
                if let Err(e) = released {
                    warn!(agent = %claimed.name, error = %e, "failed to release data agent");
                }
                Err(PickError {
                    cursor: moved,
                    source,
                })
            }
        }
    }
}

#[async_trait]
impl GarbageStore for Storage {
    async fn pop<'a>(&'a self, sweep: Sweep<'a>) -> std::result::Result<bool, LoopError> {
        let now = now_millis();
        let lease_until = now + millis(self.claim_lease);
        let claimed: Option<(String, String)> = sqlx::query_as(
            "UPDATE garbage SET claimed_until = ? WHERE knit_id = (\
                SELECT knit_id FROM garbage WHERE claimed_until <= ? ORDER BY knit_id LIMIT 1\
             ) RETURNING knit_id, volume_ref",
        )
        .bind(lease_until)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::from)?;

        let Some((knit_id, volume_ref)) = claimed else {
            return Ok(false);
        };
        let garbage = Garbage {
            knit_id: Id::from_string(knit_id.clone()),
            volume_ref,
        };

        if let Err(e) = sweep(garbage).await {
            let released = sqlx::query(
                "UPDATE garbage SET claimed_until = 0 WHERE knit_id = ? AND claimed_until = ?",
            )
            .bind(&knit_id)
            .bind(lease_until)
            .execute(&self.pool)
            .await;
            if let Err(release_err) = released {
                warn!(knit_id = %knit_id, error = %release_err, "failed to release garbage");
            }
            return Err(e);
        }

        sqlx::query("DELETE FROM garbage WHERE knit_id = ? AND claimed_until = ?")
            .bind(&knit_id)
            .bind(lease_until)
            .execute(&self.pool)
            .await
            .map_err(StorageError::from)?;
        Ok(true)
    }
}

// --- helpers ---

pub fn worker_name(run_id: &Id) -> String {
    format!("worker-run-{run_id}")
}

pub fn volume_ref(knit_id: &Id) -> String {
    format!("data-knitid-{knit_id}")
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn parse_status(s: &str) -> Result<RunStatus> {
    s.parse().map_err(|e: knit_core::UnknownVariant| StorageError::Corrupt(e.to_string()))
}

async fn load_run(conn: &mut SqliteConnection, run_id: &str) -> Result<Run> {
    let sql = format!("SELECT {RUNS_COLUMNS} {RUNS_FROM} WHERE r.run_id = ?");
    let row: Option<RunRow> = sqlx::query_as(&sql)
        .bind(run_id)
        .fetch_optional(&mut *conn)
        .await?;
    let Some(row) = row else {
        return Err(StorageError::RunNotFound(run_id.to_string()));
    };

    let inputs: Vec<MountRow> = sqlx::query_as(
        "SELECT a.input_id AS mountpoint_id, i.path, a.knit_id, d.volume_ref, 0 AS is_log \
         FROM assigns a \
         JOIN plan_inputs i ON i.input_id = a.input_id \
         JOIN data d ON d.knit_id = a.knit_id \
         WHERE a.run_id = ? ORDER BY a.input_id",
    )
    .bind(run_id)
    .fetch_all(&mut *conn)
    .await?;

    let outputs: Vec<MountRow> = sqlx::query_as(
        "SELECT o.output_id AS mountpoint_id, o.path, d.knit_id, d.volume_ref, o.is_log \
         FROM data d JOIN plan_outputs o ON o.output_id = d.output_id \
         WHERE d.run_id = ? ORDER BY o.output_id",
    )
    .bind(run_id)
    .fetch_all(&mut *conn)
    .await?;

    row.into_run(inputs, outputs)
}

/// Record assignments and create output data of a freshly inserted run.
async fn complete_run(
    conn: &mut SqliteConnection,
    run_id: &Id,
    plan_id: &str,
    inputs: &BTreeMap<i64, String>,
) -> Result<()> {
    for (input_id, knit_id) in inputs {
        sqlx::query("INSERT INTO assigns (run_id, input_id, knit_id) VALUES (?, ?, ?)")
            .bind(run_id.as_ref())
            .bind(input_id)
            .bind(knit_id)
            .execute(&mut *conn)
            .await?;
    }

    let output_ids: Vec<i64> =
        sqlx::query_scalar("SELECT output_id FROM plan_outputs WHERE plan_id = ? ORDER BY output_id")
            .bind(plan_id)
            .fetch_all(&mut *conn)
            .await?;
    for output_id in output_ids {
        let knit_id = Id::new();
        sqlx::query("INSERT INTO data (knit_id, run_id, output_id, volume_ref) VALUES (?, ?, ?, ?)")
            .bind(knit_id.as_ref())
            .bind(run_id.as_ref())
            .bind(output_id)
            .bind(volume_ref(&knit_id))
            .execute(&mut *conn)
            .await?;
        sqlx::query("INSERT INTO data_tags (knit_id, tag) SELECT ?, tag FROM output_tags WHERE output_id = ?")
            .bind(knit_id.as_ref())
            .bind(output_id)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

/// Assignments of runs that already consumed the triggering data.
async fn performed_assignments(
    conn: &mut SqliteConnection,
    input_id: i64,
    knit_id: &str,
) -> Result<HashSet<BTreeMap<i64, String>>> {
    let rows: Vec<(String, i64, String)> = sqlx::query_as(
        "SELECT run_id, input_id, knit_id FROM assigns WHERE run_id IN (\
            SELECT run_id FROM assigns WHERE input_id = ? AND knit_id = ?)",
    )
    .bind(input_id)
    .bind(knit_id)
    .fetch_all(&mut *conn)
    .await?;

    let mut by_run: HashMap<String, BTreeMap<i64, String>> = HashMap::new();
    for (run_id, input_id, knit_id) in rows {
        by_run.entry(run_id).or_default().insert(input_id, knit_id);
    }
    Ok(by_run.into_values().collect())
}

/// Every way to pick one data item per input.
fn cartesian(candidates: &BTreeMap<i64, Vec<String>>) -> Vec<BTreeMap<i64, String>> {
    candidates
        .iter()
        .fold(vec![BTreeMap::new()], |partials, (input_id, knit_ids)| {
            partials
                .iter()
                .flat_map(|partial| {
                    knit_ids.iter().map(move |knit_id| {
                        let mut next = partial.clone();
                        next.insert(*input_id, knit_id.clone());
                        next
                    })
                })
                .collect()
        })
}

/// Nominate `knit_id` to every image plan input whose tags it carries.
async fn nominate_data(conn: &mut SqliteConnection, knit_id: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO nominations (input_id, knit_id, updated) \
         SELECT i.input_id, ?, 1 FROM plan_inputs i \
         JOIN plans p ON p.plan_id = i.plan_id \
         WHERE p.image IS NOT NULL \
         AND EXISTS (SELECT 1 FROM input_tags it WHERE it.input_id = i.input_id) \
         AND NOT EXISTS (\
            SELECT 1 FROM input_tags it WHERE it.input_id = i.input_id \
            AND it.tag NOT IN (SELECT dt.tag FROM data_tags dt WHERE dt.knit_id = ?)) \
         ON CONFLICT(input_id, knit_id) DO UPDATE SET updated = 1",
    )
    .bind(knit_id)
    .bind(knit_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn nominate_run_outputs(conn: &mut SqliteConnection, run_id: &str) -> Result<()> {
    let knit_ids: Vec<String> = sqlx::query_scalar("SELECT knit_id FROM data WHERE run_id = ?")
        .bind(run_id)
        .fetch_all(&mut *conn)
        .await?;
    for knit_id in knit_ids {
        nominate_data(conn, &knit_id).await?;
    }
    Ok(())
}

/// Nominate data of finished runs to a new input.
async fn nominate_for_input(conn: &mut SqliteConnection, input_id: i64) -> Result<()> {
    sqlx::query(
        "INSERT INTO nominations (input_id, knit_id, updated) \
         SELECT ?, d.knit_id, 1 FROM data d JOIN runs r ON r.run_id = d.run_id \
         WHERE r.status = 'done' \
         AND EXISTS (SELECT 1 FROM input_tags it WHERE it.input_id = ?) \
         AND NOT EXISTS (\
            SELECT 1 FROM input_tags it WHERE it.input_id = ? \
            AND it.tag NOT IN (SELECT dt.tag FROM data_tags dt WHERE dt.knit_id = d.knit_id)) \
         ON CONFLICT(input_id, knit_id) DO NOTHING",
    )
    .bind(input_id)
    .bind(input_id)
    .bind(input_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use tempfile::TempDir;

    struct TestStorage {
        storage: Storage,
        _dir: TempDir,
    }

    async fn create_test_storage() -> TestStorage {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("test.db");
        let storage = Storage::new(&db_path).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        TestStorage {
            storage,
            _dir: dir,
        }
    }

    fn train_plan(plan_id: &str, active: bool) -> NewPlan {
        NewPlan {
            plan_id: plan_id.to_string(),
            image: "repo/train:1.0".to_string(),
            active,
            inputs: vec![NewMountpoint::new("/in/dataset", &["type:dataset"])],
            outputs: vec![NewMountpoint::new("/out/model", &["type:model"])],
            log: Some(NewMountpoint::new("/log", &["type:log"])),
        }
    }

    /// Upload data carrying `tags` and finish its run.
    async fn uploaded(storage: &Storage, tags: &[&str]) -> Id {
        let run_id = storage
            .new_pseudo(&PseudoPlanName::uploaded(), Duration::ZERO)
            .await
            .unwrap();
        let run = storage.get(&run_id).await.unwrap();
        let knit_id = run.outputs[0].knit_id.clone();
        for tag in tags {
            storage.tag_data(&knit_id, tag).await.unwrap();
        }
        storage
            .set_status(&run_id, RunStatus::Completing)
            .await
            .unwrap();
        storage.set_status(&run_id, RunStatus::Done).await.unwrap();
        knit_id
    }

    fn cursor(status: &[RunStatus]) -> RunCursor {
        RunCursor {
            status: status.to_vec(),
            ..RunCursor::default()
        }
    }

    fn to<'a>(status: RunStatus) -> Transition<'a> {
        Box::new(move |_run| async move { Ok::<_, LoopError>(status) }.boxed())
    }

    #[tokio::test]
    async fn migrations_are_idempotent_and_seed_pseudo_plans() {
        let ts = create_test_storage().await;
        ts.storage.migrate_embedded().await.unwrap();

        let uploaded = ts
            .storage
            .new_pseudo(&PseudoPlanName::uploaded(), Duration::ZERO)
            .await
            .unwrap();
        let run = ts.storage.get(&uploaded).await.unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.plan.pseudo_name(), Some(&PseudoPlanName::uploaded()));
        assert_eq!(run.outputs.len(), 1);
        assert!(run.worker_name.is_none());
        assert_eq!(run.outputs[0].volume_ref, volume_ref(&run.outputs[0].knit_id));
    }

    #[tokio::test]
    async fn new_pseudo_rejects_unknown_plans() {
        let ts = create_test_storage().await;
        let err = ts
            .storage
            .new_pseudo(&PseudoPlanName("knit#mystery".to_string()), Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::PlanNotFound(_)));
    }

    #[tokio::test]
    async fn finishing_upload_nominates_matching_inputs() {
        let ts = create_test_storage().await;
        let plan = ts.storage.register_plan(&train_plan("plan-train", true)).await.unwrap();

        let untagged = uploaded(&ts.storage, &["type:other"]).await;
        let tagged = uploaded(&ts.storage, &["type:dataset", "owner:alice"]).await;

        let pending = ts.storage.pending_nominations().await.unwrap();
        assert_eq!(pending, vec![(plan.input_ids[0], tagged.clone())]);
        assert!(!pending.iter().any(|(_, k)| *k == untagged));
    }

    #[tokio::test]
    async fn projection_creates_waiting_runs_with_outputs_and_worker() {
        let ts = create_test_storage().await;
        ts.storage.register_plan(&train_plan("plan-train", true)).await.unwrap();
        let knit_id = uploaded(&ts.storage, &["type:dataset"]).await;

        let projection = ts.storage.project().await.unwrap().unwrap();
        assert_eq!(projection.trigger.knit_id, knit_id);
        assert_eq!(projection.run_ids.len(), 1);

        let run = ts.storage.get(&projection.run_ids[0]).await.unwrap();
        assert_eq!(run.status, RunStatus::Waiting);
        assert_eq!(run.inputs.len(), 1);
        assert_eq!(run.inputs[0].knit_id, knit_id);
        assert_eq!(run.outputs.len(), 1);
        assert_eq!(run.outputs[0].path, "/out/model");
        assert_eq!(run.log.as_ref().map(|l| l.path.as_str()), Some("/log"));
        assert_eq!(run.worker_name, Some(worker_name(&run.id)));

        // the nomination is consumed
        assert!(ts.storage.project().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn projection_of_deactivated_plan_creates_deactivated_runs() {
        let ts = create_test_storage().await;
        ts.storage.register_plan(&train_plan("plan-idle", false)).await.unwrap();
        uploaded(&ts.storage, &["type:dataset"]).await;

        let projection = ts.storage.project().await.unwrap().unwrap();
        let run = ts.storage.get(&projection.run_ids[0]).await.unwrap();
        assert_eq!(run.status, RunStatus::Deactivated);
    }

    #[tokio::test]
    async fn projection_waits_for_every_input_and_never_repeats_a_combination() {
        let ts = create_test_storage().await;
        let plan = NewPlan {
            plan_id: "plan-join".to_string(),
            image: "repo/join:1".to_string(),
            active: true,
            inputs: vec![
                NewMountpoint::new("/in/left", &["side:left"]),
                NewMountpoint::new("/in/right", &["side:right"]),
            ],
            outputs: vec![NewMountpoint::new("/out", &[])],
            log: None,
        };
        ts.storage.register_plan(&plan).await.unwrap();

        uploaded(&ts.storage, &["side:left"]).await;
        let first = ts.storage.project().await.unwrap().unwrap();
        assert!(first.run_ids.is_empty(), "right input has no data yet");

        uploaded(&ts.storage, &["side:right"]).await;
        let second = ts.storage.project().await.unwrap().unwrap();
        assert_eq!(second.run_ids.len(), 1);

        uploaded(&ts.storage, &["side:left"]).await;
        let third = ts.storage.project().await.unwrap().unwrap();
        // new left data pairs with the only right data
        assert_eq!(third.run_ids.len(), 1);
        assert!(ts.storage.project().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pick_moves_status_and_cursor() {
        let ts = create_test_storage().await;
        ts.storage.register_plan(&train_plan("plan-train", true)).await.unwrap();
        uploaded(&ts.storage, &["type:dataset"]).await;
        let run_id = ts.storage.project().await.unwrap().unwrap().run_ids[0].clone();

        let picked = ts
            .storage
            .pick_and_set_status(cursor(&[RunStatus::Waiting]), to(RunStatus::Ready))
            .await
            .unwrap();
        assert!(picked.changed);
        assert_eq!(picked.cursor.head, Some(run_id.clone()));
        assert_eq!(ts.storage.get(&run_id).await.unwrap().status, RunStatus::Ready);

        // nothing waiting any more
        let idle = ts
            .storage
            .pick_and_set_status(picked.cursor.clone(), to(RunStatus::Ready))
            .await
            .unwrap();
        assert!(!idle.changed);
        assert_eq!(idle.cursor, picked.cursor);
    }

    #[tokio::test]
    async fn failed_transition_stores_nothing() {
        let ts = create_test_storage().await;
        ts.storage.register_plan(&train_plan("plan-train", true)).await.unwrap();
        uploaded(&ts.storage, &["type:dataset"]).await;
        let run_id = ts.storage.project().await.unwrap().unwrap().run_ids[0].clone();

        let failing: Transition<'_> = Box::new(|_run| {
            async { Err(LoopError::Assertion("nope".into())) }.boxed()
        });
        let err = ts
            .storage
            .pick_and_set_status(cursor(&[RunStatus::Waiting]), failing)
            .await
            .unwrap_err();
        assert_eq!(err.cursor.head, Some(run_id.clone()));
        assert!(matches!(err.source, LoopError::Assertion(_)));

        let run = ts.storage.get(&run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Waiting);

        // released: the run can be picked right away
        let picked = ts
            .storage
            .pick_and_set_status(cursor(&[RunStatus::Waiting]), to(RunStatus::Ready))
            .await
            .unwrap();
        assert!(picked.changed);
    }

    #[tokio::test]
    async fn invalid_transition_is_rejected() {
        let ts = create_test_storage().await;
        ts.storage.register_plan(&train_plan("plan-train", true)).await.unwrap();
        uploaded(&ts.storage, &["type:dataset"]).await;
        let run_id = ts.storage.project().await.unwrap().unwrap().run_ids[0].clone();

        let err = ts
            .storage
            .pick_and_set_status(cursor(&[RunStatus::Waiting]), to(RunStatus::Done))
            .await
            .unwrap_err();
        assert!(matches!(
            err.source,
            LoopError::InvalidTransition {
                from: RunStatus::Waiting,
                to: RunStatus::Done
            }
        ));
        assert_eq!(ts.storage.get(&run_id).await.unwrap().status, RunStatus::Waiting);
    }

    #[tokio::test]
    async fn unchanged_status_is_debounced() {
        let ts = create_test_storage().await;
        ts.storage.register_plan(&train_plan("plan-train", true)).await.unwrap();
        uploaded(&ts.storage, &["type:dataset"]).await;
        ts.storage.project().await.unwrap();

        let debounced = RunCursor {
            debounce: Duration::from_secs(60),
            ..cursor(&[RunStatus::Waiting])
        };
        let first = ts
            .storage
            .pick_and_set_status(debounced.clone(), to(RunStatus::Waiting))
            .await
            .unwrap();
        assert!(!first.changed);
        assert!(first.cursor.head.is_some());

        let second = ts
            .storage
            .pick_and_set_status(debounced.clone(), to(RunStatus::Ready))
            .await
            .unwrap();
        assert_eq!(second.cursor, debounced, "debounced run must not be picked");
    }

    #[tokio::test]
    async fn pick_prefers_runs_after_head_then_wraps() {
        let ts = create_test_storage().await;
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(
                ts.storage
                    .new_pseudo(&PseudoPlanName::imported(), Duration::ZERO)
                    .await
                    .unwrap(),
            );
        }
        let mut cursor = RunCursor {
            status: vec![RunStatus::Running],
            pseudo: vec![PseudoPlanName::imported()],
            pseudo_only: true,
            ..RunCursor::default()
        };

        ids.sort();
        let mut seen = Vec::new();
        for _ in 0..4 {
            let picked = ts
                .storage
                .pick_and_set_status(cursor.clone(), to(RunStatus::Running))
                .await
                .unwrap();
            cursor = picked.cursor;
            seen.push(cursor.head.clone().unwrap());
        }
        assert_eq!(seen, vec![ids[0].clone(), ids[1].clone(), ids[2].clone(), ids[0].clone()]);
    }

    #[tokio::test]
    async fn pseudo_filter_excludes_other_plans() {
        let ts = create_test_storage().await;
        ts.storage
            .new_pseudo(&PseudoPlanName::uploaded(), Duration::ZERO)
            .await
            .unwrap();

        let imported_only = RunCursor {
            status: vec![RunStatus::Running],
            pseudo: vec![PseudoPlanName::imported()],
            ..RunCursor::default()
        };
        let picked = ts
            .storage
            .pick_and_set_status(imported_only.clone(), to(RunStatus::Aborting))
            .await
            .unwrap();
        assert_eq!(picked.cursor, imported_only);
    }

    #[tokio::test]
    async fn suspended_pseudo_runs_are_left_alone() {
        let ts = create_test_storage().await;
        ts.storage
            .new_pseudo(&PseudoPlanName::uploaded(), Duration::from_secs(600))
            .await
            .unwrap();
        let cursor = RunCursor {
            status: vec![RunStatus::Running],
            pseudo: vec![PseudoPlanName::uploaded()],
            ..RunCursor::default()
        };
        let picked = ts
            .storage
            .pick_and_set_status(cursor.clone(), to(RunStatus::Aborting))
            .await
            .unwrap();
        assert!(!picked.changed);
        assert_eq!(picked.cursor, cursor);
    }

    #[tokio::test]
    async fn exit_and_worker_bookkeeping() {
        let ts = create_test_storage().await;
        ts.storage.register_plan(&train_plan("plan-train", true)).await.unwrap();
        uploaded(&ts.storage, &["type:dataset"]).await;
        let run_id = ts.storage.project().await.unwrap().unwrap().run_ids[0].clone();

        let exit = RunExit {
            code: 1,
            message: "OOMKilled".to_string(),
        };
        ts.storage.set_exit(&run_id, &exit).await.unwrap();
        let overwritten = RunExit {
            code: 254,
            message: "worker for the run is not found".to_string(),
        };
        ts.storage.set_exit(&run_id, &overwritten).await.unwrap();
        ts.storage.delete_worker(&run_id).await.unwrap();
        ts.storage.delete_worker(&run_id).await.unwrap();

        let run = ts.storage.get(&run_id).await.unwrap();
        assert_eq!(run.exit, Some(overwritten));
        assert!(run.worker_name.is_none());
    }

    #[tokio::test]
    async fn retry_rules() {
        let ts = create_test_storage().await;
        ts.storage.register_plan(&train_plan("plan-train", true)).await.unwrap();
        uploaded(&ts.storage, &["type:dataset"]).await;
        let run_id = ts.storage.project().await.unwrap().unwrap().run_ids[0].clone();

        // not finished yet
        assert!(matches!(
            ts.storage.retry(&run_id).await.unwrap_err(),
            StorageError::RetryProtected { .. }
        ));

        for status in [RunStatus::Ready, RunStatus::Running, RunStatus::Aborting, RunStatus::Failed] {
            ts.storage.set_status(&run_id, status).await.unwrap();
        }
        ts.storage
            .set_exit(&run_id, &RunExit { code: 1, message: "failed".into() })
            .await
            .unwrap();
        ts.storage.delete_worker(&run_id).await.unwrap();

        ts.storage.retry(&run_id).await.unwrap();
        let run = ts.storage.get(&run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Waiting);
        assert!(run.exit.is_none());
        assert_eq!(run.worker_name, Some(worker_name(&run_id)));

        // pseudo runs are never retried
        let upload = ts
            .storage
            .new_pseudo(&PseudoPlanName::uploaded(), Duration::ZERO)
            .await
            .unwrap();
        ts.storage.set_status(&upload, RunStatus::Aborting).await.unwrap();
        ts.storage.set_status(&upload, RunStatus::Failed).await.unwrap();
        assert!(matches!(
            ts.storage.retry(&upload).await.unwrap_err(),
            StorageError::RetryProtected { .. }
        ));

        assert!(matches!(
            ts.storage.retry(&Id::from_string("no-such-run")).await.unwrap_err(),
            StorageError::RunNotFound(_)
        ));
    }

    #[tokio::test]
    async fn retry_is_refused_when_outputs_have_downstream_runs() {
        let ts = create_test_storage().await;
        ts.storage.register_plan(&train_plan("plan-train", true)).await.unwrap();
        ts.storage
            .register_plan(&NewPlan {
                plan_id: "plan-eval".to_string(),
                image: "repo/eval:1".to_string(),
                active: true,
                inputs: vec![NewMountpoint::new("/in/model", &["type:model"])],
                outputs: vec![NewMountpoint::new("/out", &[])],
                log: None,
            })
            .await
            .unwrap();
        uploaded(&ts.storage, &["type:dataset"]).await;
        let train = ts.storage.project().await.unwrap().unwrap().run_ids[0].clone();
        for status in [RunStatus::Ready, RunStatus::Running, RunStatus::Completing, RunStatus::Done] {
            ts.storage.set_status(&train, status).await.unwrap();
        }
        let eval = ts.storage.project().await.unwrap().unwrap();
        assert_eq!(eval.run_ids.len(), 1);

        assert!(matches!(
            ts.storage.retry(&train).await.unwrap_err(),
            StorageError::RetryProtected { .. }
        ));
    }

    #[tokio::test]
    async fn set_status_validates_transitions() {
        let ts = create_test_storage().await;
        let run_id = ts
            .storage
            .new_pseudo(&PseudoPlanName::imported(), Duration::ZERO)
            .await
            .unwrap();
        ts.storage.set_status(&run_id, RunStatus::Running).await.unwrap();
        assert!(matches!(
            ts.storage.set_status(&run_id, RunStatus::Waiting).await,
            Err(LoopError::InvalidTransition { .. })
        ));
        ts.storage.set_status(&run_id, RunStatus::Aborting).await.unwrap();
        ts.storage.set_status(&run_id, RunStatus::Failed).await.unwrap();
        assert!(matches!(
            ts.storage.set_status(&run_id, RunStatus::Failed).await,
            Err(LoopError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn data_agents_are_picked_and_removed_on_request() {
        let ts = create_test_storage().await;
        let knit_id = Id::from_string("knit-1");
        for (name, mode) in [("agent-a", DataAgentMode::Read), ("agent-b", DataAgentMode::Write)] {
            ts.storage
                .add_data_agent(
                    &DataAgent {
                        name: name.to_string(),
                        mode,
                        knit_id: knit_id.clone(),
                    },
                    Duration::ZERO,
                )
                .await
                .unwrap();
        }
        assert_eq!(
            ts.storage.agent_names(&knit_id, DataAgentMode::Write).await.unwrap(),
            vec!["agent-b"]
        );

        let keep: AgentDecision<'_> = Box::new(|_| async { Ok::<_, LoopError>(false) }.boxed());
        let cursor = DataAgentCursor {
            head: None,
            debounce: Duration::from_secs(60),
        };
        let cursor = ts.storage.pick_and_remove_agent(cursor, keep).await.unwrap();
        assert_eq!(cursor.head.as_deref(), Some("agent-a"));

        let remove: AgentDecision<'_> = Box::new(|agent| {
            async move { Ok::<_, LoopError>(agent.mode == DataAgentMode::Write) }.boxed()
        });
        let cursor = ts.storage.pick_and_remove_agent(cursor, remove).await.unwrap();
        assert_eq!(cursor.head.as_deref(), Some("agent-b"));
        assert_eq!(ts.storage.data_agent_names().await.unwrap(), vec!["agent-a"]);

        // agent-a is debounced, so nothing is picked
        let never: AgentDecision<'_> = Box::new(|_| async { Ok::<_, LoopError>(true) }.boxed());
        let unchanged = ts.storage.pick_and_remove_agent(cursor.clone(), never).await.unwrap();
        assert_eq!(unchanged, cursor);
    }

    #[tokio::test]
    async fn garbage_is_kept_when_sweep_fails() {
        let ts = create_test_storage().await;
        ts.storage
            .add_garbage(&Garbage {
                knit_id: Id::from_string("knit-1"),
                volume_ref: "data-knitid-knit-1".to_string(),
            })
            .await
            .unwrap();

        let failing: Sweep<'_> = Box::new(|_| {
            async { Err(LoopError::Assertion("api down".into())) }.boxed()
        });
        assert!(ts.storage.pop(failing).await.is_err());
        assert_eq!(ts.storage.garbage_count().await.unwrap(), 1);

        let ok: Sweep<'_> = Box::new(|g| {
            async move {
                assert_eq!(g.volume_ref, "data-knitid-knit-1");
                Ok::<_, LoopError>(())
            }
            .boxed()
        });
        assert!(ts.storage.pop(ok).await.unwrap());
        assert_eq!(ts.storage.garbage_count().await.unwrap(), 0);

        let empty: Sweep<'_> = Box::new(|_| async { Ok::<_, LoopError>(()) }.boxed());
        assert!(!ts.storage.pop(empty).await.unwrap());
    }

    #[test]
    fn cartesian_product_covers_every_combination() {
        let mut candidates = BTreeMap::new();
        candidates.insert(1, vec!["a".to_string(), "b".to_string()]);
        candidates.insert(2, vec!["x".to_string(), "y".to_string(), "z".to_string()]);
        let product = cartesian(&candidates);
        assert_eq!(product.len(), 6);
        assert!(product.iter().all(|p| p.len() == 2));
    }
}
