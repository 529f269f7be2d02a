//! Per-workload decision of a run's next status.
//!
//! Image based runs are driven by the state of their worker. Pseudo plan
//! runs have no worker; a manager per pseudo plan name decides for them.

mod image;
mod imported;
mod uploaded;

pub use image::ImageManager;
pub use uploaded::UploadedManager;

use crate::error::Result;
use crate::hook::{Hook, StartingHookResponse};
use knit_core::{PlanKind, PseudoPlanName, Run, RunStatus};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug)]
pub enum Manager {
    Image(ImageManager),
    /// Runs of data imported from outside. They may stay running only
    /// while their lifecycle is suspended.
    Imported,
    Uploaded(UploadedManager),
}

impl Manager {
    pub async fn manage(
        &self,
        hook: &dyn Hook<StartingHookResponse>,
        run: &Run,
    ) -> Result<RunStatus> {
        match self {
            Self::Image(m) => m.manage(hook, run).await,
            Self::Imported => imported::manage(hook, run).await,
            Self::Uploaded(m) => m.manage(hook, run).await,
        }
    }
}

/// Managers for every plan kind.
#[derive(Debug)]
pub struct ManagerTable {
    image: Manager,
    pseudo: HashMap<PseudoPlanName, Manager>,
}

impl ManagerTable {
    pub fn new(image: ImageManager) -> Self {
        Self {
            image: Manager::Image(image),
            pseudo: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_pseudo(mut self, name: PseudoPlanName, manager: Manager) -> Self {
        self.pseudo.insert(name, manager);
        self
    }

    /// Pseudo plans with a manager, sorted.
    pub fn pseudo_plans(&self) -> Vec<PseudoPlanName> {
        let mut names: Vec<_> = self.pseudo.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn manage(
        &self,
        hook: &dyn Hook<StartingHookResponse>,
        run: &Run,
    ) -> Result<RunStatus> {
        match &run.plan.kind {
            PlanKind::Image { .. } => self.image.manage(hook, run).await,
            PlanKind::Pseudo { name } => match self.pseudo.get(name) {
                Some(manager) => manager.manage(hook, run).await,
                None => {
                    debug!(run_id = %run.id, plan = %name, "no manager for pseudo plan");
                    Ok(run.status)
                }
            },
        }
    }
}
