//! Webhook configuration (YAML).
//!
//! ```yaml
//! lifecycle-hooks:
//!   before: [ "http://hooks.example/before" ]
//!   after: [ "http://hooks.example/after" ]
//! # optional per-phase replacements
//! finishing:
//!   after: [ "http://audit.example/finished" ]
//! ```

use crate::types::LoopType;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HookConfigError {
    #[error("failed to read hook config: {0}")]
    Read(#[from] std::io::Error),
    #[error("invalid hook config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Ordered URL lists called around a status transition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebHookUrls {
    pub before: Vec<String>,
    pub after: Vec<String>,
}

impl WebHookUrls {
    pub fn is_empty(&self) -> bool {
        self.before.is_empty() && self.after.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct HookConfig {
    /// Hooks shared by every run-transitioning phase.
    pub lifecycle_hooks: WebHookUrls,
    #[serde(rename = "initialize")]
    pub initialize: Option<WebHookUrls>,
    #[serde(rename = "run_management")]
    pub run_management: Option<WebHookUrls>,
    #[serde(rename = "finishing")]
    pub finishing: Option<WebHookUrls>,
}

impl HookConfig {
    pub fn from_file(path: &Path) -> Result<Self, HookConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, HookConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Hooks for a phase: its own section if present, the lifecycle hooks
    /// otherwise. Phases that never transition runs get none.
    pub fn for_phase(&self, phase: LoopType) -> WebHookUrls {
        let specific = match phase {
            LoopType::Initialize => self.initialize.as_ref(),
            LoopType::RunManagement => self.run_management.as_ref(),
            LoopType::Finishing => self.finishing.as_ref(),
            LoopType::Projection | LoopType::GarbageCollection | LoopType::Housekeeping => {
                return WebHookUrls::default();
            }
        };
        specific.unwrap_or(&self.lifecycle_hooks).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lifecycle_hooks() {
        let config = HookConfig::parse(
            r#"
lifecycle-hooks:
  before:
    - http://hooks.example/before-1
    - http://hooks.example/before-2
  after:
    - http://hooks.example/after
"#,
        )
        .unwrap();
        assert_eq!(config.lifecycle_hooks.before.len(), 2);
        assert_eq!(config.lifecycle_hooks.after, vec!["http://hooks.example/after"]);

        let init = config.for_phase(LoopType::Initialize);
        assert_eq!(init, config.lifecycle_hooks);
    }

    #[test]
    fn phase_section_replaces_lifecycle_hooks() {
        let config = HookConfig::parse(
            r#"
lifecycle-hooks:
  before: [ "http://hooks.example/before" ]
finishing:
  after: [ "http://audit.example/finished" ]
"#,
        )
        .unwrap();
        let finishing = config.for_phase(LoopType::Finishing);
        assert!(finishing.before.is_empty());
        assert_eq!(finishing.after, vec!["http://audit.example/finished"]);
        assert_eq!(
            config.for_phase(LoopType::RunManagement).before,
            vec!["http://hooks.example/before"]
        );
    }

    #[test]
    fn non_transitioning_phases_have_no_hooks() {
        let config = HookConfig::parse("lifecycle-hooks:\n  before: [ \"http://x\" ]\n").unwrap();
        assert!(config.for_phase(LoopType::GarbageCollection).is_empty());
        assert!(config.for_phase(LoopType::Projection).is_empty());
    }

    #[test]
    fn empty_document_means_no_hooks() {
        assert_eq!(HookConfig::parse("  \n").unwrap(), HookConfig::default());
    }

    #[test]
    fn malformed_yaml_is_rejected() {
        assert!(matches!(
            HookConfig::parse("lifecycle-hooks: [unterminated"),
            Err(HookConfigError::Parse(_))
        ));
    }
}
