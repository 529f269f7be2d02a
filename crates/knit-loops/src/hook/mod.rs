//! Callbacks around run status transitions.
//!
//! `before` runs ahead of the transition and may veto it by failing; its
//! response can carry values for the transition (environment variables for
//! a starting worker). `after` runs once the new status is committed and can
//! no longer change anything.

mod func;
mod web;

pub use func::FuncHook;
pub use web::WebHook;

use async_trait::async_trait;
use knit_core::RunDetail;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Every variant means "the hook failed"; callers match on the type.
#[derive(Debug, Error)]
pub enum HookError {
    #[error("hook failed: {0}")]
    Failed(BoxError),
    #[error("hook failed: ({url} {status}, Content-Type: {content_type}){}", body_suffix(.body))]
    Rejected {
        url: String,
        status: u16,
        content_type: String,
        body: Option<String>,
    },
    #[error("hook failed: request to {url}: {source}")]
    Request {
        url: String,
        source: reqwest::Error,
    },
    #[error("hook failed: undecodable response from {url}: {source}")]
    Decode {
        url: String,
        source: serde_json::Error,
    },
    #[error("invalid hook url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

fn body_suffix(body: &Option<String>) -> String {
    match body {
        Some(body) if !body.is_empty() => format!(" {body}"),
        _ => String::new(),
    }
}

pub type Result<T> = std::result::Result<T, HookError>;

/// Value returned by a before-hook. Responses of several endpoints are
/// folded left to right with [`HookResponse::merge`].
pub trait HookResponse: Default + DeserializeOwned + Send + Sync + 'static {
    #[must_use]
    fn merge(self, later: Self) -> Self;
}

/// Response of hooks whose body carries nothing. Any JSON object decodes.
#[allow(clippy::empty_structs_with_brackets)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyResponse {}

impl HookResponse for EmptyResponse {
    fn merge(self, _later: Self) -> Self {
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnitfabExtension {
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Response of before-hooks called when a worker is about to start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartingHookResponse {
    #[serde(default)]
    pub knitfab_extension: KnitfabExtension,
}

impl StartingHookResponse {
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.knitfab_extension.env
    }
}

impl HookResponse for StartingHookResponse {
    fn merge(mut self, later: Self) -> Self {
        self.knitfab_extension
            .env
            .extend(later.knitfab_extension.env);
        self
    }
}

#[async_trait]
pub trait Hook<R: HookResponse>: Send + Sync {
    async fn before(&self, detail: &RunDetail) -> Result<R>;
    async fn after(&self, detail: &RunDetail) -> Result<()>;
}

/// Several hooks called in order.
///
/// `before` stops at the first failure and merges the responses;
/// `after` calls every hook and reports the first failure.
pub struct Layered<R> {
    hooks: Vec<Box<dyn Hook<R>>>,
}

impl<R> std::fmt::Debug for Layered<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Layered")
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

impl<R: HookResponse> Layered<R> {
    pub fn new(hooks: Vec<Box<dyn Hook<R>>>) -> Self {
        Self { hooks }
    }
}

#[async_trait]
impl<R: HookResponse> Hook<R> for Layered<R> {
    async fn before(&self, detail: &RunDetail) -> Result<R> {
        let mut merged = R::default();
        for hook in &self.hooks {
            merged = merged.merge(hook.before(detail).await?);
        }
        Ok(merged)
    }

    async fn after(&self, detail: &RunDetail) -> Result<()> {
        let mut first_error = None;
        for hook in &self.hooks {
            if let Err(e) = hook.after(detail).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
