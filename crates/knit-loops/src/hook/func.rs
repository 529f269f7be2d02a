use super::{BoxError, Hook, HookError, HookResponse, Result};
use async_trait::async_trait;
use knit_core::RunDetail;

type BeforeFn<R> = Box<dyn Fn(&RunDetail) -> std::result::Result<R, BoxError> + Send + Sync>;
type AfterFn = Box<dyn Fn(&RunDetail) -> std::result::Result<(), BoxError> + Send + Sync>;

/// In-process hook. A missing callback is a no-op.
pub struct FuncHook<R> {
    before: Option<BeforeFn<R>>,
    after: Option<AfterFn>,
}

impl<R> std::fmt::Debug for FuncHook<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuncHook")
            .field("before", &self.before.is_some())
            .field("after", &self.after.is_some())
            .finish()
    }
}

impl<R> Default for FuncHook<R> {
    fn default() -> Self {
        Self {
            before: None,
            after: None,
        }
    }
}

impl<R: HookResponse> FuncHook<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_before<F>(mut self, f: F) -> Self
    where
        F: Fn(&RunDetail) -> std::result::Result<R, BoxError> + Send + Sync + 'static,
    {
        self.before = Some(Box::new(f));
        self
    }

    pub fn with_after<F>(mut self, f: F) -> Self
    where
        F: Fn(&RunDetail) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        self.after = Some(Box::new(f));
        self
    }
}

#[async_trait]
impl<R: HookResponse> Hook<R> for FuncHook<R> {
    async fn before(&self, detail: &RunDetail) -> Result<R> {
        match &self.before {
            Some(f) => f(detail).map_err(HookError::Failed),
            None => Ok(R::default()),
        }
    }

    async fn after(&self, detail: &RunDetail) -> Result<()> {
        match &self.after {
            Some(f) => f(detail).map_err(HookError::Failed),
            None => Ok(()),
        }
    }
}
