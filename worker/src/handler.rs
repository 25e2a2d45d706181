use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::JobContext;
use crate::error::JobError;

/// User code run for a job. Returning `Err` hands the error to the
/// middleware chain; returning `Ok` completes the job unless the handler
/// already reported it through the context.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn perform(&self, ctx: &JobContext) -> Result<(), JobError>;
}

/// Adapts an async closure into a [`JobHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    async fn perform(&self, ctx: &JobContext) -> Result<(), JobError> {
        (self.0)(ctx.clone()).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    FnHandler(f)
}

/// Stands in for a class with no registered handler so the failure still
/// flows through the middleware chain.
struct MissingHandler;

#[async_trait]
impl JobHandler for MissingHandler {
    async fn perform(&self, ctx: &JobContext) -> Result<(), JobError> {
        Err(JobError::handler_not_found(ctx.class()))
    }
}

/// Class name to handler lookup.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, class: impl Into<String>, handler: impl JobHandler + 'static) {
        self.handlers.insert(class.into(), Arc::new(handler));
    }

    pub fn register_fn<F, Fut>(&mut self, class: impl Into<String>, f: F)
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        self.register(class, handler_fn(f));
    }

    pub fn get(&self, class: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(class).cloned()
    }

    pub(crate) fn resolve(&self, class: &str) -> Arc<dyn JobHandler> {
        self.get(class).unwrap_or_else(|| Arc::new(MissingHandler))
    }

    pub fn classes(&self) -> Vec<String> {
        let mut classes: Vec<String> = self.handlers.keys().cloned().collect();
        classes.sort();
        classes
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
