//! Interceptors wrapping job execution.
//!
//! Each layer runs `before`, then `around` (which calls into the rest of
//! the chain through [`Next`]), then `on_failure` if that produced an
//! error, then `after`. Layers registered first are outermost.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;

use crate::backend::RetryOutcome;
use crate::context::JobContext;
use crate::error::{ErrorKind, JobError};
use crate::handler::JobHandler;

#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    async fn before(&self, _ctx: &JobContext) -> Result<(), JobError> {
        Ok(())
    }

    /// Skipping `next.run` short-circuits the inner layers and the handler.
    async fn around(&self, ctx: &JobContext, next: Next<'_>) -> Result<(), JobError> {
        next.run(ctx).await
    }

    /// May swallow the error by returning `Ok`, or replace it.
    async fn on_failure(&self, _ctx: &JobContext, error: JobError) -> Result<(), JobError> {
        Err(error)
    }

    async fn after(&self, _ctx: &JobContext, _error: Option<&JobError>) -> Result<(), JobError> {
        Ok(())
    }
}

/// The remainder of the chain below the current layer.
pub struct Next<'a> {
    layers: &'a [Arc<dyn Middleware>],
    handler: &'a dyn JobHandler,
}

impl<'a> Next<'a> {
    pub fn run<'b>(self, ctx: &'b JobContext) -> BoxFuture<'b, Result<(), JobError>>
    where
        'a: 'b,
    {
        async move {
            match self.layers.split_first() {
                None => AssertUnwindSafe(self.handler.perform(ctx))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|payload| Err(JobError::from_panic(payload))),
                Some((layer, rest)) => {
                    let next = Next {
                        layers: rest,
                        handler: self.handler,
                    };
                    run_layer(layer.as_ref(), ctx, next).await
                }
            }
        }
        .boxed()
    }
}

async fn run_layer(
    layer: &dyn Middleware,
    ctx: &JobContext,
    next: Next<'_>,
) -> Result<(), JobError> {
    layer.before(ctx).await?;
    let result = match layer.around(ctx, next).await {
        Ok(()) => Ok(()),
        Err(err) => layer.on_failure(ctx, err).await,
    };
    layer.after(ctx, result.as_ref().err()).await?;
    result
}

/// Ordered middleware list, frozen once shared with a running worker.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    layers: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, layer: impl Middleware + 'static) {
        self.layers.push(Arc::new(layer));
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.layers.iter().map(|layer| layer.name()).collect()
    }

    pub async fn run(&self, ctx: &JobContext, handler: &dyn JobHandler) -> Result<(), JobError> {
        Next {
            layers: &self.layers,
            handler,
        }
        .run(ctx)
        .await
    }
}

/// Exponential delay between retries: `base * 2^(attempt - 1)`, capped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base_seconds: f64,
    pub max_seconds: f64,
}

impl Backoff {
    pub fn delay_seconds(&self, attempt: i64) -> f64 {
        if self.base_seconds <= 0.0 {
            return 0.0;
        }
        let attempt = if attempt <= 0 { 1 } else { attempt } as u32;
        let exponent = attempt.saturating_sub(1).min(30);
        let delay = self.base_seconds * (2u64.pow(exponent) as f64);
        delay.min(self.max_seconds.max(0.0))
    }
}

/// Turns handler errors of the configured kinds (or their descendants)
/// into retries while the job has retries left, and into a failure once
/// they run out. Other errors pass through untouched.
pub struct RetryExceptions {
    kinds: Vec<&'static ErrorKind>,
    backoff: Option<Backoff>,
}

impl RetryExceptions {
    pub fn new(kinds: impl IntoIterator<Item = &'static ErrorKind>) -> Self {
        Self {
            kinds: kinds.into_iter().collect(),
            backoff: None,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn is_retryable(&self, kind: &ErrorKind) -> bool {
        self.kinds.iter().any(|retryable| kind.is_a(retryable))
    }

    fn delay_seconds(&self, ctx: &JobContext) -> f64 {
        self.backoff
            .map(|backoff| backoff.delay_seconds(ctx.attempt()))
            .unwrap_or(0.0)
    }
}

#[async_trait]
impl Middleware for RetryExceptions {
    fn name(&self) -> &str {
        "retry-exceptions"
    }

    async fn on_failure(&self, ctx: &JobContext, error: JobError) -> Result<(), JobError> {
        if !self.is_retryable(error.kind()) || ctx.is_reported() {
            return Err(error);
        }
        let report = if ctx.retries_left() > 0 {
            let delay = self.delay_seconds(ctx);
            ctx.retry(delay, error.group(), error.message())
                .await
                .map(|outcome| match outcome {
                    RetryOutcome::Requeued { retries_left } => {
                        tracing::debug!(jid = %ctx.jid(), retries_left, delay, "job requeued for retry");
                    }
                    RetryOutcome::Failed => {
                        tracing::debug!(jid = %ctx.jid(), "retry budget spent; job failed");
                    }
                })
        } else {
            ctx.fail(error.group(), error.message()).await
        };
        match report {
            Ok(()) => Ok(()),
            Err(err) if err.is_lost_lock() => {
                tracing::warn!(jid = %ctx.jid(), "lease lost before retry could be reported");
                Ok(())
            }
            Err(err) if err.is_transient() => {
                tracing::warn!(jid = %ctx.jid(), error = %err, "failed to report retry; job left to its lease");
                Ok(())
            }
            Err(err) => Err(JobError::from(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, MemoryBackend};
    use crate::error::STANDARD_ERROR;
    use crate::handler::handler_fn;
    use crate::job::{JobState, NewJob, Payload};
    use std::sync::Mutex;

    static IO_ERROR: ErrorKind = ErrorKind::child("IOError", &STANDARD_ERROR);
    static EOF_ERROR: ErrorKind = ErrorKind::child("EOFError", &IO_ERROR);
    static VALUE_ERROR: ErrorKind = ErrorKind::child("ValueError", &STANDARD_ERROR);

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        short_circuit: bool,
    }

    impl Recorder {
        fn push(&self, hook: &str) {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:{hook}", self.name));
        }
    }

    #[async_trait]
    impl Middleware for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        async fn before(&self, _ctx: &JobContext) -> Result<(), JobError> {
            self.push("before");
            Ok(())
        }

        async fn around(&self, ctx: &JobContext, next: Next<'_>) -> Result<(), JobError> {
            self.push("around");
            if self.short_circuit {
                return Ok(());
            }
            next.run(ctx).await
        }

        async fn on_failure(&self, _ctx: &JobContext, error: JobError) -> Result<(), JobError> {
            self.push("on_failure");
            Err(error)
        }

        async fn after(&self, _ctx: &JobContext, error: Option<&JobError>) -> Result<(), JobError> {
            self.push(if error.is_some() { "after(err)" } else { "after" });
            Ok(())
        }
    }

    async fn running_job(retries: i64) -> (Arc<MemoryBackend>, JobContext) {
        let backend = Arc::new(MemoryBackend::new());
        backend
            .put(
                "main",
                NewJob {
                    jid: "jid".to_string(),
                    class: "JobClass".to_string(),
                    payload: Payload::new(),
                    priority: 0,
                    retries,
                    delay_seconds: 0.0,
                },
            )
            .await
            .unwrap();
        let job = backend.pop("main", "worker").await.unwrap().unwrap();
        let ctx = JobContext::new(job, backend.clone(), "worker").unwrap();
        (backend, ctx)
    }

    fn recorder(name: &'static str, log: &Arc<Mutex<Vec<String>>>, short: bool) -> Recorder {
        Recorder {
            name,
            log: log.clone(),
            short_circuit: short,
        }
    }

    #[tokio::test]
    async fn first_registered_layer_is_outermost() {
        let (_backend, ctx) = running_job(0).await;
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = MiddlewareChain::new();
        chain.push(recorder("outer", &log, false));
        chain.push(recorder("inner", &log, false));

        let handler_log = log.clone();
        let handler = handler_fn(move |_ctx| {
            let log = handler_log.clone();
            async move {
                log.lock().unwrap().push("handler".to_string());
                Err(JobError::standard("boom"))
            }
        });

        let result = chain.run(&ctx, &handler).await;
        assert!(result.is_err());
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "outer:before",
                "outer:around",
                "inner:before",
                "inner:around",
                "handler",
                "inner:on_failure",
                "inner:after(err)",
                "outer:on_failure",
                "outer:after(err)",
            ]
        );
    }

    #[tokio::test]
    async fn around_may_skip_the_handler() {
        let (_backend, ctx) = running_job(0).await;
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = MiddlewareChain::new();
        chain.push(recorder("gate", &log, true));
        let handler = handler_fn(|_ctx| async { Err(JobError::standard("never runs")) });

        chain.run(&ctx, &handler).await.unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["gate:before", "gate:around", "gate:after"]
        );
    }

    #[tokio::test]
    async fn panics_become_job_errors() {
        let (_backend, ctx) = running_job(0).await;
        let chain = MiddlewareChain::new();
        let handler = handler_fn(|_ctx| async {
            if true {
                panic!("handler blew up");
            }
            Ok(())
        });
        let err = chain.run(&ctx, &handler).await.unwrap_err();
        assert_eq!(err.kind().name(), "Panic");
        assert_eq!(err.message(), "handler blew up");
    }

    #[test]
    fn retryable_kinds_match_descendants() {
        let retry = RetryExceptions::new([&IO_ERROR]);
        assert!(retry.is_retryable(&IO_ERROR));
        assert!(retry.is_retryable(&EOF_ERROR));
        assert!(!retry.is_retryable(&VALUE_ERROR));
        assert!(!retry.is_retryable(&STANDARD_ERROR));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let backoff = Backoff {
            base_seconds: 2.0,
            max_seconds: 5.0,
        };
        assert_eq!(backoff.delay_seconds(1), 2.0);
        assert_eq!(backoff.delay_seconds(2), 4.0);
        assert_eq!(backoff.delay_seconds(3), 5.0);
        assert_eq!(backoff.delay_seconds(0), 2.0);
    }

    #[tokio::test]
    async fn retryable_error_requeues_while_budget_remains() {
        let (backend, ctx) = running_job(3).await;
        let mut chain = MiddlewareChain::new();
        chain.push(RetryExceptions::new([&IO_ERROR]));
        let handler = handler_fn(|_ctx| async { Err(JobError::new(&EOF_ERROR, "eof")) });

        chain.run(&ctx, &handler).await.unwrap();
        let job = backend.snapshot("jid").unwrap();
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.retries_left, 2);
        assert!(ctx.is_reported());
    }

    #[tokio::test]
    async fn retryable_error_fails_when_budget_is_spent() {
        let (backend, ctx) = running_job(0).await;
        let mut chain = MiddlewareChain::new();
        chain.push(RetryExceptions::new([&IO_ERROR]));
        let handler = handler_fn(|_ctx| async { Err(JobError::new(&IO_ERROR, "disk")) });

        chain.run(&ctx, &handler).await.unwrap();
        let job = backend.snapshot("jid").unwrap();
        assert_eq!(job.state, JobState::Failed);
        let failure = job.failure.unwrap();
        assert_eq!(failure.group, "IOError");
        assert_eq!(failure.message, "disk");
    }

    #[tokio::test]
    async fn unrelated_errors_propagate() {
        let (backend, ctx) = running_job(3).await;
        let mut chain = MiddlewareChain::new();
        chain.push(RetryExceptions::new([&IO_ERROR]));
        let handler = handler_fn(|_ctx| async { Err(JobError::new(&VALUE_ERROR, "bad")) });

        let err = chain.run(&ctx, &handler).await.unwrap_err();
        assert_eq!(err.group(), "ValueError");
        assert!(!ctx.is_reported());
        assert_eq!(backend.snapshot("jid").unwrap().state, JobState::Running);
    }
}
