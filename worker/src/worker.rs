use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::FutureExt;
use leaseq_config::WorkerSettings;
use rand::Rng;
use tokio::sync::watch;
use tokio::time::{Instant, sleep};
use tracing::level_filters::LevelFilter;
use tracing::{Instrument, Level};
use uuid::Uuid;

use crate::backend::Backend;
use crate::constants::DEFAULT_WORKER_ID_PREFIX;
use crate::context::{JobContext, JobOutcome};
use crate::error::JobError;
use crate::handler::HandlerRegistry;
use crate::job::Job;
use crate::middleware::{Middleware, MiddlewareChain};
use crate::reserver::JobReserver;
use crate::watchdog::LeaseWatchdog;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Reserving,
    Dispatching,
    Executing,
    Reporting,
    Stopped,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Reserving => "reserving",
            WorkerState::Dispatching => "dispatching",
            WorkerState::Executing => "executing",
            WorkerState::Reporting => "reporting",
            WorkerState::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum ShutdownMode {
    Running,
    Graceful,
    Immediate,
}

async fn wait_for_mode(shutdown: &mut watch::Receiver<ShutdownMode>, mode: ShutdownMode) {
    let reached = shutdown.wait_for(|current| *current >= mode).await.is_ok();
    if !reached {
        std::future::pending::<()>().await;
    }
}

/// Requests a running worker to stop. Cloneable and usable from any task.
#[derive(Clone)]
pub struct ShutdownHandle {
    mode: Arc<watch::Sender<ShutdownMode>>,
}

impl ShutdownHandle {
    /// Stop once the current job has been executed and reported.
    pub fn shutdown(&self) {
        self.escalate(ShutdownMode::Graceful);
    }

    /// Also cancel an in-flight reservation, sleep or handler. An
    /// interrupted job is left to lapse and be reclaimed.
    pub fn shutdown_now(&self) {
        self.escalate(ShutdownMode::Immediate);
    }

    pub fn is_requested(&self) -> bool {
        *self.mode.borrow() != ShutdownMode::Running
    }

    fn escalate(&self, mode: ShutdownMode) {
        self.mode.send_if_modified(|current| {
            if *current < mode {
                *current = mode;
                true
            } else {
                false
            }
        });
    }
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub worker_id: String,
    /// Sleep after an empty reservation.
    pub interval: Duration,
    /// Upper bound of the random delay before the first reservation.
    pub max_startup_interval: Duration,
    /// Gates the worker's own per-job lifecycle events.
    pub log_level: LevelFilter,
    pub watchdog_interval: Duration,
    /// Return from `run` as soon as a reservation comes back empty.
    pub burst: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self::from_settings(&WorkerSettings::default()).unwrap_or_else(|_| Self {
            worker_id: default_worker_id(),
            interval: Duration::from_secs(5),
            max_startup_interval: Duration::ZERO,
            log_level: LevelFilter::INFO,
            watchdog_interval: Duration::from_secs(1),
            burst: false,
        })
    }
}

fn default_worker_id() -> String {
    let short_id = Uuid::new_v4().simple().to_string();
    format!(
        "{DEFAULT_WORKER_ID_PREFIX}{}_{}",
        std::process::id(),
        &short_id[..6]
    )
}

fn seconds(value: f64, name: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .with_context(|| format!("{name} must be a finite, non-negative number of seconds"))
}

impl WorkerOptions {
    pub fn from_settings(settings: &WorkerSettings) -> Result<Self> {
        let log_level = settings
            .log_level
            .parse::<LevelFilter>()
            .with_context(|| format!("invalid worker log level '{}'", settings.log_level))?;
        Ok(Self {
            worker_id: settings
                .worker_id
                .clone()
                .unwrap_or_else(default_worker_id),
            interval: seconds(settings.interval_seconds, "interval_seconds")?,
            max_startup_interval: seconds(
                settings.max_startup_interval_seconds,
                "max_startup_interval_seconds",
            )?,
            log_level,
            watchdog_interval: seconds(
                settings.watchdog_interval_seconds,
                "watchdog_interval_seconds",
            )?,
            burst: settings.burst,
        })
    }

    pub fn worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn max_startup_interval(mut self, max: Duration) -> Self {
        self.max_startup_interval = max;
        self
    }

    pub fn log_level(mut self, level: LevelFilter) -> Self {
        self.log_level = level;
        self
    }

    pub fn watchdog_interval(mut self, interval: Duration) -> Self {
        self.watchdog_interval = interval;
        self
    }

    pub fn burst(mut self, burst: bool) -> Self {
        self.burst = burst;
        self
    }
}

/// Tally of one `run`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub processed: usize,
    pub completed: usize,
    pub failed: usize,
    pub retried: usize,
    pub lease_lost: usize,
    pub unreported: usize,
    pub interrupted: usize,
}

impl RunSummary {
    fn record(&mut self, outcome: &JobOutcome) {
        self.processed += 1;
        match outcome {
            JobOutcome::Completed => self.completed += 1,
            JobOutcome::Failed => self.failed += 1,
            JobOutcome::Retried { .. } => self.retried += 1,
            JobOutcome::LeaseLost => self.lease_lost += 1,
            JobOutcome::Unreported => self.unreported += 1,
            JobOutcome::Interrupted => self.interrupted += 1,
        }
    }
}

fn startup_delay(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let mut rng = rand::rng();
    Duration::from_secs_f64(rng.random_range(0.0..max.as_secs_f64()))
}

fn outcome_label(outcome: &JobOutcome) -> &'static str {
    match outcome {
        JobOutcome::Completed => "completed",
        JobOutcome::Failed => "failed",
        JobOutcome::Retried { .. } => "retried",
        JobOutcome::LeaseLost => "lease_lost",
        JobOutcome::Unreported => "unreported",
        JobOutcome::Interrupted => "interrupted",
    }
}

/// Executes one job at a time: reserve, run through the middleware chain,
/// report, repeat.
pub struct SerialWorker {
    reserver: Arc<dyn JobReserver>,
    backend: Arc<dyn Backend>,
    registry: Arc<HandlerRegistry>,
    middleware: MiddlewareChain,
    options: WorkerOptions,
    shutdown: Arc<watch::Sender<ShutdownMode>>,
    state: watch::Sender<WorkerState>,
    started: bool,
}

impl SerialWorker {
    pub fn new(
        reserver: Arc<dyn JobReserver>,
        registry: HandlerRegistry,
        options: WorkerOptions,
    ) -> Self {
        let (shutdown, _) = watch::channel(ShutdownMode::Running);
        let (state, _) = watch::channel(WorkerState::Idle);
        Self {
            backend: reserver.backend(),
            reserver,
            registry: Arc::new(registry),
            middleware: MiddlewareChain::new(),
            options,
            shutdown: Arc::new(shutdown),
            state,
            started: false,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.options.worker_id
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    /// Appends a layer inside every layer registered before it. Refused once
    /// the worker has started running.
    pub fn use_middleware(&mut self, layer: impl Middleware + 'static) -> Result<()> {
        if self.started {
            anyhow::bail!(
                "cannot add middleware '{}' after the worker has started",
                layer.name()
            );
        }
        self.middleware.push(layer);
        Ok(())
    }

    pub fn middleware(&self) -> &MiddlewareChain {
        &self.middleware
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            mode: self.shutdown.clone(),
        }
    }

    pub fn state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: WorkerState) {
        self.state.send_replace(state);
    }

    fn logs(&self, level: Level) -> bool {
        self.options.log_level >= level
    }

    /// Processes jobs until shutdown, until `max_jobs` jobs have been
    /// processed, or (in burst mode) until a reservation comes back empty.
    ///
    /// Fatal backend errors end the run with `Err`. The shutdown request
    /// that stopped the loop is consumed, so `run` may be called again. A
    /// request arriving after the loop stopped for another reason stays
    /// pending and ends the next run before it reserves anything.
    pub async fn run(&mut self, max_jobs: Option<usize>) -> Result<RunSummary> {
        let apply_jitter = !self.started;
        self.started = true;
        let span = tracing::info_span!(
            "leaseq.worker",
            worker_id = %self.options.worker_id,
            queues = %self.reserver.description()
        );
        let mut stopped_by = ShutdownMode::Running;
        let result = self
            .run_loop(max_jobs, apply_jitter, &mut stopped_by)
            .instrument(span)
            .await;
        self.set_state(WorkerState::Stopped);
        self.shutdown.send_if_modified(|mode| {
            let consumed = stopped_by != ShutdownMode::Running && *mode == stopped_by;
            if consumed {
                *mode = ShutdownMode::Running;
            }
            consumed
        });
        result
    }

    async fn run_loop(
        &self,
        max_jobs: Option<usize>,
        apply_jitter: bool,
        stopped_by: &mut ShutdownMode,
    ) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        let mut shutdown = self.shutdown.subscribe();
        tracing::info!(burst = self.options.burst, "worker started");

        if apply_jitter {
            let delay = startup_delay(self.options.max_startup_interval);
            if !delay.is_zero() {
                tracing::debug!(delay_ms = delay.as_millis() as u64, "delaying first reservation");
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = wait_for_mode(&mut shutdown, ShutdownMode::Graceful) => {}
                }
            }
        }

        loop {
            if max_jobs.is_some_and(|max| summary.processed >= max) {
                break;
            }
            let mode = *shutdown.borrow();
            if mode != ShutdownMode::Running {
                *stopped_by = mode;
                break;
            }

            self.set_state(WorkerState::Reserving);
            let reserved = tokio::select! {
                biased;
                _ = wait_for_mode(&mut shutdown, ShutdownMode::Immediate) => {
                    *stopped_by = ShutdownMode::Immediate;
                    break;
                }
                reserved = self.reserver.reserve(&self.options.worker_id) => {
                    reserved.context("failed to reserve a job")?
                }
            };

            match reserved {
                Some(job) => {
                    let outcome = self.process(job, &mut shutdown).await?;
                    summary.record(&outcome);
                    self.set_state(WorkerState::Idle);
                }
                None if self.options.burst => break,
                None => {
                    self.set_state(WorkerState::Idle);
                    tokio::select! {
                        _ = sleep(self.options.interval) => {}
                        _ = wait_for_mode(&mut shutdown, ShutdownMode::Graceful) => {}
                    }
                }
            }
        }

        tracing::info!(
            processed = summary.processed,
            completed = summary.completed,
            failed = summary.failed,
            retried = summary.retried,
            lease_lost = summary.lease_lost,
            unreported = summary.unreported,
            interrupted = summary.interrupted,
            "worker stopped"
        );
        Ok(summary)
    }

    async fn process(
        &self,
        job: Job,
        shutdown: &mut watch::Receiver<ShutdownMode>,
    ) -> Result<JobOutcome> {
        self.set_state(WorkerState::Dispatching);
        let span = tracing::info_span!(
            "leaseq.job",
            jid = %job.jid,
            class = %job.class,
            queue = %job.queue,
            attempt = job.attempt()
        );
        async {
            let ctx = match JobContext::new(job, self.backend.clone(), &self.options.worker_id) {
                Ok(ctx) => ctx,
                Err(err) => {
                    tracing::warn!(error = %err, "reserved job carries no lease; skipping");
                    return Ok(JobOutcome::LeaseLost);
                }
            };
            let handler = self.registry.resolve(ctx.class());

            self.set_state(WorkerState::Executing);
            if self.logs(Level::DEBUG) {
                tracing::debug!(retries_left = ctx.retries_left(), "job started");
            }
            let started_at = Instant::now();
            let watchdog = LeaseWatchdog::arm(ctx.clone(), self.options.watchdog_interval);
            let execution = AssertUnwindSafe(self.middleware.run(&ctx, handler.as_ref()))
                .catch_unwind()
                .map(|result| result.unwrap_or_else(|payload| Err(JobError::from_panic(payload))));
            let result = tokio::select! {
                biased;
                _ = wait_for_mode(shutdown, ShutdownMode::Immediate) => None,
                result = execution => Some(result),
            };
            watchdog.disarm().await;
            let duration_ms = started_at.elapsed().as_secs_f64() * 1000.0;

            let Some(result) = result else {
                tracing::warn!(duration_ms, "job interrupted by shutdown; lease left to lapse");
                return Ok(JobOutcome::Interrupted);
            };

            self.set_state(WorkerState::Reporting);
            let outcome = self.report(&ctx, result).await?;
            if self.logs(Level::INFO) {
                tracing::info!(outcome = outcome_label(&outcome), duration_ms, "job finished");
            }
            Ok::<_, anyhow::Error>(outcome)
        }
        .instrument(span)
        .await
    }

    async fn report(&self, ctx: &JobContext, result: Result<(), JobError>) -> Result<JobOutcome> {
        if let Some(err) = ctx.take_fatal() {
            return Err(anyhow::Error::new(err)
                .context(format!("backend failed while processing job {}", ctx.jid())));
        }
        if let Some(outcome) = ctx.outcome() {
            return Ok(outcome);
        }
        if ctx.is_lease_lost() {
            tracing::warn!("lease lost during execution; result dropped");
            return Ok(JobOutcome::LeaseLost);
        }

        let (report, outcome) = match &result {
            Ok(()) => (ctx.complete().await, JobOutcome::Completed),
            Err(err) => {
                if self.logs(Level::WARN) {
                    tracing::warn!(error_group = err.group(), error_message = err.message(), "job failed");
                }
                (ctx.fail(err.group(), err.message()).await, JobOutcome::Failed)
            }
        };
        match report {
            Ok(()) => Ok(outcome),
            Err(err) if err.is_lost_lock() => {
                tracing::warn!("backend rejected report; lease was lost");
                Ok(JobOutcome::LeaseLost)
            }
            Err(err) if err.is_transient() => {
                tracing::warn!(error = %err, "failed to report job outcome");
                Ok(JobOutcome::Unreported)
            }
            Err(err) => Err(anyhow::Error::new(err)
                .context(format!("backend failed while reporting job {}", ctx.jid()))),
        }
    }
}
