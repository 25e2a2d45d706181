pub mod backend;
pub mod client;
pub mod constants;
pub mod context;
pub mod error;
pub mod handler;
pub mod job;
pub mod middleware;
pub mod reserver;
pub mod telemetry;
pub mod watchdog;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use backend::{Backend, LeaseStatus, MemoryBackend, RedisBackend, RetryOutcome};
pub use client::{Client, Queue};
pub use context::{JobContext, JobOutcome};
pub use error::{BackendError, ErrorKind, JobError};
pub use handler::{HandlerRegistry, JobHandler, handler_fn};
pub use job::{Job, JobState, Payload, PutOptions};
pub use middleware::{Backoff, Middleware, MiddlewareChain, Next, RetryExceptions};
pub use reserver::{JobReserver, Ordered, RoundRobin};
pub use worker::{RunSummary, SerialWorker, ShutdownHandle, WorkerOptions, WorkerState};
