use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;

use crate::backend::LeaseStatus;
use crate::context::JobContext;
use crate::error::BackendError;

/// Background check on the lease of the job currently executing.
///
/// Sleeps until the earlier of the next poll or the local lease deadline,
/// then asks the backend whether the lease is still held. A lapsed or lost
/// lease marks the context, which wakes anything awaiting
/// [`JobContext::lease_lost`]. The task is aborted and joined by
/// [`LeaseWatchdog::disarm`], and aborted on drop.
pub struct LeaseWatchdog {
    handle: Option<JoinHandle<()>>,
}

impl LeaseWatchdog {
    pub fn arm(ctx: JobContext, poll_interval: Duration) -> Self {
        let handle = tokio::spawn(watch_lease(ctx, poll_interval));
        Self {
            handle: Some(handle),
        }
    }

    pub async fn disarm(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for LeaseWatchdog {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Time until the next lease check. Once the local deadline has passed the
/// backend decides whether the grace period still covers the lease, so the
/// regular interval applies again.
fn next_wakeup(ctx: &JobContext, poll_interval: Duration) -> Duration {
    ctx.lease_expires_at()
        .and_then(|expires_at| (expires_at - Utc::now()).to_std().ok())
        .filter(|remaining| !remaining.is_zero())
        .map_or(poll_interval, |remaining| remaining.min(poll_interval))
}

async fn watch_lease(ctx: JobContext, poll_interval: Duration) {
    let poll_interval = poll_interval.max(Duration::from_millis(10));
    loop {
        tokio::time::sleep(next_wakeup(&ctx, poll_interval)).await;
        if ctx.is_reported() || ctx.is_lease_lost() {
            return;
        }

        match ctx.backend().lease_status(ctx.jid(), ctx.lease_token()).await {
            Ok(LeaseStatus::Held { .. }) => {}
            Ok(status) => {
                tracing::warn!(jid = %ctx.jid(), ?status, "lease no longer held");
                ctx.mark_lease_lost();
                return;
            }
            Err(BackendError::NotFound(_)) => {
                tracing::warn!(jid = %ctx.jid(), "job vanished while running");
                ctx.mark_lease_lost();
                return;
            }
            Err(err) if err.is_transient() => {
                tracing::debug!(jid = %ctx.jid(), error = %err, "lease check failed");
            }
            Err(err) => {
                tracing::error!(jid = %ctx.jid(), error = %err, "lease watchdog stopped");
                return;
            }
        }
    }
}
