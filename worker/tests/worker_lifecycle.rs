mod support;

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::Notify;

use leaseq_worker::backend::MemoryBackend;
use leaseq_worker::{HandlerRegistry, JobState, RetryExceptions, WorkerState};
use leaseq_worker::error::STANDARD_ERROR;

use support::{WAIT, new_job, options, put, worker_for};

fn alive_tasks() -> usize {
    Handle::current().metrics().num_alive_tasks()
}

#[tokio::test(flavor = "current_thread")]
async fn repeated_runs_leave_no_tasks_behind() {
    let backend = Arc::new(MemoryBackend::new());
    let mut registry = HandlerRegistry::new();
    registry.register_fn("Ok", |ctx| async move {
        ctx.heartbeat().await?;
        Ok(())
    });
    registry.register_fn("Fails", |_ctx| async {
        Err(leaseq_worker::JobError::standard("nope"))
    });
    let mut worker = worker_for(backend.clone(), &["main"], registry, options().burst(true));
    worker
        .use_middleware(RetryExceptions::new([&STANDARD_ERROR]))
        .unwrap();

    let baseline = alive_tasks();
    for cycle in 0..4 {
        for index in 0..cycle {
            put(&backend, "main", new_job(&format!("ok-{cycle}-{index}"), "Ok", 0, 0)).await;
        }
        put(&backend, "main", new_job(&format!("fails-{cycle}"), "Fails", 0, 1)).await;

        let summary = worker.run(None).await.unwrap();
        assert_eq!(summary.completed, cycle);
        assert_eq!((summary.retried, summary.failed), (1, 1));
        assert_eq!(alive_tasks(), baseline, "cycle {cycle} leaked a task");
    }

    let empty = worker.run(None).await.unwrap();
    assert_eq!(empty.processed, 0);
    assert_eq!(alive_tasks(), baseline);
}

#[tokio::test]
async fn graceful_shutdown_finishes_the_current_job() {
    let backend = Arc::new(MemoryBackend::new());
    put(&backend, "main", new_job("current", "Gated", 0, 0)).await;
    put(&backend, "main", new_job("queued", "Gated", 0, 0)).await;

    let release = Arc::new(Notify::new());
    let mut registry = HandlerRegistry::new();
    let gate = release.clone();
    registry.register_fn("Gated", move |_ctx| {
        let gate = gate.clone();
        async move {
            gate.notified().await;
            Ok(())
        }
    });
    let mut worker = worker_for(backend.clone(), &["main"], registry, options());
    let handle = worker.shutdown_handle();
    let mut state = worker.state();

    let stop = async {
        state
            .wait_for(|current| *current == WorkerState::Executing)
            .await
            .unwrap();
        handle.shutdown();
        assert!(handle.is_requested());
        release.notify_one();
    };
    let (summary, ()) = tokio::join!(worker.run(None), stop);
    let summary = summary.unwrap();

    assert_eq!((summary.processed, summary.completed), (1, 1));
    assert_eq!(backend.snapshot("current").unwrap().state, JobState::Complete);
    assert_eq!(backend.snapshot("queued").unwrap().state, JobState::Waiting);
    assert_eq!(*worker.state().borrow(), WorkerState::Stopped);
    assert!(!handle.is_requested());
}

#[tokio::test]
async fn immediate_shutdown_interrupts_the_handler() {
    let backend = Arc::new(MemoryBackend::new());
    put(&backend, "main", new_job("stuck", "Hang", 0, 0)).await;
    let mut registry = HandlerRegistry::new();
    registry.register_fn("Hang", |_ctx| async {
        std::future::pending::<()>().await;
        Ok(())
    });
    let mut worker = worker_for(backend.clone(), &["main"], registry, options());
    let handle = worker.shutdown_handle();

    let stop = async {
        backend
            .wait_for_state("stuck", JobState::Running, WAIT)
            .await
            .unwrap();
        handle.shutdown_now();
    };
    let (summary, ()) = tokio::time::timeout(WAIT, async { tokio::join!(worker.run(None), stop) })
        .await
        .expect("worker should stop promptly");
    assert_eq!(summary.unwrap().interrupted, 1);

    let job = backend.snapshot("stuck").unwrap();
    assert_eq!(job.state, JobState::Running);
    assert!(job.lease_token.is_some());
}

#[tokio::test]
async fn shutdown_wakes_an_idle_worker() {
    let backend = Arc::new(MemoryBackend::new());
    let mut worker = worker_for(
        backend,
        &["main"],
        HandlerRegistry::new(),
        options().interval(Duration::from_secs(60)),
    );
    let handle = worker.shutdown_handle();
    let mut state = worker.state();

    let stop = async {
        state
            .wait_for(|current| *current == WorkerState::Idle)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.shutdown();
    };
    let (summary, ()) = tokio::time::timeout(WAIT, async { tokio::join!(worker.run(None), stop) })
        .await
        .expect("idle worker should notice shutdown");
    assert_eq!(summary.unwrap().processed, 0);
}

#[tokio::test]
async fn max_jobs_bounds_a_run() {
    let backend = Arc::new(MemoryBackend::new());
    for index in 0..5 {
        put(&backend, "main", new_job(&format!("job-{index}"), "Ok", 0, 0)).await;
    }
    let mut registry = HandlerRegistry::new();
    registry.register_fn("Ok", |_ctx| async { Ok(()) });
    let mut worker = worker_for(backend.clone(), &["main"], registry, options());

    assert_eq!(worker.run(Some(2)).await.unwrap().completed, 2);
    assert_eq!(worker.run(Some(2)).await.unwrap().completed, 2);
    let client = leaseq_worker::Client::new(backend.clone(), "inspector");
    assert_eq!(client.queue("main").length().await.unwrap(), 1);
}
