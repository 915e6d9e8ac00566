//! File-analysis submission dispatcher core (spec.md).
//!
//! The crate is organized by the components spec.md §2 names:
//!
//! - [`dispatch_table`] — C1, the per-submission cell store.
//! - [`scheduler`] — C2, staged service plans and per-service policy.
//! - [`watcher`] — C3, keyed deadline timers.
//! - [`watch_registry`] — C4, per-submission watch-queue fan-out.
//! - [`submission_dispatcher`] — C5, the submission-level driver.
//! - [`file_dispatcher`] — C6, the file-level driver.
//! - [`client`] — C7, the façade consumed by workers and submitters.
//!
//! [`dispatcher_context::DispatcherContext`] wires all of the above plus
//! the (mocked) document/blob stores into the single value every driver
//! and façade method takes, replacing the teacher's module-level globals
//! (SPEC_FULL.md §A.3, DESIGN NOTES in spec.md §9).

pub mod args;
pub mod client;
pub mod collaborators;
pub mod config;
pub mod context;
pub mod dispatch_table;
pub mod dispatcher_context;
pub mod error;
pub mod file_dispatcher;
pub mod queue;
pub mod scheduler;
pub mod submission_dispatcher;
pub mod types;
pub mod watch_registry;
pub mod watcher;

use std::sync::Once;

use dispatcher_context::DispatcherContext;
use queue::{FILE_QUEUE, SUBMISSION_QUEUE};

/// Spawns the two long-running consumer loops (submission queue, file
/// queue) plus the watcher sweep, onto the given runtime handle. This is
/// the horizontally-scalable "dispatcher instance" spec.md §5 describes —
/// any number of processes may call `run` against the same shared store
/// and queues.
pub fn run(
    ctx: DispatcherContext,
    rt: &tokio::runtime::Handle,
    kill: tokio::sync::broadcast::Receiver<()>,
) {
    ctx.watcher.spawn(rt, kill.resubscribe());

    let submission_ctx = ctx.clone();
    let mut submission_kill = kill.resubscribe();
    rt.spawn(async move {
        let queue = submission_ctx.queues.get_or_create(SUBMISSION_QUEUE);
        loop {
            tokio::select! {
                _ = submission_kill.recv() => {
                    tracing::info!("submission dispatcher shutting down");
                    break;
                }
                popped = queue.pop::<types::SubmissionId>() => {
                    match popped {
                        Ok(Some(sid)) => {
                            if let Err(err) = submission_dispatcher::dispatch_submission(&submission_ctx, &sid).await {
                                tracing::warn!(%sid, %err, "submission dispatch failed");
                            }
                        }
                        Ok(None) => break,
                        Err(err) => tracing::warn!(%err, "failed to pop submission queue"),
                    }
                }
            }
        }
    });

    let file_ctx = ctx.clone();
    let mut file_kill = kill.resubscribe();
    rt.spawn(async move {
        let queue = file_ctx.queues.get_or_create(FILE_QUEUE);
        loop {
            tokio::select! {
                _ = file_kill.recv() => {
                    tracing::info!("file dispatcher shutting down");
                    break;
                }
                popped = queue.pop::<types::FileTask>() => {
                    match popped {
                        Ok(Some(task)) => {
                            let sid = task.sid.clone();
                            if let Err(err) = file_dispatcher::dispatch_file(&file_ctx, task).await {
                                tracing::warn!(%sid, %err, "file dispatch failed");
                            }
                        }
                        Ok(None) => break,
                        Err(err) => tracing::warn!(%err, "failed to pop file queue"),
                    }
                }
            }
        }
    });
}

static TRACING_INIT: Once = Once::new();

/// Gates double-init of the global tracing subscriber behind a `Once`,
/// for use from `#[tokio::test]`s that each independently want logging
/// (SPEC_FULL.md §A.2).
pub fn init_tracing_tests() {
    TRACING_INIT.call_once(|| {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;
        let _ = tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .with(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}
