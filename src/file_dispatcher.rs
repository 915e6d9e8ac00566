//! C6 — File Dispatcher: driver for a single `FileTask` wake-up (§4.6).
//! Advances a file's schedule one stage, dispatches outstanding services,
//! and detects file completion.
//!
//! Grounded on the teacher's re-entrant `Dispatcher::dispatch` loop shape
//! in `src/dispatcher/core.rs` (load state, walk a fixed plan, push
//! follow-up work, never block across I/O while holding a lock) —
//! generalized here from a single wasm-engine dispatch to the spec's
//! staged schedule walk.

use thiserror::Error;
use tracing::instrument;

use crate::collaborators::StoreError;
use crate::dispatch_table::DispatchTable;
use crate::dispatcher_context::{now, DispatcherContext};
use crate::queue::{QueueError, SUBMISSION_QUEUE};
use crate::types::{FileTask, ServiceName, ServiceTask};

#[derive(Error, Debug)]
pub enum FileDispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// §4.6.1 `_find_results`: the three-step result-cache short-circuit.
/// `Hit` means the cell can be written as `Finished`/`FailedTerminal`
/// without dispatching the service; `Miss` means the service must run.
enum ShortCircuit {
    Result { result_key: String, score: f64, drop: bool },
    TerminalError { error_key: String },
    ExhaustedRetries,
    Miss,
}

async fn find_results(
    ctx: &DispatcherContext,
    task: &FileTask,
    service: &ServiceName,
    config: &serde_json::Value,
) -> Result<ShortCircuit, FileDispatchError> {
    let config_hash = crate::scheduler::hash_config(config);
    let result_key = crate::scheduler::Scheduler::build_result_key(
        task.file_hash.as_ref(),
        service,
        config,
    );
    let _ = &config_hash; // folded into result_key already

    // Step 1: exact result-cache hit.
    if let Some(cached) = ctx.documents.get_result(&result_key).await? {
        return Ok(ShortCircuit::Result {
            result_key,
            score: cached.score,
            drop: cached.drop,
        });
    }

    // Step 2: a previous terminal error for this exact (file, service).
    if let Some(error_key) = ctx
        .documents
        .find_terminal_error(&task.sid, &task.file_hash, service.as_ref())
        .await?
    {
        return Ok(ShortCircuit::TerminalError { error_key });
    }

    // Step 3: enough non-terminal errors to abandon the service outright.
    let recoverable = ctx
        .documents
        .count_recoverable_errors(&task.sid, &task.file_hash, service.as_ref())
        .await?;
    if recoverable > ctx.scheduler.service_failure_limit(service) {
        return Ok(ShortCircuit::ExhaustedRetries);
    }

    Ok(ShortCircuit::Miss)
}

/// §4.6: one `FileTask` wake-up.
#[instrument(level = "debug", skip(ctx), fields(sid = %task.sid, file_hash = %task.file_hash))]
pub async fn dispatch_file(ctx: &DispatcherContext, task: FileTask) -> Result<(), FileDispatchError> {
    let submission = ctx.documents.get_submission(&task.sid).await?;
    ctx.watcher.touch(
        task.sid.as_ref(),
        std::time::Duration::from_secs(ctx.config.submission_watch_timeout_secs),
        SUBMISSION_QUEUE,
        &task.sid,
    );

    let table = ctx.tables.get_or_create(&task.sid);
    let schedule = ctx
        .scheduler
        .schedule_for(&table, &submission, &task.file_hash, &task.file_type);

    let mut outstanding: Vec<ServiceName> = Vec::new();

    'stages: for stage in &schedule.stages {
        let mut stage_had_outstanding = false;

        for service in stage {
            match table.cell(&task.file_hash, service) {
                Some(cell) if cell.is_terminal() => {
                    if let Some(true) = cell.drop_flag() {
                        if !submission.params.ignore_filtering {
                            break 'stages;
                        }
                    }
                    continue;
                }
                _ => {}
            }

            let config = ctx.scheduler.build_service_config(service);
            match find_results(ctx, &task, service, &config).await? {
                ShortCircuit::Result { result_key, score, drop } => {
                    // A cache hit never goes through the dispatch queue, but
                    // it still needs to be counted as dispatched: `finish`
                    // bumps `finished_count` regardless, and invariant 2
                    // (`all_finished` ⇒ `dispatch_count == finished_count`)
                    // must hold for any terminal cell, not just ones that
                    // actually ran a service.
                    table.dispatch(&task.file_hash, service, now());
                    table.finish(&task.file_hash, service, result_key, score, drop);
                    if drop && !submission.params.ignore_filtering {
                        break 'stages;
                    }
                }
                ShortCircuit::TerminalError { error_key } => {
                    table.dispatch(&task.file_hash, service, now());
                    table.fail_nonrecoverable(&task.file_hash, service, error_key);
                }
                ShortCircuit::ExhaustedRetries => {
                    let sentinel = "errors".to_string();
                    table.dispatch(&task.file_hash, service, now());
                    table.fail_nonrecoverable(&task.file_hash, service, sentinel);
                }
                ShortCircuit::Miss => {
                    outstanding.push(service.clone());
                    stage_had_outstanding = true;
                }
            }
        }

        if stage_had_outstanding {
            break 'stages;
        }
    }

    for service in &outstanding {
        let dispatched_at = table.dispatch_time(&task.file_hash, service);
        let timeout = ctx.scheduler.service_timeout(service);
        if dispatched_at != 0 && (now() - dispatched_at) < timeout as i64 {
            continue; // still in flight, per §4.6 step 4
        }

        let config = ctx.scheduler.build_service_config(service);
        let config_key = crate::scheduler::hash_config(&config);
        let service_task = ServiceTask {
            sid: task.sid.clone(),
            file_hash: task.file_hash.clone(),
            file_type: task.file_type.clone(),
            depth: task.depth,
            service_name: service.clone(),
            service_config: config,
            config_key,
        };
        ctx.queues
            .push(&crate::queue::service_queue_name(service.as_ref()), &service_task)
            .await?;
        table.dispatch(&task.file_hash, service, now());
    }

    if outstanding.is_empty() {
        file_completed(ctx, &table, &task).await?;
    }

    Ok(())
}

async fn file_completed(
    ctx: &DispatcherContext,
    table: &DispatchTable,
    task: &FileTask,
) -> Result<(), FileDispatchError> {
    if table.all_finished() {
        ctx.queues.push(SUBMISSION_QUEUE, &task.sid).await?;
    }
    Ok(())
}
