//! C5 — Submission Dispatcher: driver for a submission-level wake-up
//! (§4.5). Discovers files, detects whole-submission completion, and
//! finalizes.
//!
//! Grounded on the same re-entrant driver shape as [`crate::file_dispatcher`]
//! and on the teacher's top-level orchestration loop in
//! `src/dispatcher/core.rs`, which likewise re-reads authoritative state
//! on every wake-up rather than carrying it across calls.

use std::collections::{HashMap, VecDeque};

use thiserror::Error;
use tracing::instrument;

use crate::collaborators::StoreError;
use crate::dispatch_table::DispatchTable;
use crate::dispatcher_context::{now, DispatcherContext};
use crate::queue::{QueueError, FILE_QUEUE};
use crate::types::{
    CompletedNotice, FileHash, FileTask, Submission, SubmissionState,
};

#[derive(Error, Debug)]
pub enum SubmissionDispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

struct Unchecked {
    file_hash: FileHash,
    file_type: String,
    depth: u32,
}

/// A crude total order standing in for the classification lattice spec.md
/// §1 names as an external collaborator — just enough to let `finalize`
/// take a join of per-file classifications. See DESIGN.md.
const CLASSIFICATION_ORDER: [&str; 4] = ["unknown", "benign", "suspicious", "malicious"];

fn classification_rank(label: &str) -> usize {
    CLASSIFICATION_ORDER
        .iter()
        .position(|l| *l == label)
        .unwrap_or(0)
}

fn join_classification(current: &Option<String>, incoming: &Option<String>) -> Option<String> {
    match (current, incoming) {
        (None, other) => other.clone(),
        (Some(_), None) => current.clone(),
        (Some(a), Some(b)) => {
            if classification_rank(b) > classification_rank(a) {
                Some(b.clone())
            } else {
                current.clone()
            }
        }
    }
}

/// §4.5: one `{sid}` wake-up from the submission queue.
#[instrument(level = "debug", skip(ctx), fields(sid = %sid))]
pub async fn dispatch_submission(
    ctx: &DispatcherContext,
    sid: &crate::types::SubmissionId,
) -> Result<(), SubmissionDispatchError> {
    let mut submission = ctx.documents.get_submission(sid).await?;

    // Step 1: refresh the watch.
    ctx.watcher.touch(
        sid.as_ref(),
        std::time::Duration::from_secs(ctx.config.submission_watch_timeout_secs),
        crate::queue::SUBMISSION_QUEUE,
        sid,
    );

    // Step 2: refresh the quota hold.
    ctx.quota.refresh(&submission.submitter, sid, now());

    let table = ctx.tables.get_or_create(sid);
    let max_depth = ctx.max_extraction_depth(&submission);

    // Step 3: seed `unchecked` with every top-level file, dropping any
    // whose blob cannot be found (missing-file error, §7).
    let mut unchecked: VecDeque<Unchecked> = VecDeque::new();
    let mut seen: std::collections::HashSet<FileHash> = std::collections::HashSet::new();
    for file_hash in &submission.files {
        if !ctx.blobs.has_file(file_hash).await {
            let error_id = uuid::Uuid::now_v7().to_string();
            ctx.documents
                .put_error(
                    sid,
                    file_hash,
                    "_blob_store",
                    true,
                    &error_id,
                    "file could not be fetched from the blob store",
                )
                .await?;
            continue;
        }
        let Some(record) = ctx.blobs.file_record(file_hash).await else {
            continue;
        };
        if seen.insert(file_hash.clone()) {
            unchecked.push_back(Unchecked {
                file_hash: record.file_hash,
                file_type: record.file_type,
                depth: 0,
            });
        }
    }

    // Step 4: walk every (possibly newly-extracted) file's schedule.
    let mut pending_files: Vec<FileHash> = Vec::new();
    let mut max_score = submission.max_score;
    let mut classification = submission.classification.clone();

    while let Some(item) = unchecked.pop_front() {
        let schedule =
            ctx.scheduler
                .schedule_for(&table, &submission, &item.file_hash, &item.file_type);

        let mut file_is_pending = false;

        'stages: for stage in &schedule.stages {
            for service in stage {
                match table.cell(&item.file_hash, service) {
                    None => {
                        file_is_pending = true;
                    }
                    Some(crate::types::StatusCell::Dispatched { .. }) => {
                        // §4.5 step 4a: in-flight or timed-out, either way
                        // not yet terminal — record pending either way and
                        // let the file dispatcher (C6) decide whether to
                        // re-dispatch once it re-runs the schedule.
                        file_is_pending = true;
                    }
                    Some(crate::types::StatusCell::Finished { result_key, score, drop }) => {
                        if score > max_score {
                            max_score = score;
                        }
                        if let Some(result) = ctx.documents.get_result(&result_key).await? {
                            classification = join_classification(&classification, &result.classification);
                            if item.depth < max_depth {
                                for child_hash in &result.extracted {
                                    if seen.insert(child_hash.clone()) {
                                        if let Some(child) = ctx.blobs.file_record(child_hash).await {
                                            unchecked.push_back(Unchecked {
                                                file_hash: child.file_hash,
                                                file_type: child.file_type,
                                                depth: item.depth + 1,
                                            });
                                        }
                                    }
                                }
                            }
                        }
                        if drop && !submission.params.ignore_filtering {
                            break 'stages;
                        }
                    }
                    Some(crate::types::StatusCell::FailedTerminal { .. }) => {
                        // finished-without-result; does not gate the file.
                    }
                    Some(crate::types::StatusCell::FailedRecoverable { .. }) => {
                        file_is_pending = true;
                    }
                }
            }
            if file_is_pending {
                break 'stages;
            }
        }

        if file_is_pending {
            pending_files.push(item.file_hash);
        }
    }

    submission.max_score = max_score;
    submission.classification = classification;

    // Step 5/6: re-drive pending files, or finalize.
    if !pending_files.is_empty() {
        for file_hash in pending_files {
            let file_type = ctx
                .blobs
                .file_record(&file_hash)
                .await
                .map(|r| r.file_type)
                .unwrap_or_default();
            let task = FileTask {
                sid: sid.clone(),
                file_hash,
                file_type,
                depth: 0,
                parent_hash: None,
            };
            ctx.queues.push(FILE_QUEUE, &task).await?;
        }
        Ok(())
    } else {
        finalize(ctx, &table, submission).await
    }
}

/// §4.5 finalize.
async fn finalize(
    ctx: &DispatcherContext,
    table: &DispatchTable,
    mut submission: Submission,
) -> Result<(), SubmissionDispatchError> {
    let sid = submission.sid.clone();

    let all_results = table.all_results();
    let mut error_count = 0u32;
    let mut errors: Vec<String> = Vec::new();
    let mut results: HashMap<String, serde_json::Value> = HashMap::new();

    for (file, cells) in &all_results {
        for (service, cell) in cells {
            match cell {
                crate::types::StatusCell::FailedTerminal { error_key } => {
                    error_count += 1;
                    errors.push(error_key.clone());
                }
                crate::types::StatusCell::Finished { result_key, score, .. } => {
                    results.insert(
                        format!("{file}:{service}"),
                        serde_json::json!({ "result_key": result_key, "score": score }),
                    );
                }
                _ => {}
            }
        }
    }

    submission.state = SubmissionState::Completed;
    submission.error_count = error_count;
    submission.errors = errors.clone();
    submission.file_count = all_results.len() as u32;
    submission.completed_at = Some(now());
    ctx.documents.put_submission(&submission).await?;

    ctx.tables.delete(&sid);

    let notice = CompletedNotice {
        sid: sid.clone(),
        state: submission.state,
        max_score: submission.max_score,
        error_count: submission.error_count,
        errors,
        file_count: submission.file_count,
        classification: submission.classification.clone(),
        results,
    };

    if let Some(queue_name) = ctx.completed_queues.take(&sid) {
        ctx.queues.push(&queue_name, &notice).await?;
    }

    ctx.watch_registry
        .fan_out(&sid, &ctx.queues, &crate::watch_registry::WatchMessage::Stop)
        .await;
    ctx.watch_registry.drop_set(&sid);

    ctx.watcher.cancel(sid.as_ref());
    ctx.quota.release(&submission.submitter, &sid);

    Ok(())
}
