//! C7 — Client façade: the API consumed by service workers and
//! submitters (§4.7). All four operations are idempotent with respect to
//! retransmission of the same `(task, result)` pair, matching the
//! duplicate-delivery discipline spec.md §7 requires everywhere else.

use std::collections::HashMap;

use thiserror::Error;
use tracing::instrument;

use crate::collaborators::StoreError;
use crate::dispatcher_context::DispatcherContext;
use crate::queue::{QueueError, FILE_QUEUE, SUBMISSION_QUEUE};
use crate::types::{
    FailureStatus, FileTask, ServiceError, ServiceName, ServiceResult, ServiceTask, SubmissionId,
    SubmissionState, SubmissionTask,
};
use crate::watch_registry::WatchMessage;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

pub struct Client<'a> {
    ctx: &'a DispatcherContext,
}

impl<'a> Client<'a> {
    pub fn new(ctx: &'a DispatcherContext) -> Self {
        Self { ctx }
    }

    /// §4.7 `dispatch_submission(submission, completed_queue?)`.
    /// Precondition: submission & files already persisted by the caller.
    /// The `submission` queue itself only ever carries a bare `sid` (see
    /// `DispatcherContext::completed_queues` for why); `completed_queue`
    /// is stashed there so finalize can find it later.
    #[instrument(level = "debug", skip(self, task), fields(sid = %task.sid))]
    pub async fn dispatch_submission(&self, task: SubmissionTask) -> Result<(), ClientError> {
        if let Some(queue_name) = &task.completed_queue {
            self.ctx.completed_queues.register(&task.sid, queue_name);
        }
        self.ctx.queues.push(SUBMISSION_QUEUE, &task.sid).await?;
        Ok(())
    }

    /// §4.7 `service_finished(task, result)`.
    #[instrument(level = "debug", skip(self, result), fields(sid = %task.sid, file_hash = %task.file_hash, service = %task.service_name))]
    pub async fn service_finished(
        &self,
        task: ServiceTask,
        result: ServiceResult,
    ) -> Result<(), ClientError> {
        // 1. persist the result under the precomputed fingerprint.
        self.ctx.documents.put_result(&task.config_key, &result).await?;

        // 2. atomic finish, returns remaining non-terminal cell count.
        let table = self.ctx.tables.get_or_create(&task.sid);
        let remaining = table.finish(
            &task.file_hash,
            &task.service_name,
            task.config_key.clone(),
            result.score,
            result.drop,
        );

        // 3. extraction, bounded by max_extraction_depth.
        let submission = self.ctx.documents.get_submission(&task.sid).await?;
        let max_depth = self.ctx.max_extraction_depth(&submission);
        if task.depth < max_depth {
            for child_hash in &result.extracted {
                if let Some(child) = self.ctx.blobs.file_record(child_hash).await {
                    let child_task = FileTask {
                        sid: task.sid.clone(),
                        file_hash: child.file_hash,
                        file_type: child.file_type,
                        depth: task.depth + 1,
                        parent_hash: Some(task.file_hash.clone()),
                    };
                    self.ctx.queues.push(FILE_QUEUE, &child_task).await?;
                }
            }
        }

        // 4. re-drive the parent file's schedule.
        let parent_task = FileTask {
            sid: task.sid.clone(),
            file_hash: task.file_hash.clone(),
            file_type: task.file_type.clone(),
            depth: task.depth,
            parent_hash: None,
        };
        self.ctx.queues.push(FILE_QUEUE, &parent_task).await?;

        // 5. finalize check.
        if remaining == 0 && table.all_finished() {
            self.ctx.queues.push(SUBMISSION_QUEUE, &task.sid).await?;
        }

        // 6. watch-queue fan-out.
        self.ctx
            .watch_registry
            .fan_out(
                &task.sid,
                &self.ctx.queues,
                &WatchMessage::Ok {
                    cache_key: task.config_key.clone(),
                },
            )
            .await;

        Ok(())
    }

    /// §4.7 `service_failed(task, error)`.
    #[instrument(level = "debug", skip(self, error), fields(sid = %task.sid, file_hash = %task.file_hash, service = %task.service_name))]
    pub async fn service_failed(
        &self,
        task: ServiceTask,
        error: ServiceError,
    ) -> Result<(), ClientError> {
        let error_id = uuid::Uuid::now_v7().to_string();
        let terminal = error.status == FailureStatus::FailNonrecoverable;
        self.ctx
            .documents
            .put_error(
                &task.sid,
                &task.file_hash,
                task.service_name.as_ref(),
                terminal,
                &error_id,
                &error.message,
            )
            .await?;

        let table = self.ctx.tables.get_or_create(&task.sid);
        match error.status {
            FailureStatus::FailRecoverable => {
                let attempts = table.fail_recoverable(&task.file_hash, &task.service_name);
                let limit = self.ctx.scheduler.service_failure_limit(&task.service_name);
                if attempts > limit {
                    table.fail_nonrecoverable(&task.file_hash, &task.service_name, error_id.clone());
                }
            }
            FailureStatus::FailNonrecoverable => {
                table.fail_nonrecoverable(&task.file_hash, &task.service_name, error_id.clone());
            }
        };
        let cache_key = error_id;

        let parent_task = FileTask {
            sid: task.sid.clone(),
            file_hash: task.file_hash.clone(),
            file_type: task.file_type.clone(),
            depth: task.depth,
            parent_hash: None,
        };
        self.ctx.queues.push(FILE_QUEUE, &parent_task).await?;

        self.ctx
            .watch_registry
            .fan_out(&task.sid, &self.ctx.queues, &WatchMessage::Fail { cache_key })
            .await;

        Ok(())
    }

    /// §4.7 `setup_watch_queue(sid)`. Returns the new queue's name.
    #[instrument(level = "debug", skip(self))]
    pub async fn setup_watch_queue(&self, sid: &SubmissionId) -> Result<String, ClientError> {
        let queue_name = crate::watch_registry::WatchRegistry::new_queue_name();
        let queue = self.ctx.queues.get_or_create(&queue_name);
        queue.push(&WatchMessage::Start).await?;
        self.ctx.watch_registry.register(sid, &queue_name);

        match self.ctx.tables.get(sid) {
            Some(table) => {
                let results = table.all_results();
                if results.is_empty() {
                    self.ctx.queues.push(SUBMISSION_QUEUE, sid).await?;
                } else {
                    for (_, cells) in results {
                        for (_, cell) in cells {
                            let message = match cell {
                                crate::types::StatusCell::Finished { result_key, .. } => {
                                    Some(WatchMessage::Ok { cache_key: result_key })
                                }
                                crate::types::StatusCell::FailedTerminal { error_key } => {
                                    Some(WatchMessage::Fail { cache_key: error_key })
                                }
                                _ => None,
                            };
                            if let Some(message) = message {
                                queue.push(&message).await?;
                            }
                        }
                    }
                }
            }
            None => {
                // Table already deleted: either the submission finished,
                // or dispatch never began. Disambiguate from persisted
                // submission state (see DESIGN.md).
                let submission = self.ctx.documents.get_submission(sid).await?;
                if submission.state == SubmissionState::Completed {
                    queue.push(&WatchMessage::Stop).await?;
                } else {
                    self.ctx.queues.push(SUBMISSION_QUEUE, sid).await?;
                }
            }
        }

        Ok(queue_name)
    }

    /// §4.7 `outstanding_services(sid)`.
    #[instrument(level = "debug", skip(self))]
    pub fn outstanding_services(&self, sid: &SubmissionId) -> HashMap<ServiceName, u32> {
        let mut counts: HashMap<ServiceName, u32> = HashMap::new();
        let Some(table) = self.ctx.tables.get(sid) else {
            return counts;
        };

        for file in table.files() {
            let Some(schedule) = table.schedule(&file) else {
                continue;
            };
            'stages: for stage in &schedule.stages {
                for service in stage {
                    match table.cell(&file, service) {
                        None => {
                            *counts.entry(service.clone()).or_insert(0) += 1;
                        }
                        Some(cell) => {
                            if let Some(true) = cell.drop_flag() {
                                break 'stages;
                            }
                        }
                    }
                }
            }
        }

        counts
    }
}
