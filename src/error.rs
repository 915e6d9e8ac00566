//! Crate-level error aggregation, matching `DispatcherError` in
//! `packages/wavs/src/dispatcher.rs` — one `thiserror` enum with `#[from]`
//! conversions for every subsystem error type, so driver code can use `?`
//! freely while each subsystem keeps its own narrow error type.

use thiserror::Error;

use crate::client::ClientError;
use crate::collaborators::StoreError;
use crate::file_dispatcher::FileDispatchError;
use crate::queue::QueueError;
use crate::submission_dispatcher::SubmissionDispatchError;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("queue: {0}")]
    Queue(#[from] QueueError),

    #[error("submission dispatch: {0}")]
    Submission(#[from] SubmissionDispatchError),

    #[error("file dispatch: {0}")]
    File(#[from] FileDispatchError),

    #[error("client: {0}")]
    Client(#[from] ClientError),

    #[error("config: {0}")]
    Config(#[from] anyhow::Error),
}
