use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::ids::{FileHash, ServiceName, SubmissionId};

/// A user-initiated analysis job, as persisted by the (external) document
/// store before the core ever sees it. The core only reads `files` and
/// `params`; everything else is carried through to the completed queue.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Submission {
    pub sid: SubmissionId,
    pub submitter: String,
    pub files: Vec<FileHash>,
    pub params: SubmissionParams,
    #[serde(default)]
    pub state: SubmissionState,
    #[serde(default)]
    pub max_score: f64,
    #[serde(default)]
    pub error_count: u32,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub file_count: u32,
    #[serde(default)]
    pub classification: Option<String>,
    /// `times.completed` in spec.md §4.5 finalize; set once, on finalize.
    #[serde(default)]
    pub completed_at: Option<i64>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionState {
    #[default]
    Submitted,
    Completed,
}

/// Submission-level parameters consulted by the scheduler and the
/// extraction-depth guard.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubmissionParams {
    #[serde(default)]
    pub max_extraction_depth: Option<u32>,
    #[serde(default)]
    pub ignore_filtering: bool,
    #[serde(default)]
    pub service_selection: Option<Vec<ServiceName>>,
}

/// Envelope pushed onto the submission queue. `completed_queue`, when set,
/// receives the aggregated submission on finalize (§6 of the spec).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubmissionTask {
    pub sid: SubmissionId,
    pub submission: Submission,
    #[serde(default)]
    pub completed_queue: Option<String>,
}

/// Envelope pushed onto the file queue, one per file awaiting (re-)evaluation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileTask {
    pub sid: SubmissionId,
    pub file_hash: FileHash,
    pub file_type: String,
    pub depth: u32,
    #[serde(default)]
    pub parent_hash: Option<FileHash>,
}

/// Envelope pushed onto a per-service queue, carrying the service's
/// resolved config so workers don't need to re-derive it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceTask {
    pub sid: SubmissionId,
    pub file_hash: FileHash,
    pub file_type: String,
    pub depth: u32,
    pub service_name: ServiceName,
    pub service_config: serde_json::Value,
    /// fingerprint of `service_config`, precomputed so `service_finished`
    /// doesn't need to recompute it to build the result cache key.
    pub config_key: String,
}

/// The payload a worker hands back to `Client::service_finished`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceResult {
    pub score: f64,
    pub drop: bool,
    #[serde(default)]
    pub classification: Option<String>,
    #[serde(default)]
    pub extracted: Vec<FileHash>,
    pub body: serde_json::Value,
}

/// The payload a worker hands back to `Client::service_failed`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceError {
    pub status: FailureStatus,
    pub message: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureStatus {
    FailRecoverable,
    FailNonrecoverable,
}

/// A file's metadata as known to the file store, enough for the schedule
/// to be computed and for extracted children to be re-enqueued.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileRecord {
    pub file_hash: FileHash,
    pub file_type: String,
}

/// The final payload pushed to a submission's `completed_queue`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompletedNotice {
    pub sid: SubmissionId,
    pub state: SubmissionState,
    pub max_score: f64,
    pub error_count: u32,
    pub errors: Vec<String>,
    pub file_count: u32,
    pub classification: Option<String>,
    pub results: HashMap<String, serde_json::Value>,
}
