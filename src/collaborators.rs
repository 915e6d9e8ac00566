//! Supplemented collaborator surface (SPEC_FULL.md §B): trait-shaped seams
//! for the document store, blob store, and result/error persistence that
//! spec.md treats as pure externals. Mock implementations are the only
//! ones shipped, grounded on `storage/memory.rs`'s `BTreeMap`-backed
//! `MemoryStorage` and named `Mock*` after `src/submission/mock.rs` /
//! `src/triggers/mock.rs` / `src/dispatcher/mock.rs`.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{FileHash, FileRecord, ServiceResult, Submission, SubmissionId};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("submission {0} not found")]
    SubmissionNotFound(SubmissionId),
    #[error("file {0} not found")]
    FileNotFound(FileHash),
}

/// Persistence for submissions, results, and errors. A production
/// implementation is an external collaborator (spec.md §1); this crate
/// only depends on the trait.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get_submission(&self, sid: &SubmissionId) -> Result<Submission, StoreError>;
    async fn put_submission(&self, submission: &Submission) -> Result<(), StoreError>;

    async fn put_result(&self, key: &str, result: &ServiceResult) -> Result<(), StoreError>;
    async fn get_result(&self, key: &str) -> Result<Option<ServiceResult>, StoreError>;

    /// Terminal error lookup for `_find_results` step 2 (§4.6.1).
    async fn find_terminal_error(
        &self,
        sid: &SubmissionId,
        file_hash: &FileHash,
        service: &str,
    ) -> Result<Option<String>, StoreError>;

    /// Non-terminal (recoverable) error count for `_find_results` step 3.
    async fn count_recoverable_errors(
        &self,
        sid: &SubmissionId,
        file_hash: &FileHash,
        service: &str,
    ) -> Result<u32, StoreError>;

    async fn put_error(
        &self,
        sid: &SubmissionId,
        file_hash: &FileHash,
        service: &str,
        terminal: bool,
        error_id: &str,
        message: &str,
    ) -> Result<(), StoreError>;
}

/// File-existence and metadata lookups for the blob store (§4.5 step 3).
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn has_file(&self, file_hash: &FileHash) -> bool;
    async fn file_record(&self, file_hash: &FileHash) -> Option<FileRecord>;
}

#[derive(Default)]
pub struct MockDocumentStore {
    submissions: Mutex<HashMap<SubmissionId, Submission>>,
    results: Mutex<HashMap<String, ServiceResult>>,
    errors: Mutex<HashMap<(SubmissionId, FileHash, String), Vec<(bool, String, String)>>>,
}

impl MockDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_submission(&self, submission: Submission) {
        self.submissions
            .lock()
            .unwrap()
            .insert(submission.sid.clone(), submission);
    }
}

#[async_trait]
impl DocumentStore for MockDocumentStore {
    async fn get_submission(&self, sid: &SubmissionId) -> Result<Submission, StoreError> {
        self.submissions
            .lock()
            .unwrap()
            .get(sid)
            .cloned()
            .ok_or_else(|| StoreError::SubmissionNotFound(sid.clone()))
    }

    async fn put_submission(&self, submission: &Submission) -> Result<(), StoreError> {
        self.submissions
            .lock()
            .unwrap()
            .insert(submission.sid.clone(), submission.clone());
        Ok(())
    }

    async fn put_result(&self, key: &str, result: &ServiceResult) -> Result<(), StoreError> {
        self.results
            .lock()
            .unwrap()
            .insert(key.to_string(), result.clone());
        Ok(())
    }

    async fn get_result(&self, key: &str) -> Result<Option<ServiceResult>, StoreError> {
        Ok(self.results.lock().unwrap().get(key).cloned())
    }

    async fn find_terminal_error(
        &self,
        sid: &SubmissionId,
        file_hash: &FileHash,
        service: &str,
    ) -> Result<Option<String>, StoreError> {
        let key = (sid.clone(), file_hash.clone(), service.to_string());
        let guard = self.errors.lock().unwrap();
        Ok(guard
            .get(&key)
            .and_then(|errs| errs.iter().find(|(terminal, _, _)| *terminal))
            .map(|(_, id, _)| id.clone()))
    }

    async fn count_recoverable_errors(
        &self,
        sid: &SubmissionId,
        file_hash: &FileHash,
        service: &str,
    ) -> Result<u32, StoreError> {
        let key = (sid.clone(), file_hash.clone(), service.to_string());
        let guard = self.errors.lock().unwrap();
        Ok(guard
            .get(&key)
            .map(|errs| errs.iter().filter(|(terminal, _, _)| !terminal).count() as u32)
            .unwrap_or(0))
    }

    async fn put_error(
        &self,
        sid: &SubmissionId,
        file_hash: &FileHash,
        service: &str,
        terminal: bool,
        error_id: &str,
        message: &str,
    ) -> Result<(), StoreError> {
        let key = (sid.clone(), file_hash.clone(), service.to_string());
        self.errors
            .lock()
            .unwrap()
            .entry(key)
            .or_default()
            .push((terminal, error_id.to_string(), message.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct MockBlobStore {
    files: Mutex<HashMap<FileHash, FileRecord>>,
}

impl MockBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, record: FileRecord) {
        self.files.lock().unwrap().insert(record.file_hash.clone(), record);
    }
}

#[async_trait]
impl BlobStore for MockBlobStore {
    async fn has_file(&self, file_hash: &FileHash) -> bool {
        self.files.lock().unwrap().contains_key(file_hash)
    }

    async fn file_record(&self, file_hash: &FileHash) -> Option<FileRecord> {
        self.files.lock().unwrap().get(file_hash).cloned()
    }
}
