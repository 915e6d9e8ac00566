//! The wiring that `DESIGN NOTES` §9 of spec.md asks for in place of the
//! source's module-level globals: "pass a `DispatcherContext` value
//! holding handles to the shared store, queues, datastore, and config;
//! construct once per process." Every driver (C5, C6) and the client
//! façade (C7) takes a `&DispatcherContext` rather than reaching for
//! statics.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;

use crate::collaborators::{BlobStore, DocumentStore};
use crate::config::Config;
use crate::dispatch_table::DispatchTableRegistry;
use crate::queue::QueueRegistry;
use crate::scheduler::Scheduler;
use crate::types::SubmissionId;
use crate::watch_registry::WatchRegistry;
use crate::watcher::Watcher;

/// `submissions-<submitter>` persistent hash of `sid -> iso-timestamp`
/// (spec.md §6), used for quota-hold refresh/release.
#[derive(Clone, Default)]
pub struct QuotaHash {
    by_submitter: Arc<DashMap<String, DashMap<SubmissionId, i64>>>,
}

impl QuotaHash {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refresh(&self, submitter: &str, sid: &SubmissionId, now: i64) {
        self.by_submitter
            .entry(submitter.to_string())
            .or_default()
            .insert(sid.clone(), now);
    }

    pub fn release(&self, submitter: &str, sid: &SubmissionId) {
        if let Some(set) = self.by_submitter.get(submitter) {
            set.remove(sid);
        }
    }

    pub fn outstanding(&self, submitter: &str) -> BTreeMap<SubmissionId, i64> {
        self.by_submitter
            .get(submitter)
            .map(|set| set.iter().map(|e| (e.key().clone(), *e.value())).collect())
            .unwrap_or_default()
    }
}

/// Remembers the `completed_queue` a submitter supplied on
/// `dispatch_submission` (§4.7), since the `submission` queue itself only
/// ever carries a bare `sid` once a dispatch pass is underway (spec.md §6
/// allows either shape; this crate settles on the bare-`sid` shape for
/// every re-drive and keeps the queue name here instead — see
/// DESIGN.md).
#[derive(Clone, Default)]
pub struct CompletedQueueRegistry {
    by_sid: Arc<DashMap<SubmissionId, String>>,
}

impl CompletedQueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, sid: &SubmissionId, queue_name: &str) {
        self.by_sid.insert(sid.clone(), queue_name.to_string());
    }

    /// Removes and returns the registered queue name, if any — called
    /// once by finalize.
    pub fn take(&self, sid: &SubmissionId) -> Option<String> {
        self.by_sid.remove(sid).map(|(_, name)| name)
    }
}

#[derive(Clone)]
pub struct DispatcherContext {
    pub tables: DispatchTableRegistry,
    pub scheduler: Scheduler,
    pub watcher: Watcher,
    pub watch_registry: WatchRegistry,
    pub queues: QueueRegistry,
    pub quota: QuotaHash,
    pub completed_queues: CompletedQueueRegistry,
    pub documents: Arc<dyn DocumentStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub config: Arc<Config>,
}

impl DispatcherContext {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
        config: Arc<Config>,
    ) -> Self {
        let queues = QueueRegistry::new();
        let watcher = Watcher::new(queues.clone());
        Self {
            tables: DispatchTableRegistry::new(),
            scheduler: Scheduler::new(config.scheduler_config()),
            watcher,
            watch_registry: WatchRegistry::new(),
            queues,
            quota: QuotaHash::new(),
            completed_queues: CompletedQueueRegistry::new(),
            documents,
            blobs,
            config,
        }
    }

    pub fn max_extraction_depth(&self, submission: &crate::types::Submission) -> u32 {
        submission
            .params
            .max_extraction_depth
            .unwrap_or(self.config.default_extraction_depth_limit)
    }
}

pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}
