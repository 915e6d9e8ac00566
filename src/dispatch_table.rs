//! C1 — Dispatch Table: per-submission keyed store of `(file, service)` →
//! `StatusCell`, plus the per-file schedule cache.
//!
//! Grounded on the `KVStorage`/`Table<K,V>` abstraction in
//! `src/storage/prelude.rs` (the teacher's keyed get/set seam over
//! `redb`), generalized here to the in-process `DashMap`-backed "remote
//! datatypes" shared store spec.md §3 describes — the same substitution
//! the teacher performs between `MemoryStorage` and `RedbStorage` behind
//! one trait. Every mutator below is a single `DashMap` entry operation,
//! which is how the spec's "server-side atomic primitives" requirement
//! (§4.1, invariant 3) is satisfied without an external lock.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;

use crate::types::{FileHash, Schedule, ServiceName, StatusCell, SubmissionId};

#[derive(Error, Debug)]
pub enum DispatchTableError {
    #[error("no dispatch table for submission {0}")]
    NotFound(SubmissionId),
}

#[derive(Default)]
struct FileCells {
    cells: HashMap<ServiceName, StatusCell>,
}

/// The per-submission table. Not `Clone` — shared via `Arc` from the
/// registry below, matching the `Arc<RedbStorage>` handle pattern in
/// `packages/wavs/src/dispatcher.rs`.
#[derive(Default)]
pub struct DispatchTable {
    cells: DashMap<FileHash, FileCells>,
    schedules: DashMap<FileHash, Schedule>,
    dispatch_count: std::sync::atomic::AtomicU64,
    finished_count: std::sync::atomic::AtomicU64,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// §4.1: set `Dispatched{now}`, increment `dispatch_count`. Idempotent
    /// on repeat — re-dispatch after a timeout just refreshes the
    /// timestamp and does not double-count. `dispatch_count` tracks cells
    /// ever dispatched, not dispatch *events*: a cell that goes
    /// Dispatched → FailedRecoverable → Dispatched (a retry) is counted
    /// once, which is what invariant 2 (`all_finished ⇒ dispatch_count ==
    /// finished_count`) requires.
    pub fn dispatch(&self, file: &FileHash, service: &ServiceName, now: i64) {
        let mut entry = self.cells.entry(file.clone()).or_default();
        let already_counted = entry.cells.contains_key(service);
        entry
            .cells
            .insert(service.clone(), StatusCell::Dispatched { dispatched_at: now });
        if !already_counted {
            self.dispatch_count
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    /// §4.1: timestamp of the current `Dispatched` cell, or 0.
    pub fn dispatch_time(&self, file: &FileHash, service: &ServiceName) -> i64 {
        self.cells
            .get(file)
            .and_then(|f| f.cells.get(service).cloned())
            .and_then(|cell| match cell {
                StatusCell::Dispatched { dispatched_at } => Some(dispatched_at),
                _ => None,
            })
            .unwrap_or(0)
    }

    /// §4.1: atomic write of `Finished`; returns the count of cells in this
    /// submission still not terminal, so callers can decide whether to
    /// trigger a finalize check without a second read (invariant 3).
    pub fn finish(
        &self,
        file: &FileHash,
        service: &ServiceName,
        result_key: String,
        score: f64,
        drop: bool,
    ) -> u64 {
        let mut entry = self.cells.entry(file.clone()).or_default();
        let already_terminal = entry
            .cells
            .get(service)
            .is_some_and(StatusCell::is_terminal);
        entry.cells.insert(
            service.clone(),
            StatusCell::Finished {
                result_key,
                score,
                drop,
            },
        );
        std::mem::drop(entry);
        if !already_terminal {
            self.finished_count
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
        let dispatched = self.dispatch_count.load(std::sync::atomic::Ordering::SeqCst);
        let finished = self.finished_count.load(std::sync::atomic::Ordering::SeqCst);
        dispatched.saturating_sub(finished)
    }

    /// §4.1: increment attempts without marking terminal. Returns the new
    /// attempt count so the caller can compare against
    /// `service_failure_limit` and escalate.
    pub fn fail_recoverable(&self, file: &FileHash, service: &ServiceName) -> u32 {
        let mut entry = self.cells.entry(file.clone()).or_default();
        let attempts = match entry.cells.get(service) {
            Some(StatusCell::FailedRecoverable { attempts }) => attempts + 1,
            _ => 1,
        };
        entry
            .cells
            .insert(service.clone(), StatusCell::FailedRecoverable { attempts });
        attempts
    }

    /// §4.1: set `FailedTerminal{error_key}`; increments `finished_count`.
    pub fn fail_nonrecoverable(&self, file: &FileHash, service: &ServiceName, error_key: String) {
        let mut entry = self.cells.entry(file.clone()).or_default();
        let already_terminal = entry
            .cells
            .get(service)
            .is_some_and(StatusCell::is_terminal);
        entry
            .cells
            .insert(service.clone(), StatusCell::FailedTerminal { error_key });
        drop(entry);
        if !already_terminal {
            self.finished_count
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    pub fn cell(&self, file: &FileHash, service: &ServiceName) -> Option<StatusCell> {
        self.cells.get(file).and_then(|f| f.cells.get(service).cloned())
    }

    /// §4.1: `finished(file, service)` — the cached result key, the
    /// `"errors"` sentinel, or `None` if not yet terminal.
    pub fn finished(&self, file: &FileHash, service: &ServiceName) -> Option<String> {
        match self.cell(file, service)? {
            StatusCell::Finished { result_key, .. } => Some(result_key),
            StatusCell::FailedTerminal { .. } => Some("errors".to_string()),
            _ => None,
        }
    }

    pub fn dropped(&self, file: &FileHash, service: &ServiceName) -> bool {
        matches!(self.cell(file, service), Some(StatusCell::Finished { drop: true, .. }))
    }

    pub fn all_results(&self) -> HashMap<FileHash, HashMap<ServiceName, StatusCell>> {
        self.cells
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().cells.clone()))
            .collect()
    }

    /// §4.1: `finished_count == dispatch_count ∧ no cell is Empty within any
    /// file's schedule`.
    pub fn all_finished(&self) -> bool {
        let dispatched = self.dispatch_count.load(std::sync::atomic::Ordering::SeqCst);
        let finished = self.finished_count.load(std::sync::atomic::Ordering::SeqCst);
        if finished != dispatched {
            return false;
        }
        for schedule_entry in self.schedules.iter() {
            let file = schedule_entry.key();
            for stage in &schedule_entry.value().stages {
                let mut stage_dropped = false;
                for service in stage {
                    match self.cell(file, service) {
                        Some(cell) if cell.is_terminal() => {
                            if let Some(true) = cell.drop_flag() {
                                stage_dropped = true;
                            }
                        }
                        Some(StatusCell::FailedRecoverable { .. }) => return false,
                        Some(StatusCell::Dispatched { .. }) => return false,
                        None => return false,
                        Some(StatusCell::Finished { .. }) | Some(StatusCell::FailedTerminal { .. }) => {}
                    }
                }
                if stage_dropped {
                    break;
                }
            }
        }
        true
    }

    pub fn dispatch_count(&self) -> u64 {
        self.dispatch_count.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn finished_count(&self) -> u64 {
        self.finished_count.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn schedule(&self, file: &FileHash) -> Option<Schedule> {
        self.schedules.get(file).map(|s| s.clone())
    }

    /// All files with a cached schedule — used by `outstanding_services`
    /// (§4.7) to walk every file known to this submission.
    pub fn files(&self) -> Vec<FileHash> {
        self.schedules.iter().map(|e| e.key().clone()).collect()
    }

    /// §3 invariant 2: written once, read many; callers must not call this
    /// a second time for the same file with a different schedule.
    pub fn set_schedule(&self, file: FileHash, schedule: Schedule) {
        self.schedules.entry(file).or_insert(schedule);
    }
}

/// Process-wide registry of live dispatch tables, keyed by `sid`, standing
/// in for the shared `dispatch-hash:<sid>` key spec.md §6 names. Lazily
/// created on first write, removed on finalize (§3's ownership rule).
#[derive(Clone, Default)]
pub struct DispatchTableRegistry {
    tables: Arc<DashMap<SubmissionId, Arc<DispatchTable>>>,
}

impl DispatchTableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, sid: &SubmissionId) -> Arc<DispatchTable> {
        self.tables
            .entry(sid.clone())
            .or_insert_with(|| Arc::new(DispatchTable::new()))
            .clone()
    }

    pub fn get(&self, sid: &SubmissionId) -> Option<Arc<DispatchTable>> {
        self.tables.get(sid).map(|t| t.clone())
    }

    /// §4.1 `delete()`, invariant 3: "after finalize, `dispatch-hash:<sid>`
    /// is absent."
    pub fn delete(&self, sid: &SubmissionId) {
        self.tables.remove(sid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svc(name: &str) -> ServiceName {
        ServiceName::new_unchecked(name)
    }

    #[test]
    fn dispatch_then_finish_updates_counters() {
        let table = DispatchTable::new();
        let file = FileHash::new("abc");
        table.dispatch(&file, &svc("s1"), 100);
        assert_eq!(table.dispatch_count(), 1);
        assert_eq!(table.dispatch_time(&file, &svc("s1")), 100);

        let remaining = table.finish(&file, &svc("s1"), "r1".into(), 10.0, false);
        assert_eq!(remaining, 0);
        assert_eq!(table.finished_count(), 1);
        assert_eq!(table.finished(&file, &svc("s1")), Some("r1".to_string()));
    }

    #[test]
    fn redispatch_does_not_double_count() {
        let table = DispatchTable::new();
        let file = FileHash::new("abc");
        table.dispatch(&file, &svc("s1"), 100);
        table.dispatch(&file, &svc("s1"), 200);
        assert_eq!(table.dispatch_count(), 1);
        assert_eq!(table.dispatch_time(&file, &svc("s1")), 200);
    }

    #[test]
    fn fail_recoverable_then_terminal_counts_once() {
        let table = DispatchTable::new();
        let file = FileHash::new("abc");
        assert_eq!(table.fail_recoverable(&file, &svc("s1")), 1);
        assert_eq!(table.fail_recoverable(&file, &svc("s1")), 2);
        table.fail_nonrecoverable(&file, &svc("s1"), "e3".into());
        assert_eq!(table.finished_count(), 1);
        assert_eq!(table.finished(&file, &svc("s1")), Some("errors".to_string()));
    }

    #[test]
    fn duplicate_finish_is_a_no_op_for_counters() {
        let table = DispatchTable::new();
        let file = FileHash::new("abc");
        table.dispatch(&file, &svc("s1"), 100);
        table.finish(&file, &svc("s1"), "r1".into(), 10.0, false);
        table.finish(&file, &svc("s1"), "r1".into(), 10.0, false);
        assert_eq!(table.finished_count(), 1);
    }
}
