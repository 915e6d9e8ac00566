//! Named queues, grounded on the `mpsc::channel::<ChainMessage>(SUBMISSION_CHANNEL_SIZE)`
//! wiring in the teacher's `packages/wavs/src/dispatcher.rs`. Spec.md §6
//! names queues by string (`submission`, `dispatch-file`,
//! `service-queue-<name>`, `D-<uuid>-WQ`); this registry maps those names
//! to `tokio::sync::mpsc` channels so driver code can push/pop without
//! knowing whether a queue already exists.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue {0} is closed")]
    Closed(String),
    #[error("failed to (de)serialize queue payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A single named, bounded, FIFO queue of JSON-serialized payloads.
/// Payloads are serialized on push so the registry can stay non-generic;
/// callers deserialize to the type they expect on pop.
pub struct Queue {
    name: String,
    tx: mpsc::Sender<serde_json::Value>,
    rx: Mutex<mpsc::Receiver<serde_json::Value>>,
}

impl Queue {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn push<T: Serialize>(&self, value: &T) -> Result<(), QueueError> {
        let value = serde_json::to_value(value)?;
        self.tx
            .send(value)
            .await
            .map_err(|_| QueueError::Closed(self.name.clone()))
    }

    /// Pops the next message, or `None` once every sender (and the
    /// registry's own handle) has been dropped and the channel drained.
    pub async fn pop<T: DeserializeOwned>(&self) -> Result<Option<T>, QueueError> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn try_pop<T: DeserializeOwned>(&self) -> Result<Option<T>, QueueError> {
        let mut rx = self.rx.lock().await;
        match rx.try_recv() {
            Ok(value) => Ok(Some(serde_json::from_value(value)?)),
            Err(_) => Ok(None),
        }
    }
}

/// Registry of named queues, created on first reference. Grounded on the
/// `DashMap`-backed scheduler state in
/// `packages/wavs/src/trigger_manager/schedulers/block_scheduler.rs` — a
/// shared concurrent map is the teacher's idiom for process-wide registries
/// that many driver tasks touch without a central owner.
#[derive(Clone, Default)]
pub struct QueueRegistry {
    queues: Arc<DashMap<String, Arc<Queue>>>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the named queue, creating it with default capacity if it
    /// does not yet exist.
    pub fn get_or_create(&self, name: impl Into<String>) -> Arc<Queue> {
        let name = name.into();
        self.queues
            .entry(name.clone())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::channel(DEFAULT_QUEUE_CAPACITY);
                Arc::new(Queue {
                    name,
                    tx,
                    rx: Mutex::new(rx),
                })
            })
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.get(name).map(|q| q.clone())
    }

    /// Removes a queue outright — used by ephemeral watch-reply queues once
    /// their TTL expires (C4) rather than leaving them to linger forever.
    pub fn remove(&self, name: &str) {
        self.queues.remove(name);
    }

    pub async fn push<T: Serialize>(&self, name: &str, value: &T) -> Result<(), QueueError> {
        self.get_or_create(name).push(value).await
    }
}

pub const SUBMISSION_QUEUE: &str = "submission";
pub const FILE_QUEUE: &str = "dispatch-file";

pub fn service_queue_name(service: &str) -> String {
    format!("service-queue-{service}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_then_pop_round_trips() {
        let registry = QueueRegistry::new();
        registry
            .push("submission", &"sid-1".to_string())
            .await
            .unwrap();
        let queue = registry.get("submission").unwrap();
        let popped: Option<String> = queue.pop().await.unwrap();
        assert_eq!(popped, Some("sid-1".to_string()));
    }

    #[tokio::test]
    async fn unknown_queue_is_created_on_first_reference() {
        let registry = QueueRegistry::new();
        assert!(registry.get("nope").is_none());
        registry.get_or_create("nope");
        assert!(registry.get("nope").is_some());
    }
}
