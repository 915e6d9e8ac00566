//! C4 — Watch-Queue Registry: per-submission expiring set of ephemeral
//! reply queues that receive per-result notifications (§4.4). Grounded on
//! the same `DashMap`-backed registry idiom as [`crate::dispatch_table`]
//! and [`crate::queue`] — the teacher never names this exact collaborator,
//! but every shared, concurrently-touched set in the corpus (the block
//! scheduler's trigger sets) is a `DashMap`/`HashSet` pair, not a
//! hand-rolled lock.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::queue::QueueRegistry;
use crate::types::SubmissionId;

const WATCH_QUEUE_TTL: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WatchMessage {
    Start,
    Ok { cache_key: String },
    Fail { cache_key: String },
    Stop,
}

struct WatchEntry {
    expires_at: tokio::time::Instant,
}

/// Per-submission set of reply-queue names. Each queue has its own TTL
/// (refreshed whenever a reader calls [`WatchRegistry::touch`]); a dead
/// consumer's queue silently disappears from the next fan-out, per §4.4.
#[derive(Clone, Default)]
pub struct WatchRegistry {
    watchers: Arc<DashMap<SubmissionId, DashMap<String, WatchEntry>>>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a fresh ephemeral queue name and registers it for `sid`.
    pub fn new_queue_name() -> String {
        format!("D-{}-WQ", Uuid::now_v7())
    }

    pub fn register(&self, sid: &SubmissionId, queue_name: &str) {
        let set = self.watchers.entry(sid.clone()).or_default();
        set.insert(
            queue_name.to_string(),
            WatchEntry {
                expires_at: tokio::time::Instant::now() + WATCH_QUEUE_TTL,
            },
        );
    }

    /// Refreshes a queue's TTL — called by a consumer still reading it.
    pub fn touch(&self, sid: &SubmissionId, queue_name: &str) {
        if let Some(set) = self.watchers.get(sid) {
            if let Some(mut entry) = set.get_mut(queue_name) {
                entry.expires_at = tokio::time::Instant::now() + WATCH_QUEUE_TTL;
            }
        }
    }

    fn live_queues(&self, sid: &SubmissionId) -> Vec<String> {
        let now = tokio::time::Instant::now();
        match self.watchers.get(sid) {
            Some(set) => {
                let expired: Vec<String> = set
                    .iter()
                    .filter(|e| e.value().expires_at <= now)
                    .map(|e| e.key().clone())
                    .collect();
                for key in &expired {
                    set.remove(key);
                }
                set.iter().map(|e| e.key().clone()).collect()
            }
            None => vec![],
        }
    }

    /// §4.4: on every terminal status transition, fan out `{status,
    /// cache_key}` to every live queue registered for `sid`.
    pub async fn fan_out(&self, sid: &SubmissionId, queues: &QueueRegistry, message: &WatchMessage) {
        for name in self.live_queues(sid) {
            if let Err(err) = queues.push(&name, message).await {
                tracing::debug!(queue = %name, %err, "watch queue fan-out failed, dropping");
            }
        }
    }

    /// Drops the whole per-submission set — called by finalize after the
    /// `STOP` fan-out (§4.5 finalize, "then drop the set").
    pub fn drop_set(&self, sid: &SubmissionId) {
        self.watchers.remove(sid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fan_out_reaches_registered_queue() {
        let registry = WatchRegistry::new();
        let queues = QueueRegistry::new();
        let sid = SubmissionId::new("s1");
        let name = WatchRegistry::new_queue_name();
        registry.register(&sid, &name);

        registry
            .fan_out(&sid, &queues, &WatchMessage::Ok { cache_key: "r1".into() })
            .await;

        let queue = queues.get(&name).unwrap();
        let popped: Option<WatchMessage> = queue.try_pop().await.unwrap();
        assert!(matches!(popped, Some(WatchMessage::Ok { .. })));
    }

    #[tokio::test]
    async fn expired_queue_is_skipped_on_fan_out() {
        let registry = WatchRegistry::new();
        let queues = QueueRegistry::new();
        let sid = SubmissionId::new("s1");
        let name = WatchRegistry::new_queue_name();
        registry.watchers.entry(sid.clone()).or_default().insert(
            name.clone(),
            WatchEntry {
                expires_at: tokio::time::Instant::now(),
            },
        );
        tokio::time::sleep(Duration::from_millis(5)).await;

        registry
            .fan_out(&sid, &queues, &WatchMessage::Stop)
            .await;

        assert!(queues.get(&name).is_none() || {
            let queue = queues.get_or_create(&name);
            matches!(queue.try_pop::<WatchMessage>().await, Ok(None))
        });
    }
}
