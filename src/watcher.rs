//! C3 — Watcher: a keyed deadline timer. `touch(key, timeout, queue,
//! message)` means "if nobody calls `touch(key, …)` again within `timeout`,
//! push `message` onto `queue`." This is the sole mechanism by which a
//! dispatcher re-schedules itself without polling (§4.3).
//!
//! Grounded on the teacher's `AppContext` kill-switch pattern
//! (`src/context.rs`'s `broadcast::Sender<()>` plus a spawned task that
//! `select!`s on it) and the interval-scheduler shape in
//! `packages/wavs/src/trigger_manager/schedulers/cron_scheduler.rs`
//! (`Arc<Mutex<IntervalScheduler<...>>>` guarding per-key deadline state).
//! Each `touch` bumps a per-key deadline in a `DashMap`; a single
//! background task wakes on the nearest deadline and fires expired keys.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::queue::QueueRegistry;

struct Watch {
    deadline: tokio::time::Instant,
    queue: String,
    message: serde_json::Value,
}

/// Background deadline-timer service. One instance is shared by every
/// submission and file dispatcher in the process (and, since the shared
/// state that matters — the watch deadlines — lives in this struct rather
/// than per-driver state, multiple dispatcher instances each run their own
/// `Watcher` without needing to agree on anything beyond the queue names
/// they both read from).
#[derive(Clone)]
pub struct Watcher {
    watches: Arc<DashMap<String, Watch>>,
    queues: QueueRegistry,
    tick: Duration,
}

impl Watcher {
    pub fn new(queues: QueueRegistry) -> Self {
        Self {
            watches: Arc::new(DashMap::new()),
            queues,
            tick: Duration::from_secs(1),
        }
    }

    /// §4.3 `touch(key, timeout, queue, message)`.
    pub fn touch<T: Serialize>(&self, key: &str, timeout: Duration, queue: &str, message: &T) {
        let message = serde_json::to_value(message).expect("watch message must serialize");
        self.watches.insert(
            key.to_string(),
            Watch {
                deadline: tokio::time::Instant::now() + timeout,
                queue: queue.to_string(),
                message,
            },
        );
    }

    /// Cancels a watch outright — used by finalize (§4.3 "Cancellation:
    /// finalize deletes the watch").
    pub fn cancel(&self, key: &str) {
        self.watches.remove(key);
    }

    /// Spawns the background sweep loop onto `ctx`'s runtime. Exits when
    /// the kill-switch fires, matching the `select! { kill_receiver.recv()
    /// => ..., else => { ... } }` shutdown shape in `src/submission/core.rs`.
    pub fn spawn(&self, rt: &tokio::runtime::Handle, mut kill: broadcast::Receiver<()>) {
        let watcher = self.clone();
        rt.spawn(async move {
            let mut interval = tokio::time::interval(watcher.tick);
            loop {
                tokio::select! {
                    _ = kill.recv() => {
                        tracing::info!("watcher shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        watcher.sweep().await;
                    }
                }
            }
        });
    }

    async fn sweep(&self) {
        let now = tokio::time::Instant::now();
        let expired: Vec<(String, String, serde_json::Value)> = self
            .watches
            .iter()
            .filter(|entry| entry.value().deadline <= now)
            .map(|entry| {
                (
                    entry.key().clone(),
                    entry.value().queue.clone(),
                    entry.value().message.clone(),
                )
            })
            .collect();

        for (key, queue, message) in expired {
            tracing::debug!(watch_key = %key, %queue, "watch expired, re-enqueuing");
            if let Err(err) = self.queues.push(&queue, &message).await {
                tracing::warn!(watch_key = %key, %err, "failed to re-enqueue expired watch");
            }
            self.watches.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn expired_watch_re_enqueues_message() {
        let queues = QueueRegistry::new();
        let watcher = Watcher::new(queues.clone());
        watcher.touch("sid-1", Duration::from_millis(10), "submission", &"sid-1".to_string());

        tokio::time::sleep(Duration::from_millis(20)).await;
        watcher.sweep().await;

        let queue = queues.get("submission").unwrap();
        let popped: Option<String> = queue.try_pop().await.unwrap();
        assert_eq!(popped, Some("sid-1".to_string()));
    }

    #[tokio::test]
    async fn touch_before_expiry_prevents_fire() {
        let queues = QueueRegistry::new();
        let watcher = Watcher::new(queues.clone());
        watcher.touch("sid-1", Duration::from_millis(50), "submission", &"sid-1".to_string());
        watcher.touch("sid-1", Duration::from_millis(50), "submission", &"sid-1".to_string());
        watcher.sweep().await;

        let queue = queues.get_or_create("submission");
        let popped: Option<String> = queue.try_pop().await.unwrap();
        assert_eq!(popped, None);
    }

    #[tokio::test]
    async fn cancel_prevents_fire() {
        let queues = QueueRegistry::new();
        let watcher = Watcher::new(queues.clone());
        watcher.touch("sid-1", Duration::from_millis(1), "submission", &"sid-1".to_string());
        watcher.cancel("sid-1");
        tokio::time::sleep(Duration::from_millis(5)).await;
        watcher.sweep().await;

        let queue = queues.get_or_create("submission");
        let popped: Option<String> = queue.try_pop().await.unwrap();
        assert_eq!(popped, None);
    }
}
