use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::ids::ServiceName;

/// A pure function of `(file_type, submission.params)` — `schedules[file_hash]`
/// in the spec's dispatch table. Stages run strictly in order; the services
/// within a stage are unordered and may dispatch concurrently.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub stages: Vec<Stage>,
}

pub type Stage = BTreeSet<ServiceName>;

impl Schedule {
    pub fn is_empty(&self) -> bool {
        self.stages.iter().all(|s| s.is_empty())
    }
}

/// Per-service execution policy resolved by the scheduler from platform
/// config plus any submission-level overrides.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceProfile {
    pub timeout_secs: u64,
    pub failure_limit: u32,
    #[serde(default)]
    pub config: serde_json::Value,
}
