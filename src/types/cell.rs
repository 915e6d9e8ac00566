use serde::{Deserialize, Serialize};

/// The status of a single `(file, service)` pair within a submission's
/// dispatch table. `Empty` is represented by the absence of a key rather
/// than a variant here — see `DispatchTable::cell`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state")]
pub enum StatusCell {
    Dispatched {
        dispatched_at: i64,
    },
    Finished {
        result_key: String,
        score: f64,
        drop: bool,
    },
    FailedRecoverable {
        attempts: u32,
    },
    FailedTerminal {
        error_key: String,
    },
}

impl StatusCell {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StatusCell::Finished { .. } | StatusCell::FailedTerminal { .. })
    }

    pub fn is_dispatched(&self) -> bool {
        matches!(self, StatusCell::Dispatched { .. })
    }

    /// `Some(drop)` when finished, `None` otherwise — a non-finished
    /// cell never truncates a schedule.
    pub fn drop_flag(&self) -> Option<bool> {
        match self {
            StatusCell::Finished { drop, .. } => Some(*drop),
            _ => None,
        }
    }
}
