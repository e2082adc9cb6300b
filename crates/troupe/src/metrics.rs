use serde::{Deserialize, Serialize};
use std::fmt;

/// Point-in-time view of the dispatcher, taken on the command loop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherStats {
    /// Objects with no turn in progress
    pub idle: usize,
    /// Objects with a turn in progress or a backlog
    pub busy: usize,
    /// Objects removed while still holding accepted work
    pub dying: usize,
    /// Posts and revisits waiting for a free worker
    pub global_queue: usize,
    /// Delayed messages not yet delivered or cancelled
    pub delayed: usize,
    /// Size of the worker pool
    pub workers: usize,
    pub busy_workers: usize,
    pub shutting_down: bool,
}

impl DispatcherStats {
    pub fn objects(&self) -> usize {
        self.idle + self.busy
    }
}

impl fmt::Display for DispatcherStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{:?}", self),
        }
    }
}
