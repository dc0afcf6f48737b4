//! Project declarations.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default trigger poll interval in seconds.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;

/// Declaration of a buildable project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectDefinition {
    /// Project name.
    pub name: String,
    /// Queue the project's requests go to. `None` means a queue named after
    /// the project itself.
    pub queue: Option<String>,
    /// Position within the queue; lower values sort earlier.
    pub queue_priority: u32,
    /// Seconds between trigger evaluations.
    pub poll_interval_secs: u64,
    /// Command the build runner executes for this project, if any.
    pub build_command: Option<String>,
}

impl ProjectDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue: None,
            queue_priority: 0,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            build_command: None,
        }
    }

    /// Effective queue name for this project.
    pub fn queue_name(&self) -> &str {
        self.queue.as_deref().unwrap_or(&self.name)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}
