//! Read-only snapshots of queue and project state.
//!
//! Snapshots are defensive copies built for remote reporting: mutating one
//! never affects live scheduler state, and a later snapshot is unaffected by
//! what a client did with an earlier one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::BuildCondition;
use crate::integration::{IntegratorState, ProjectActivity};

/// Point-in-time view of every configured queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueSetSnapshot {
    /// One entry per configured queue, in alphabetical order.
    pub queues: Vec<QueueSnapshot>,
}

impl QueueSetSnapshot {
    /// Find a queue by name.
    pub fn queue(&self, name: &str) -> Option<&QueueSnapshot> {
        self.queues.iter().find(|q| q.queue_name == name)
    }
}

/// Point-in-time view of one queue's contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// Queue name.
    pub queue_name: String,
    /// Queued requests in service order (head first).
    pub requests: Vec<QueuedRequestSnapshot>,
}

impl QueueSnapshot {
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

/// One queued request as reported to remote clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedRequestSnapshot {
    /// Project the request belongs to.
    pub project_name: String,
    /// Queue priority of the project (lower serves earlier).
    pub priority: u32,
    /// Requested build condition.
    pub condition: BuildCondition,
    /// Trigger or remote source that raised the request.
    pub source: String,
    /// When the request was raised.
    pub requested_at: DateTime<Utc>,
}

/// Point-in-time view of one project's scheduling loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectStatusSnapshot {
    /// Project name.
    pub name: String,
    /// Queue the project's requests go to.
    pub queue_name: String,
    /// Loop lifecycle state.
    pub state: IntegratorState,
    /// Current activity.
    pub activity: ProjectActivity,
    /// When the project's trigger next expects to fire, if it is scheduled.
    pub next_build: Option<DateTime<Utc>>,
}

/// Full server status: queues plus per-project state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerSnapshot {
    /// Queue contents.
    pub queue_set: QueueSetSnapshot,
    /// Per-project scheduling state, in alphabetical order.
    pub projects: Vec<ProjectStatusSnapshot>,
}
