//! Queue declarations and the duplicate-handling policy.

use serde::{Deserialize, Serialize};

use crate::BuildCondition;

/// How a queue merges a new request for a project that is already queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DuplicatePolicy {
    /// The first request wins; later requests are discarded.
    #[default]
    UseFirst,
    /// A higher-priority request overwrites the pending one in place.
    Replace,
    /// A higher-priority request is removed and re-queued at its
    /// priority-ordered position with a fresh sequence number.
    ReAdd,
    /// A higher-priority request is removed and re-queued at the very front
    /// of the queue, ahead of priority ordering.
    ReAddTop,
}

impl std::str::FromStr for DuplicatePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "use-first" => Ok(DuplicatePolicy::UseFirst),
            "replace" => Ok(DuplicatePolicy::Replace),
            "re-add" => Ok(DuplicatePolicy::ReAdd),
            "re-add-top" => Ok(DuplicatePolicy::ReAddTop),
            other => Err(format!("unknown duplicate policy: {other}")),
        }
    }
}

/// What a queue should do with an incoming request for an already-queued
/// project.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateDecision {
    /// Drop the incoming request; the pending one stays untouched.
    Discard,
    /// Overwrite the pending request in place (same position and sequence).
    Replace,
    /// Remove the pending item and insert the incoming request at its
    /// priority-ordered position with a fresh sequence.
    ReinsertAtPriority,
    /// Remove the pending item and insert the incoming request at the front
    /// of the queue.
    ReinsertAtTop,
}

/// Resolve what to do with an incoming request when the project already has a
/// pending one.
///
/// An incoming request that does not raise the pending condition is always
/// discarded: a modification-triggered request must never downgrade a pending
/// force build.
pub fn resolve_duplicate(
    pending: BuildCondition,
    incoming: BuildCondition,
    policy: DuplicatePolicy,
) -> DuplicateDecision {
    if incoming <= pending {
        return DuplicateDecision::Discard;
    }
    match policy {
        DuplicatePolicy::UseFirst => DuplicateDecision::Discard,
        DuplicatePolicy::Replace => DuplicateDecision::Replace,
        DuplicatePolicy::ReAdd => DuplicateDecision::ReinsertAtPriority,
        DuplicatePolicy::ReAddTop => DuplicateDecision::ReinsertAtTop,
    }
}

/// Declaration of a named build queue.
///
/// Projects default to a queue named after themselves; declarations exist to
/// share a queue between projects, bound its size, or lock it against others.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueDefinition {
    /// Queue name.
    pub name: String,
    /// Duplicate-handling policy.
    pub duplicates: DuplicatePolicy,
    /// Names of queues this one mutually excludes with (itself implied).
    pub lock_queues: Vec<String>,
    /// Maximum number of queued items. `None` means unbounded.
    pub max_size: Option<usize>,
}

impl QueueDefinition {
    /// A queue with default settings, as implied by a project that does not
    /// declare one.
    pub fn implicit(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            duplicates: DuplicatePolicy::default(),
            lock_queues: Vec::new(),
            max_size: None,
        }
    }
}
