//! Named build-request queues.

use std::collections::HashSet;

use tracing::debug;

use drydock_core::queue::{DuplicateDecision, QueueDefinition, resolve_duplicate};
use drydock_core::snapshot::{QueueSnapshot, QueuedRequestSnapshot};
use drydock_core::{Error, IntegrationRequest, Result};

/// A request bound to a project, waiting in a queue.
#[derive(Debug, Clone)]
pub struct QueueItem {
    project: String,
    priority: u32,
    sequence: u64,
    request: IntegrationRequest,
}

impl QueueItem {
    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn request(&self) -> &IntegrationRequest {
        &self.request
    }

    pub fn into_request(self) -> IntegrationRequest {
        self.request
    }
}

/// What `BuildQueue::enqueue` did with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new item was queued.
    Added,
    /// The pending item's request was overwritten in place.
    Replaced,
    /// The pending item was removed and the request queued afresh.
    Requeued,
    /// The request was dropped; the pending item stays as it was.
    Discarded,
}

/// An ordered collection of queued requests sharing one queue name.
///
/// Items are served head-first. Ordering is (priority ascending, sequence
/// ascending), so equal-priority items are FIFO; the re-add-top duplicate
/// policy may place an item at the front outside that ordering.
///
/// The queue is plain data. All synchronization lives in the manager that
/// owns it.
#[derive(Debug)]
pub struct BuildQueue {
    definition: QueueDefinition,
    /// Queues this one mutually excludes with, own name included.
    lock_group: HashSet<String>,
    items: Vec<QueueItem>,
    next_sequence: u64,
}

impl BuildQueue {
    pub fn new(definition: QueueDefinition) -> Self {
        let mut lock_group: HashSet<String> = definition.lock_queues.iter().cloned().collect();
        lock_group.insert(definition.name.clone());
        Self {
            definition,
            lock_group,
            items: Vec::new(),
            next_sequence: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn lock_group(&self) -> &HashSet<String> {
        &self.lock_group
    }

    /// Record that `other` locks this queue. Lock relationships are mutual;
    /// the manager calls this to mirror declarations made on other queues.
    pub(crate) fn add_lock(&mut self, other: impl Into<String>) {
        self.lock_group.insert(other.into());
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn head(&self) -> Option<&QueueItem> {
        self.items.first()
    }

    pub fn contains_project(&self, project: &str) -> bool {
        self.items.iter().any(|item| item.project == project)
    }

    /// Queue a request for `project`, applying the duplicate policy when the
    /// project already has a pending item.
    ///
    /// A full queue rejects the request outright, before duplicate handling.
    pub fn enqueue(
        &mut self,
        project: &str,
        priority: u32,
        request: IntegrationRequest,
    ) -> Result<EnqueueOutcome> {
        if let Some(max) = self.definition.max_size
            && self.items.len() >= max
        {
            return Err(Error::QueueFull {
                queue: self.definition.name.clone(),
                max,
            });
        }

        let Some(existing) = self.items.iter().position(|item| item.project == project) else {
            let sequence = self.take_sequence();
            self.insert_by_priority(QueueItem {
                project: project.to_string(),
                priority,
                sequence,
                request,
            });
            return Ok(EnqueueOutcome::Added);
        };

        let decision = resolve_duplicate(
            self.items[existing].request.condition(),
            request.condition(),
            self.definition.duplicates,
        );
        debug!(
            queue = %self.definition.name,
            project,
            ?decision,
            "merging duplicate request"
        );

        match decision {
            DuplicateDecision::Discard => Ok(EnqueueOutcome::Discarded),
            DuplicateDecision::Replace => {
                self.items[existing].request = request;
                Ok(EnqueueOutcome::Replaced)
            }
            DuplicateDecision::ReinsertAtPriority => {
                self.items.remove(existing);
                let sequence = self.take_sequence();
                self.insert_by_priority(QueueItem {
                    project: project.to_string(),
                    priority,
                    sequence,
                    request,
                });
                Ok(EnqueueOutcome::Requeued)
            }
            DuplicateDecision::ReinsertAtTop => {
                self.items.remove(existing);
                let item = QueueItem {
                    project: project.to_string(),
                    priority,
                    sequence: self.take_sequence(),
                    request,
                };
                self.items.insert(0, item);
                Ok(EnqueueOutcome::Requeued)
            }
        }
    }

    /// Remove and return the head item.
    pub fn pop_head(&mut self) -> Option<QueueItem> {
        if self.items.is_empty() {
            None
        } else {
            Some(self.items.remove(0))
        }
    }

    /// Remove `project`'s pending item, if any.
    pub fn remove_project(&mut self, project: &str) -> Option<QueueItem> {
        let index = self.items.iter().position(|item| item.project == project)?;
        Some(self.items.remove(index))
    }

    /// Deep copy of the queue contents for remote reporting.
    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            queue_name: self.definition.name.clone(),
            requests: self
                .items
                .iter()
                .map(|item| QueuedRequestSnapshot {
                    project_name: item.project.clone(),
                    priority: item.priority,
                    condition: item.request.condition(),
                    source: item.request.source().to_string(),
                    requested_at: item.request.requested_at(),
                })
                .collect(),
        }
    }

    fn take_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    /// Insert keeping (priority, sequence) order. The new item carries the
    /// largest sequence, so placing it after every item of equal priority
    /// preserves FIFO.
    fn insert_by_priority(&mut self, item: QueueItem) {
        let position = self
            .items
            .iter()
            .position(|existing| existing.priority > item.priority)
            .unwrap_or(self.items.len());
        self.items.insert(position, item);
    }
}
