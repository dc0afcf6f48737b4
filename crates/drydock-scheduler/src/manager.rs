//! The queue manager: request routing, activation, and cross-queue locking.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use drydock_config::ServerConfig;
use drydock_core::integration::{IntegratorState, ProjectActivity};
use drydock_core::project::ProjectDefinition;
use drydock_core::queue::QueueDefinition;
use drydock_core::snapshot::{ProjectStatusSnapshot, QueueSetSnapshot, ServerSnapshot};
use drydock_core::{Error, IntegrationRequest, Result};

use crate::integrator::ProjectIntegrator;
use crate::queue::BuildQueue;

/// Where a project's requests are routed.
#[derive(Debug, Clone)]
struct Registration {
    queue_name: String,
    priority: u32,
}

/// Shared mutable queue state. Critical sections are pure data manipulation;
/// nothing under this lock performs I/O or calls into collaborators.
struct ManagerState {
    /// Queue name -> queue. BTreeMap keeps iteration alphabetical.
    queues: BTreeMap<String, BuildQueue>,
    /// Project name -> routing registration.
    projects: HashMap<String, Registration>,
    /// Queue names currently holding their lock group.
    active: HashSet<String>,
}

/// Owns the named queues and routes build requests between projects and the
/// integrator loops.
///
/// Built once per configuration load and rebuilt wholesale on reload; it is
/// never reconfigured incrementally.
pub struct QueueManager {
    state: Mutex<ManagerState>,
    /// Attached integrator loops, kept apart from the queue state so control
    /// operations never contend with enqueue/activate critical sections.
    integrators: Mutex<HashMap<String, Arc<ProjectIntegrator>>>,
    /// Woken on every structural queue change and lock release.
    notify: Notify,
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager").finish_non_exhaustive()
    }
}

impl QueueManager {
    /// Build a manager from queue declarations and project definitions.
    ///
    /// Projects that reference an undeclared queue get an implicit queue with
    /// default settings, named after the queue they reference. Lock
    /// relationships are symmetrized: if Q1 declares `lock-queues "Q2"`, Q2
    /// excludes Q1 as well.
    pub fn new(queues: Vec<QueueDefinition>, projects: &[ProjectDefinition]) -> Result<Self> {
        let mut queue_map: BTreeMap<String, BuildQueue> = BTreeMap::new();
        for definition in queues {
            if queue_map.contains_key(&definition.name) {
                return Err(Error::Configuration(format!(
                    "queue '{}' is declared twice",
                    definition.name
                )));
            }
            queue_map.insert(definition.name.clone(), BuildQueue::new(definition));
        }

        let mut project_map: HashMap<String, Registration> = HashMap::new();
        for project in projects {
            let queue_name = project.queue_name().to_string();
            queue_map
                .entry(queue_name.clone())
                .or_insert_with(|| BuildQueue::new(QueueDefinition::implicit(queue_name.as_str())));
            let registration = Registration {
                queue_name,
                priority: project.queue_priority,
            };
            if project_map.insert(project.name.clone(), registration).is_some() {
                return Err(Error::Configuration(format!(
                    "project '{}' is declared twice",
                    project.name
                )));
            }
        }

        // Validate lock references against the full queue set, then mirror
        // them so exclusion holds in both directions.
        let mut mirrored: Vec<(String, String)> = Vec::new();
        for queue in queue_map.values() {
            for locked in queue.lock_group() {
                if !queue_map.contains_key(locked) {
                    return Err(Error::Configuration(format!(
                        "queue '{}' locks unknown queue '{}'",
                        queue.name(),
                        locked
                    )));
                }
                mirrored.push((locked.clone(), queue.name().to_string()));
            }
        }
        for (queue_name, locks) in mirrored {
            if let Some(queue) = queue_map.get_mut(&queue_name) {
                queue.add_lock(locks);
            }
        }

        Ok(Self {
            state: Mutex::new(ManagerState {
                queues: queue_map,
                projects: project_map,
                active: HashSet::new(),
            }),
            integrators: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        })
    }

    /// Build a manager from a loaded server configuration.
    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        Self::new(config.queues.clone(), &config.projects)
    }

    /// All configured queue names, alphabetically.
    pub async fn queue_names(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.queues.keys().cloned().collect()
    }

    /// Queue a build request for `project` on its configured queue.
    ///
    /// Submission is fire-and-forget: it never waits for the build, only for
    /// the queue's short critical section.
    pub async fn request_build(&self, project: &str, request: IntegrationRequest) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            let registration = state
                .projects
                .get(project)
                .ok_or_else(|| Error::NoSuchProject(project.to_string()))?
                .clone();
            let queue = state
                .queues
                .get_mut(&registration.queue_name)
                .ok_or_else(|| Error::NoSuchQueue(registration.queue_name.clone()))?;
            let outcome = queue.enqueue(project, registration.priority, request)?;
            debug!(project, queue = %registration.queue_name, ?outcome, "request queued");
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Whether `project` has a pending (not yet activated) request.
    pub async fn has_pending(&self, project: &str) -> bool {
        let state = self.state.lock().await;
        state
            .projects
            .get(project)
            .and_then(|registration| state.queues.get(&registration.queue_name))
            .map(|queue| queue.contains_project(project))
            .unwrap_or(false)
    }

    /// Activate `project`'s pending request if it is at the head of its queue
    /// and the queue's lock group is free.
    ///
    /// On success the item is removed, the queue is marked active, and the
    /// request is handed to the caller, which must pair it with
    /// [`release_active_for`](Self::release_active_for). Fairness across a
    /// lock group is best-effort: when several queues become eligible at
    /// once, the first caller to observe the free group wins.
    pub async fn try_activate(&self, project: &str) -> Result<Option<IntegrationRequest>> {
        let mut state = self.state.lock().await;
        let registration = state
            .projects
            .get(project)
            .ok_or_else(|| Error::NoSuchProject(project.to_string()))?
            .clone();
        let queue = state
            .queues
            .get(&registration.queue_name)
            .ok_or_else(|| Error::NoSuchQueue(registration.queue_name.clone()))?;

        let head_is_project = queue
            .head()
            .map(|item| item.project() == project)
            .unwrap_or(false);
        let lock_group_free = queue
            .lock_group()
            .iter()
            .all(|name| !state.active.contains(name));
        if !head_is_project || !lock_group_free {
            return Ok(None);
        }

        let queue = state
            .queues
            .get_mut(&registration.queue_name)
            .ok_or_else(|| Error::NoSuchQueue(registration.queue_name.clone()))?;
        let Some(item) = queue.pop_head() else {
            return Ok(None);
        };
        state.active.insert(registration.queue_name.clone());
        debug!(project, queue = %registration.queue_name, "activated");
        Ok(Some(item.into_request()))
    }

    /// Release the active flag for `queue`, letting other queues in its lock
    /// group proceed.
    pub async fn release_active(&self, queue: &str) {
        {
            let mut state = self.state.lock().await;
            if !state.active.remove(queue) {
                warn!(queue, "release for a queue that was not active");
            }
        }
        self.notify.notify_waiters();
    }

    /// Release the active flag for `project`'s queue.
    pub async fn release_active_for(&self, project: &str) {
        let queue_name = {
            let state = self.state.lock().await;
            state
                .projects
                .get(project)
                .map(|registration| registration.queue_name.clone())
        };
        if let Some(queue_name) = queue_name {
            self.release_active(&queue_name).await;
        }
    }

    /// Remove `project`'s pending request without touching other projects'
    /// items. Returns whether anything was removed. An already-activated
    /// build is not affected; use [`ProjectIntegrator::abort`] for that.
    pub async fn cancel_pending_request(&self, project: &str) -> Result<bool> {
        let removed = {
            let mut state = self.state.lock().await;
            let registration = state
                .projects
                .get(project)
                .ok_or_else(|| Error::NoSuchProject(project.to_string()))?
                .clone();
            let queue = state
                .queues
                .get_mut(&registration.queue_name)
                .ok_or_else(|| Error::NoSuchQueue(registration.queue_name))?;
            queue.remove_project(project).is_some()
        };
        if removed {
            info!(project, "pending request cancelled");
            self.notify.notify_waiters();
        }
        Ok(removed)
    }

    /// Deep-copied view of every queue's contents.
    pub async fn snapshot(&self) -> QueueSetSnapshot {
        let state = self.state.lock().await;
        QueueSetSnapshot {
            queues: state.queues.values().map(BuildQueue::snapshot).collect(),
        }
    }

    /// Deep-copied view of queue contents plus per-project scheduling state.
    pub async fn server_snapshot(&self) -> ServerSnapshot {
        let (queue_set, registrations) = {
            let state = self.state.lock().await;
            let queue_set = QueueSetSnapshot {
                queues: state.queues.values().map(BuildQueue::snapshot).collect(),
            };
            let registrations: BTreeMap<String, String> = state
                .projects
                .iter()
                .map(|(name, registration)| (name.clone(), registration.queue_name.clone()))
                .collect();
            (queue_set, registrations)
        };

        let integrators = self.integrators.lock().await;
        let projects = registrations
            .into_iter()
            .map(|(name, queue_name)| match integrators.get(&name) {
                Some(integrator) => ProjectStatusSnapshot {
                    name,
                    queue_name,
                    state: integrator.state(),
                    activity: integrator.activity(),
                    next_build: Some(integrator.next_build()),
                },
                None => ProjectStatusSnapshot {
                    name,
                    queue_name,
                    state: IntegratorState::Stopped,
                    activity: ProjectActivity::Sleeping,
                    next_build: None,
                },
            })
            .collect();

        ServerSnapshot {
            queue_set,
            projects,
        }
    }

    /// Attach a project's integrator loop so control operations and status
    /// reporting can reach it.
    pub async fn attach(&self, integrator: Arc<ProjectIntegrator>) -> Result<()> {
        {
            let state = self.state.lock().await;
            if !state.projects.contains_key(integrator.project()) {
                return Err(Error::NoSuchProject(integrator.project().to_string()));
            }
        }
        let mut integrators = self.integrators.lock().await;
        integrators.insert(integrator.project().to_string(), integrator);
        Ok(())
    }

    /// Look up a project's attached integrator.
    pub async fn integrator(&self, project: &str) -> Result<Arc<ProjectIntegrator>> {
        let integrators = self.integrators.lock().await;
        integrators
            .get(project)
            .cloned()
            .ok_or_else(|| Error::NoSuchProject(project.to_string()))
    }

    /// Start a project's scheduling loop.
    pub async fn start_project(&self, project: &str) -> Result<()> {
        let integrator = self.integrator(project).await?;
        integrator.start().await;
        Ok(())
    }

    /// Stop a project's scheduling loop after any in-flight build.
    pub async fn stop_project(&self, project: &str) -> Result<()> {
        let integrator = self.integrator(project).await?;
        integrator.stop().await;
        Ok(())
    }

    /// Abort a project's in-flight build and stop its loop.
    pub async fn abort_build(&self, project: &str) -> Result<()> {
        let integrator = self.integrator(project).await?;
        integrator.abort().await;
        Ok(())
    }

    /// Block the caller until a project's loop has fully stopped.
    pub async fn wait_for_exit(&self, project: &str) -> Result<()> {
        let integrator = self.integrator(project).await?;
        integrator.wait_for_exit().await;
        Ok(())
    }

    /// Queue an operator-forced build for `project`.
    pub async fn force_build(
        &self,
        project: &str,
        user: Option<String>,
        parameters: HashMap<String, String>,
    ) -> Result<()> {
        self.request_build(
            project,
            IntegrationRequest::force(user).with_parameters(parameters),
        )
        .await
    }

    /// Stop every integrator, wait for the loops to exit, and clear all
    /// queues and registrations. Used for shutdown and reconfiguration;
    /// afterwards [`queue_names`](Self::queue_names) returns nothing.
    pub async fn stop_all_projects(&self) {
        let integrators: Vec<Arc<ProjectIntegrator>> = {
            let mut map = self.integrators.lock().await;
            map.drain().map(|(_, integrator)| integrator).collect()
        };
        for integrator in &integrators {
            integrator.stop().await;
        }
        for integrator in &integrators {
            integrator.wait_for_exit().await;
        }

        {
            let mut state = self.state.lock().await;
            state.queues.clear();
            state.projects.clear();
            state.active.clear();
        }
        self.notify.notify_waiters();
        info!("all projects stopped; queues cleared");
    }

    /// Wait until something about the queues changes: an enqueue, a cancel,
    /// or a lock-group release.
    pub async fn wait_for_change(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drydock_core::BuildCondition;
    use drydock_core::queue::DuplicatePolicy;

    fn definition(name: &str, lock_queues: Vec<&str>) -> QueueDefinition {
        QueueDefinition {
            name: name.to_string(),
            duplicates: DuplicatePolicy::UseFirst,
            lock_queues: lock_queues.into_iter().map(String::from).collect(),
            max_size: None,
        }
    }

    fn project(name: &str, queue: Option<&str>) -> ProjectDefinition {
        let mut project = ProjectDefinition::new(name);
        project.queue = queue.map(String::from);
        project
    }

    fn modification_request() -> IntegrationRequest {
        IntegrationRequest::new(BuildCondition::IfModificationExists, "interval", None)
    }

    #[tokio::test]
    async fn queue_names_are_alphabetical() {
        let manager = QueueManager::new(
            Vec::new(),
            &[
                project("a", Some("ProjectQueueOne")),
                project("b", Some("ProjectQueueThree")),
                project("c", Some("ProjectQueueTwo")),
            ],
        )
        .unwrap();

        assert_eq!(
            manager.queue_names().await,
            vec!["ProjectQueueOne", "ProjectQueueThree", "ProjectQueueTwo"]
        );
    }

    #[tokio::test]
    async fn projects_default_to_a_queue_named_after_them() {
        let manager = QueueManager::new(Vec::new(), &[project("web", None)]).unwrap();
        manager
            .request_build("web", modification_request())
            .await
            .unwrap();

        let snapshot = manager.snapshot().await;
        let queue = snapshot.queue("web").unwrap();
        assert_eq!(queue.requests.len(), 1);
        assert_eq!(queue.requests[0].project_name, "web");
    }

    #[tokio::test]
    async fn unknown_project_is_rejected_before_queueing() {
        let manager = QueueManager::new(Vec::new(), &[project("web", None)]).unwrap();
        let err = manager
            .request_build("ghost", modification_request())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::NoSuchProject(name) if name == "ghost"));
    }

    #[tokio::test]
    async fn unknown_lock_reference_is_a_construction_error() {
        let err = QueueManager::new(
            vec![definition("Q1", vec!["nowhere"])],
            &[project("web", Some("Q1"))],
        )
        .unwrap_err();

        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn lock_group_excludes_both_queues() {
        let manager = QueueManager::new(
            vec![definition("Q1", vec!["Q2"]), definition("Q2", vec!["Q1"])],
            &[project("p1", Some("Q1")), project("p2", Some("Q2"))],
        )
        .unwrap();

        manager
            .request_build("p1", modification_request())
            .await
            .unwrap();
        manager
            .request_build("p2", modification_request())
            .await
            .unwrap();

        let activated = manager.try_activate("p1").await.unwrap();
        assert!(activated.is_some());

        // Q1 holds the lock group, so Q2's head cannot activate.
        assert!(manager.try_activate("p2").await.unwrap().is_none());

        manager.release_active("Q1").await;
        assert!(manager.try_activate("p2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn lock_declarations_are_mirrored() {
        // Only Q1 declares the relationship; exclusion must still hold when
        // Q2 activates first.
        let manager = QueueManager::new(
            vec![definition("Q1", vec!["Q2"]), definition("Q2", Vec::new())],
            &[project("p1", Some("Q1")), project("p2", Some("Q2"))],
        )
        .unwrap();

        manager
            .request_build("p1", modification_request())
            .await
            .unwrap();
        manager
            .request_build("p2", modification_request())
            .await
            .unwrap();

        assert!(manager.try_activate("p2").await.unwrap().is_some());
        assert!(manager.try_activate("p1").await.unwrap().is_none());

        manager.release_active("Q2").await;
        assert!(manager.try_activate("p1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn only_the_queue_head_can_activate() {
        let manager = QueueManager::new(
            Vec::new(),
            &[
                project("first", Some("shared")),
                project("second", Some("shared")),
            ],
        )
        .unwrap();

        manager
            .request_build("first", modification_request())
            .await
            .unwrap();
        manager
            .request_build("second", modification_request())
            .await
            .unwrap();

        assert!(manager.try_activate("second").await.unwrap().is_none());
        assert!(manager.try_activate("first").await.unwrap().is_some());

        // Same queue is active until released, so the new head still waits.
        assert!(manager.try_activate("second").await.unwrap().is_none());
        manager.release_active("shared").await;
        assert!(manager.try_activate("second").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn cancel_pending_removes_only_that_project() {
        let manager = QueueManager::new(
            Vec::new(),
            &[
                project("first", Some("shared")),
                project("second", Some("shared")),
            ],
        )
        .unwrap();

        manager
            .request_build("first", modification_request())
            .await
            .unwrap();
        manager
            .request_build("second", modification_request())
            .await
            .unwrap();

        assert!(manager.cancel_pending_request("first").await.unwrap());
        assert!(!manager.cancel_pending_request("first").await.unwrap());

        let snapshot = manager.snapshot().await;
        let queue = snapshot.queue("shared").unwrap();
        assert_eq!(queue.requests.len(), 1);
        assert_eq!(queue.requests[0].project_name, "second");
    }

    #[tokio::test]
    async fn snapshots_are_isolated_from_live_state() {
        let manager = QueueManager::new(Vec::new(), &[project("web", None)]).unwrap();
        manager
            .request_build("web", modification_request())
            .await
            .unwrap();

        let mut snapshot = manager.snapshot().await;
        snapshot.queues.clear();

        let fresh = manager.snapshot().await;
        assert_eq!(fresh.queue("web").unwrap().requests.len(), 1);
    }

    #[tokio::test]
    async fn stop_all_projects_clears_every_queue() {
        let manager = QueueManager::new(Vec::new(), &[project("web", None)]).unwrap();
        manager
            .request_build("web", modification_request())
            .await
            .unwrap();

        manager.stop_all_projects().await;

        assert!(manager.queue_names().await.is_empty());
        assert!(manager.snapshot().await.queues.is_empty());
    }
}
