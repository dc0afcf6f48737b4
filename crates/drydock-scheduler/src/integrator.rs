//! Per-project scheduling loops.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use drydock_core::integration::{
    IntegrationResult, IntegrationRunner, IntegrationStatus, IntegratorState, ProjectActivity,
};
use drydock_core::trigger::Trigger;
use drydock_core::{IntegrationRequest, Result};

use crate::manager::QueueManager;

/// Command channel value for a running control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Keep scheduling.
    Run,
    /// Exit after any in-flight integration.
    Stop,
    /// Exit and cancel the in-flight integration.
    Abort,
}

/// The scheduling loop for one project.
///
/// The integrator owns one tokio task while running: it polls the project's
/// trigger, submits fired requests to the queue manager, waits for its queued
/// item to reach the head of the queue with a free lock group, runs the
/// integration, and reports completion back to the trigger.
///
/// Lifecycle is Stopped -> Running -> Stopping -> Stopped; `start`, `stop`
/// and `abort` are all idempotent.
pub struct ProjectIntegrator {
    project: String,
    trigger: Arc<dyn Trigger>,
    runner: Arc<dyn IntegrationRunner>,
    manager: Arc<QueueManager>,
    /// Upper bound on how long the loop sleeps between trigger evaluations
    /// and between activation re-checks.
    poll_interval: Duration,
    state: watch::Sender<IntegratorState>,
    activity: watch::Sender<ProjectActivity>,
    /// Command channel for the current run; `None` while stopped.
    control: Mutex<Option<watch::Sender<Command>>>,
}

impl ProjectIntegrator {
    pub fn new(
        project: impl Into<String>,
        trigger: Arc<dyn Trigger>,
        runner: Arc<dyn IntegrationRunner>,
        manager: Arc<QueueManager>,
        poll_interval: Duration,
    ) -> Self {
        let (state, _) = watch::channel(IntegratorState::Stopped);
        let (activity, _) = watch::channel(ProjectActivity::Sleeping);
        Self {
            project: project.into(),
            trigger,
            runner,
            manager,
            poll_interval,
            state,
            activity,
            control: Mutex::new(None),
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn state(&self) -> IntegratorState {
        *self.state.borrow()
    }

    pub fn activity(&self) -> ProjectActivity {
        *self.activity.borrow()
    }

    pub fn next_build(&self) -> DateTime<Utc> {
        self.trigger.next_build()
    }

    /// Spawn the control loop. A no-op when the loop is already running or
    /// still shutting down.
    pub async fn start(self: &Arc<Self>) {
        let mut control = self.control.lock().await;
        if !matches!(self.state(), IntegratorState::Stopped) {
            debug!(project = %self.project, "start ignored; integrator already scheduled");
            return;
        }
        let (cmd_tx, cmd_rx) = watch::channel(Command::Run);
        *control = Some(cmd_tx);
        self.state.send_replace(IntegratorState::Running);
        info!(project = %self.project, "integrator starting");

        let this = Arc::clone(self);
        tokio::spawn(async move { this.control_loop(cmd_rx).await });
    }

    /// Ask the loop to exit once any in-flight integration completes. A
    /// no-op unless the integrator is Running.
    pub async fn stop(&self) {
        let control = self.control.lock().await;
        if matches!(self.state(), IntegratorState::Running)
            && let Some(cmd) = control.as_ref()
            && *cmd.borrow() == Command::Run
        {
            info!(project = %self.project, "integrator stopping");
            cmd.send_replace(Command::Stop);
            self.state.send_replace(IntegratorState::Stopping);
        }
    }

    /// Like [`stop`](Self::stop), but also cancels the in-flight
    /// integration. The state machine guards re-entry: once the abort has
    /// been signalled, further shutdown calls do nothing.
    pub async fn abort(&self) {
        let control = self.control.lock().await;
        if matches!(
            self.state(),
            IntegratorState::Running | IntegratorState::Stopping
        ) && let Some(cmd) = control.as_ref()
            && *cmd.borrow() != Command::Abort
        {
            info!(project = %self.project, "integrator aborting");
            cmd.send_replace(Command::Abort);
            self.state.send_replace(IntegratorState::Stopping);
        }
    }

    /// Block the caller until the loop has fully stopped. Safe to call from
    /// several tasks at once, and before `start` (returns immediately).
    pub async fn wait_for_exit(&self) {
        let mut rx = self.state.subscribe();
        loop {
            if matches!(*rx.borrow_and_update(), IntegratorState::Stopped) {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Queue an operator-forced build for this project.
    pub async fn force_build(
        &self,
        user: Option<String>,
        parameters: HashMap<String, String>,
    ) -> Result<()> {
        self.request(IntegrationRequest::force(user).with_parameters(parameters))
            .await
    }

    /// Queue an externally constructed request for this project.
    pub async fn request(&self, request: IntegrationRequest) -> Result<()> {
        self.manager.request_build(&self.project, request).await
    }

    async fn control_loop(self: Arc<Self>, mut cmd: watch::Receiver<Command>) {
        loop {
            if *cmd.borrow_and_update() != Command::Run {
                break;
            }

            self.poll_trigger().await;

            if self.manager.has_pending(&self.project).await {
                if let Some(request) = self.wait_for_activation(&mut cmd).await {
                    self.integrate(request, &mut cmd).await;
                }
            } else {
                self.set_activity(ProjectActivity::Sleeping);
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    _ = cmd.changed() => {}
                }
            }
        }

        self.set_activity(ProjectActivity::Sleeping);
        // Clear the command channel before publishing Stopped so a restart
        // racing with this exit cannot have its fresh channel overwritten.
        *self.control.lock().await = None;
        self.state.send_replace(IntegratorState::Stopped);
        info!(project = %self.project, "integrator stopped");
    }

    /// Evaluate the trigger once and submit whatever it fires. Trigger
    /// errors are logged and swallowed; one bad evaluation must not end the
    /// loop.
    async fn poll_trigger(&self) {
        self.set_activity(ProjectActivity::CheckingModifications);
        match self.trigger.fire().await {
            Ok(Some(request)) if request.condition().should_build() => {
                debug!(project = %self.project, %request, "trigger fired");
                if let Err(error) = self.manager.request_build(&self.project, request).await {
                    warn!(project = %self.project, %error, "trigger request rejected");
                }
            }
            Ok(_) => {}
            Err(error) => {
                warn!(project = %self.project, %error, "trigger evaluation failed");
            }
        }
    }

    /// Wait until this project's queued item reaches the head of its queue
    /// with a free lock group. Returns `None` when interrupted by a command
    /// or when the pending item disappears.
    async fn wait_for_activation(
        &self,
        cmd: &mut watch::Receiver<Command>,
    ) -> Option<IntegrationRequest> {
        self.set_activity(ProjectActivity::Pending);
        loop {
            if *cmd.borrow_and_update() != Command::Run {
                return None;
            }
            match self.manager.try_activate(&self.project).await {
                Ok(Some(request)) => return Some(request),
                Ok(None) => {
                    if !self.manager.has_pending(&self.project).await {
                        // Cancelled out from under us.
                        return None;
                    }
                }
                Err(error) => {
                    // Queues can disappear during reconfiguration.
                    warn!(project = %self.project, %error, "activation failed");
                    return None;
                }
            }
            tokio::select! {
                _ = self.manager.wait_for_change() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = cmd.changed() => {}
            }
        }
    }

    /// Run one activated integration, release the lock group, and notify the
    /// trigger. A Failure or Exception result is a normal completion here;
    /// only an abort command cuts the build short.
    async fn integrate(&self, request: IntegrationRequest, cmd: &mut watch::Receiver<Command>) {
        self.set_activity(ProjectActivity::Building);
        let started_at = Utc::now();
        info!(project = %self.project, %request, "integration starting");

        let cancelled = request.clone();
        let result = tokio::select! {
            result = self.runner.integrate(&self.project, &request) => result,
            _ = wait_for_abort(cmd) => {
                IntegrationResult::cancelled(self.project.as_str(), cancelled, started_at)
            }
        };

        // The lock group is released and the trigger notified whatever the
        // outcome; a failed build must never leave its queue active.
        self.manager.release_active_for(&self.project).await;
        match &result.status {
            IntegrationStatus::Success => {
                info!(project = %self.project, build = %result.id, "integration succeeded");
            }
            IntegrationStatus::Failure => {
                warn!(project = %self.project, build = %result.id, "integration failed");
            }
            IntegrationStatus::Exception { message } => {
                warn!(project = %self.project, build = %result.id, message, "integration errored");
            }
            IntegrationStatus::Cancelled => {
                info!(project = %self.project, build = %result.id, "integration aborted");
            }
        }
        self.trigger.integration_completed().await;
        self.set_activity(ProjectActivity::Sleeping);
    }

    fn set_activity(&self, activity: ProjectActivity) {
        self.activity.send_replace(activity);
    }
}

/// Resolves when the command channel switches to Abort. Stop alone does not
/// cancel an in-flight integration.
async fn wait_for_abort(cmd: &mut watch::Receiver<Command>) {
    loop {
        if *cmd.borrow_and_update() == Command::Abort {
            return;
        }
        if cmd.changed().await.is_err() {
            // Sender gone; nothing can abort this build any more.
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use drydock_core::BuildCondition;
    use drydock_core::project::ProjectDefinition;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);
    const POLL: Duration = Duration::from_millis(10);

    /// Trigger that fires a fixed list of requests, one per evaluation.
    struct ScriptedTrigger {
        requests: std::sync::Mutex<Vec<IntegrationRequest>>,
        completions: AtomicUsize,
    }

    impl ScriptedTrigger {
        fn new(requests: Vec<IntegrationRequest>) -> Self {
            Self {
                requests: std::sync::Mutex::new(requests),
                completions: AtomicUsize::new(0),
            }
        }

        fn silent() -> Self {
            Self::new(Vec::new())
        }

        fn completions(&self) -> usize {
            self.completions.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Trigger for ScriptedTrigger {
        async fn fire(&self) -> Result<Option<IntegrationRequest>> {
            let mut requests = self.requests.lock().unwrap();
            if requests.is_empty() {
                Ok(None)
            } else {
                Ok(Some(requests.remove(0)))
            }
        }

        async fn integration_completed(&self) {
            self.completions.fetch_add(1, Ordering::SeqCst);
        }

        fn next_build(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }

    /// Runner that records invocations and blocks for a configurable delay.
    struct RecordingRunner {
        delay: Duration,
        status: IntegrationStatus,
        builds: AtomicUsize,
    }

    impl RecordingRunner {
        fn new(status: IntegrationStatus) -> Self {
            Self {
                delay: Duration::ZERO,
                status,
                builds: AtomicUsize::new(0),
            }
        }

        fn slow(status: IntegrationStatus, delay: Duration) -> Self {
            Self {
                delay,
                status,
                builds: AtomicUsize::new(0),
            }
        }

        fn builds(&self) -> usize {
            self.builds.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl IntegrationRunner for RecordingRunner {
        async fn integrate(
            &self,
            project: &str,
            request: &IntegrationRequest,
        ) -> IntegrationResult {
            self.builds.fetch_add(1, Ordering::SeqCst);
            let started_at = Utc::now();
            tokio::time::sleep(self.delay).await;
            IntegrationResult::new(project, self.status.clone(), request.clone(), started_at)
        }
    }

    struct Fixture {
        manager: Arc<QueueManager>,
        trigger: Arc<ScriptedTrigger>,
        runner: Arc<RecordingRunner>,
        integrator: Arc<ProjectIntegrator>,
    }

    async fn fixture(trigger: ScriptedTrigger, runner: RecordingRunner) -> Fixture {
        let manager =
            Arc::new(QueueManager::new(Vec::new(), &[ProjectDefinition::new("web")]).unwrap());
        let trigger = Arc::new(trigger);
        let runner = Arc::new(runner);
        let integrator = Arc::new(ProjectIntegrator::new(
            "web",
            Arc::clone(&trigger) as Arc<dyn Trigger>,
            Arc::clone(&runner) as Arc<dyn IntegrationRunner>,
            Arc::clone(&manager),
            POLL,
        ));
        manager.attach(Arc::clone(&integrator)).await.unwrap();
        Fixture {
            manager,
            trigger,
            runner,
            integrator,
        }
    }

    async fn wait_until(mut check: impl AsyncFnMut() -> bool) {
        timeout(WAIT, async {
            while !check().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn wait_for_exit_before_start_returns_immediately() {
        let f = fixture(
            ScriptedTrigger::silent(),
            RecordingRunner::new(IntegrationStatus::Success),
        )
        .await;

        timeout(WAIT, f.integrator.wait_for_exit())
            .await
            .expect("should not block before start");
        assert_eq!(f.integrator.state(), IntegratorState::Stopped);
    }

    #[tokio::test]
    async fn trigger_fires_drive_builds_to_completion() {
        let f = fixture(
            ScriptedTrigger::new(vec![IntegrationRequest::new(
                BuildCondition::IfModificationExists,
                "interval",
                None,
            )]),
            RecordingRunner::new(IntegrationStatus::Success),
        )
        .await;

        f.integrator.start().await;
        wait_until(async || f.trigger.completions() == 1).await;
        assert_eq!(f.runner.builds(), 1);

        f.integrator.stop().await;
        f.integrator.wait_for_exit().await;
    }

    #[tokio::test]
    async fn double_start_runs_a_single_loop() {
        let f = fixture(
            ScriptedTrigger::new(vec![IntegrationRequest::force(None)]),
            RecordingRunner::new(IntegrationStatus::Success),
        )
        .await;

        f.integrator.start().await;
        f.integrator.start().await;
        assert_eq!(f.integrator.state(), IntegratorState::Running);

        wait_until(async || f.trigger.completions() == 1).await;
        // One loop, one trigger script entry, exactly one build.
        assert_eq!(f.runner.builds(), 1);

        f.integrator.stop().await;
        f.integrator.wait_for_exit().await;
    }

    #[tokio::test]
    async fn stop_and_abort_after_stopped_are_noops() {
        let f = fixture(
            ScriptedTrigger::silent(),
            RecordingRunner::new(IntegrationStatus::Success),
        )
        .await;

        f.integrator.start().await;
        f.integrator.stop().await;
        f.integrator.wait_for_exit().await;

        f.integrator.stop().await;
        f.integrator.abort().await;
        assert_eq!(f.integrator.state(), IntegratorState::Stopped);
    }

    #[tokio::test]
    async fn force_build_runs_without_a_trigger_fire() {
        let f = fixture(
            ScriptedTrigger::silent(),
            RecordingRunner::new(IntegrationStatus::Success),
        )
        .await;

        f.integrator.start().await;
        f.integrator.force_build(None, HashMap::new()).await.unwrap();

        wait_until(async || f.trigger.completions() == 1).await;
        assert_eq!(f.runner.builds(), 1);

        f.integrator.stop().await;
        f.integrator.wait_for_exit().await;
    }

    #[tokio::test]
    async fn failed_builds_still_release_and_complete() {
        let f = fixture(
            ScriptedTrigger::silent(),
            RecordingRunner::new(IntegrationStatus::Failure),
        )
        .await;

        f.integrator.start().await;
        f.integrator.force_build(None, HashMap::new()).await.unwrap();
        wait_until(async || f.trigger.completions() == 1).await;

        // The queue must be clear and activatable again after a failure.
        f.integrator.force_build(None, HashMap::new()).await.unwrap();
        wait_until(async || f.trigger.completions() == 2).await;
        assert_eq!(f.runner.builds(), 2);

        f.integrator.stop().await;
        f.integrator.wait_for_exit().await;
    }

    #[tokio::test]
    async fn abort_cancels_an_in_flight_build() {
        let f = fixture(
            ScriptedTrigger::silent(),
            RecordingRunner::slow(IntegrationStatus::Success, Duration::from_secs(60)),
        )
        .await;

        f.integrator.start().await;
        f.integrator.force_build(None, HashMap::new()).await.unwrap();
        wait_until(async || f.runner.builds() == 1).await;

        f.integrator.abort().await;
        timeout(WAIT, f.integrator.wait_for_exit())
            .await
            .expect("abort must not wait for the build");

        // Cancellation is still a completion for the trigger and the lock
        // group.
        assert_eq!(f.trigger.completions(), 1);
        assert!(f.manager.try_activate("web").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn trigger_errors_do_not_end_the_loop() {
        /// Trigger that fails its first evaluations, then fires once.
        struct FlakyTrigger {
            failures_left: AtomicUsize,
            fired: AtomicUsize,
            completions: AtomicUsize,
        }

        #[async_trait]
        impl Trigger for FlakyTrigger {
            async fn fire(&self) -> Result<Option<IntegrationRequest>> {
                if self
                    .failures_left
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
                {
                    return Err(drydock_core::Error::Trigger(
                        "source control offline".to_string(),
                    ));
                }
                if self.fired.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(Some(IntegrationRequest::new(
                        BuildCondition::IfModificationExists,
                        "interval",
                        None,
                    )))
                } else {
                    Ok(None)
                }
            }

            async fn integration_completed(&self) {
                self.completions.fetch_add(1, Ordering::SeqCst);
            }

            fn next_build(&self) -> DateTime<Utc> {
                Utc::now()
            }
        }

        let manager =
            Arc::new(QueueManager::new(Vec::new(), &[ProjectDefinition::new("web")]).unwrap());
        let trigger = Arc::new(FlakyTrigger {
            failures_left: AtomicUsize::new(3),
            fired: AtomicUsize::new(0),
            completions: AtomicUsize::new(0),
        });
        let runner = Arc::new(RecordingRunner::new(IntegrationStatus::Success));
        let integrator = Arc::new(ProjectIntegrator::new(
            "web",
            Arc::clone(&trigger) as Arc<dyn Trigger>,
            Arc::clone(&runner) as Arc<dyn IntegrationRunner>,
            Arc::clone(&manager),
            POLL,
        ));
        manager.attach(Arc::clone(&integrator)).await.unwrap();

        integrator.start().await;
        wait_until(async || trigger.completions.load(Ordering::SeqCst) == 1).await;
        assert_eq!(runner.builds(), 1);
        assert_eq!(integrator.state(), IntegratorState::Running);

        integrator.stop().await;
        integrator.wait_for_exit().await;
    }

    #[tokio::test]
    async fn locked_queues_never_build_concurrently() {
        use drydock_core::queue::{DuplicatePolicy, QueueDefinition};

        /// Runner that tracks how many builds overlap.
        struct ConcurrencyRunner {
            current: AtomicUsize,
            peak: AtomicUsize,
            builds: AtomicUsize,
        }

        #[async_trait]
        impl IntegrationRunner for ConcurrencyRunner {
            async fn integrate(
                &self,
                project: &str,
                request: &IntegrationRequest,
            ) -> IntegrationResult {
                let started_at = Utc::now();
                let running = self.current.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(running, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                self.current.fetch_sub(1, Ordering::SeqCst);
                self.builds.fetch_add(1, Ordering::SeqCst);
                IntegrationResult::new(
                    project,
                    IntegrationStatus::Success,
                    request.clone(),
                    started_at,
                )
            }
        }

        let definition = |name: &str, locks: &str| QueueDefinition {
            name: name.to_string(),
            duplicates: DuplicatePolicy::UseFirst,
            lock_queues: vec![locks.to_string()],
            max_size: None,
        };
        let mut p1 = ProjectDefinition::new("p1");
        p1.queue = Some("Q1".to_string());
        let mut p2 = ProjectDefinition::new("p2");
        p2.queue = Some("Q2".to_string());

        let manager = Arc::new(
            QueueManager::new(
                vec![definition("Q1", "Q2"), definition("Q2", "Q1")],
                &[p1, p2],
            )
            .unwrap(),
        );
        let runner = Arc::new(ConcurrencyRunner {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            builds: AtomicUsize::new(0),
        });

        let mut integrators = Vec::new();
        for name in ["p1", "p2"] {
            let integrator = Arc::new(ProjectIntegrator::new(
                name,
                Arc::new(ScriptedTrigger::silent()) as Arc<dyn Trigger>,
                Arc::clone(&runner) as Arc<dyn IntegrationRunner>,
                Arc::clone(&manager),
                POLL,
            ));
            manager.attach(Arc::clone(&integrator)).await.unwrap();
            integrator.start().await;
            integrator.force_build(None, HashMap::new()).await.unwrap();
            integrators.push(integrator);
        }

        timeout(WAIT, async {
            while runner.builds.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("both builds should complete");

        assert_eq!(runner.peak.load(Ordering::SeqCst), 1);

        for integrator in &integrators {
            integrator.stop().await;
            integrator.wait_for_exit().await;
        }
    }

    #[tokio::test]
    async fn stop_waits_for_the_in_flight_build() {
        let f = fixture(
            ScriptedTrigger::silent(),
            RecordingRunner::slow(IntegrationStatus::Success, Duration::from_millis(200)),
        )
        .await;

        f.integrator.start().await;
        f.integrator.force_build(None, HashMap::new()).await.unwrap();
        wait_until(async || f.runner.builds() == 1).await;

        f.integrator.stop().await;
        assert_eq!(f.integrator.state(), IntegratorState::Stopping);
        f.integrator.wait_for_exit().await;

        assert_eq!(f.trigger.completions(), 1);
    }
}
