//! Integration execution types and the runner trait.
//!
//! The runner performs the actual build (source-control checkout, tasks,
//! publishing). From the scheduler's perspective it is a black box that
//! always returns a result: build failures surface as a result status, never
//! as an error out of the queueing machinery.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{BuildId, IntegrationRequest};

/// Lifecycle state of a project's scheduling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IntegratorState {
    /// Not scheduled. Initial and terminal state.
    #[default]
    Stopped,
    /// Control loop is running.
    Running,
    /// Shutdown requested; the loop exits after any in-flight build.
    Stopping,
}

/// What a project's scheduling loop is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProjectActivity {
    /// Idle between trigger evaluations.
    #[default]
    Sleeping,
    /// Evaluating the trigger.
    CheckingModifications,
    /// Queued, waiting for the queue head and lock group.
    Pending,
    /// Integration in progress.
    Building,
}

/// Final status of one integration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntegrationStatus {
    /// Build completed successfully.
    Success,
    /// Build ran and failed.
    Failure,
    /// Build could not run to completion.
    Exception { message: String },
    /// Build was cancelled by an abort request.
    Cancelled,
}

/// Result of a completed integration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationResult {
    /// Unique identifier of this build run.
    pub id: BuildId,
    /// Project that was built.
    pub project: String,
    /// Final status.
    pub status: IntegrationStatus,
    /// The request that caused the build.
    pub request: IntegrationRequest,
    /// When the build started.
    pub started_at: DateTime<Utc>,
    /// When the build finished.
    pub finished_at: DateTime<Utc>,
}

impl IntegrationResult {
    pub fn new(
        project: impl Into<String>,
        status: IntegrationStatus,
        request: IntegrationRequest,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: BuildId::new(),
            project: project.into(),
            status,
            request,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// A result for a build that was aborted before it finished.
    pub fn cancelled(
        project: impl Into<String>,
        request: IntegrationRequest,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self::new(project, IntegrationStatus::Cancelled, request, started_at)
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.status, IntegrationStatus::Success)
    }
}

/// Trait for integration runners.
#[async_trait]
pub trait IntegrationRunner: Send + Sync {
    /// Run one integration for `project`.
    ///
    /// Implementations report build failures through the result status; the
    /// scheduler treats any returned result as a normal completion.
    async fn integrate(&self, project: &str, request: &IntegrationRequest) -> IntegrationResult;
}
