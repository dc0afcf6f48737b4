//! Trigger trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{IntegrationRequest, Result};

/// Decides when a project wants to build.
///
/// Triggers are polled by the project's scheduling loop. A trigger that is
/// not ready returns `Ok(None)`; errors are logged by the loop and polling
/// continues.
#[async_trait]
pub trait Trigger: Send + Sync {
    /// Produce a build request if the trigger is ready.
    async fn fire(&self) -> Result<Option<IntegrationRequest>>;

    /// Called after an integration for the project completes, whatever its
    /// outcome.
    async fn integration_completed(&self);

    /// When the trigger next expects to fire.
    fn next_build(&self) -> DateTime<Utc>;
}
