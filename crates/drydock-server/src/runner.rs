//! Shell-command integration runner.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use drydock_config::ServerConfig;
use drydock_core::IntegrationRequest;
use drydock_core::integration::{IntegrationResult, IntegrationRunner, IntegrationStatus};

/// Runs each project's configured build command through `/bin/sh`.
///
/// Build parameters from the request are passed to the command as
/// environment variables. A project without a build command completes
/// successfully without running anything.
pub struct ShellRunner {
    commands: HashMap<String, String>,
}

impl ShellRunner {
    pub fn from_config(config: &ServerConfig) -> Self {
        let commands = config
            .projects
            .iter()
            .filter_map(|project| {
                project
                    .build_command
                    .as_ref()
                    .map(|command| (project.name.clone(), command.clone()))
            })
            .collect();
        Self { commands }
    }
}

#[async_trait]
impl IntegrationRunner for ShellRunner {
    async fn integrate(&self, project: &str, request: &IntegrationRequest) -> IntegrationResult {
        let started_at = Utc::now();
        let Some(command) = self.commands.get(project) else {
            info!(project, "no build command configured; completing as a no-op");
            return IntegrationResult::new(
                project,
                IntegrationStatus::Success,
                request.clone(),
                started_at,
            );
        };

        info!(project, command, "running build command");
        let output = tokio::process::Command::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .envs(request.parameters().clone())
            .kill_on_drop(true)
            .output()
            .await;

        let status = match output {
            Ok(output) if output.status.success() => IntegrationStatus::Success,
            Ok(output) => {
                warn!(project, code = ?output.status.code(), "build command failed");
                IntegrationStatus::Failure
            }
            Err(error) => IntegrationStatus::Exception {
                message: error.to_string(),
            },
        };
        IntegrationResult::new(project, status, request.clone(), started_at)
    }
}
