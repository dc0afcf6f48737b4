//! Server configuration parsing.

use std::collections::HashSet;
use std::path::Path;

use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};

use crate::{ConfigError, ConfigResult};
use drydock_core::project::{DEFAULT_POLL_INTERVAL_SECS, ProjectDefinition};
use drydock_core::queue::{DuplicatePolicy, QueueDefinition};

/// The full server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Default trigger poll interval, in seconds, for projects that do not
    /// set their own.
    pub default_poll_interval_secs: u64,
    /// Explicitly declared queues. Projects referencing an undeclared queue
    /// get one with default settings.
    pub queues: Vec<QueueDefinition>,
    /// Declared projects.
    pub projects: Vec<ProjectDefinition>,
}

/// Load and parse a server configuration file.
pub fn load_server_config(path: impl AsRef<Path>) -> ConfigResult<ServerConfig> {
    let text = std::fs::read_to_string(path)?;
    parse_server_config(&text)
}

/// Parse a server configuration from KDL text.
pub fn parse_server_config(kdl: &str) -> ConfigResult<ServerConfig> {
    let doc: KdlDocument = kdl.parse()?;

    // Server settings first, so defaults apply to projects declared above
    // the server block as well.
    let mut default_poll_interval_secs = DEFAULT_POLL_INTERVAL_SECS;
    for node in doc.nodes() {
        if node.name().value() == "server"
            && let Some(secs) = get_i64_child(node, "poll-interval")
        {
            default_poll_interval_secs = positive_seconds(secs, "server poll-interval")?;
        }
    }

    let mut queues: Vec<QueueDefinition> = Vec::new();
    let mut projects: Vec<ProjectDefinition> = Vec::new();

    for node in doc.nodes() {
        match node.name().value() {
            "server" => {}
            "queue" => {
                queues.push(parse_queue(node)?);
            }
            "project" => {
                projects.push(parse_project(node, default_poll_interval_secs)?);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    validate(&queues, &projects)?;

    Ok(ServerConfig {
        default_poll_interval_secs,
        queues,
        projects,
    })
}

fn parse_queue(node: &KdlNode) -> ConfigResult<QueueDefinition> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("queue name".to_string()))?;

    let mut duplicates = DuplicatePolicy::default();
    let mut lock_queues = Vec::new();
    let mut max_size = None;

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "duplicates" => {
                    let value = get_first_string_arg(child).ok_or_else(|| {
                        ConfigError::MissingField(format!("duplicates for queue '{}'", name))
                    })?;
                    duplicates =
                        value
                            .parse()
                            .map_err(|message| ConfigError::InvalidValue {
                                field: format!("duplicates for queue '{}'", name),
                                message,
                            })?;
                }
                "lock-queues" => {
                    lock_queues = get_all_string_args(child);
                }
                "max-size" => {
                    let value = get_first_i64_arg(child).ok_or_else(|| {
                        ConfigError::MissingField(format!("max-size for queue '{}'", name))
                    })?;
                    if value <= 0 {
                        return Err(ConfigError::InvalidValue {
                            field: format!("max-size for queue '{}'", name),
                            message: format!("must be positive, got {}", value),
                        });
                    }
                    max_size = Some(value as usize);
                }
                _ => {}
            }
        }
    }

    Ok(QueueDefinition {
        name,
        duplicates,
        lock_queues,
        max_size,
    })
}

fn parse_project(node: &KdlNode, default_poll_interval_secs: u64) -> ConfigResult<ProjectDefinition> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("project name".to_string()))?;

    let mut project = ProjectDefinition::new(name);
    project.poll_interval_secs = default_poll_interval_secs;

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "queue" => {
                    project.queue = get_first_string_arg(child);
                }
                "queue-priority" => {
                    let value = get_first_i64_arg(child).ok_or_else(|| {
                        ConfigError::MissingField(format!(
                            "queue-priority for project '{}'",
                            project.name
                        ))
                    })?;
                    if value < 0 {
                        return Err(ConfigError::InvalidValue {
                            field: format!("queue-priority for project '{}'", project.name),
                            message: format!("must not be negative, got {}", value),
                        });
                    }
                    project.queue_priority = value as u32;
                }
                "poll-interval" => {
                    if let Some(secs) = get_first_i64_arg(child) {
                        project.poll_interval_secs = positive_seconds(
                            secs,
                            &format!("poll-interval for project '{}'", project.name),
                        )?;
                    }
                }
                "build" => {
                    project.build_command = get_first_string_arg(child);
                }
                _ => {}
            }
        }
    }

    Ok(project)
}

/// Cross-reference checks: unique names, no dangling lock references, no
/// declared queue that nothing builds into.
fn validate(queues: &[QueueDefinition], projects: &[ProjectDefinition]) -> ConfigResult<()> {
    let mut declared: HashSet<&str> = HashSet::new();
    for queue in queues {
        if !declared.insert(&queue.name) {
            return Err(ConfigError::Duplicate(format!("queue '{}'", queue.name)));
        }
    }

    let mut project_names: HashSet<&str> = HashSet::new();
    let mut used_queues: HashSet<&str> = HashSet::new();
    for project in projects {
        if !project_names.insert(&project.name) {
            return Err(ConfigError::Duplicate(format!(
                "project '{}'",
                project.name
            )));
        }
        used_queues.insert(project.queue_name());
    }

    for queue in queues {
        if !used_queues.contains(queue.name.as_str()) {
            return Err(ConfigError::UnusedQueue(queue.name.clone()));
        }
    }

    // Lock references may name declared queues or queues implied by a
    // project; anything else is dangling.
    for queue in queues {
        for locked in &queue.lock_queues {
            if !declared.contains(locked.as_str()) && !used_queues.contains(locked.as_str()) {
                return Err(ConfigError::InvalidReference(format!(
                    "queue '{}' locks unknown queue '{}'",
                    queue.name, locked
                )));
            }
        }
    }

    Ok(())
}

fn positive_seconds(value: i64, field: &str) -> ConfigResult<u64> {
    if value <= 0 {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            message: format!("must be positive, got {}", value),
        });
    }
    Ok(value as u64)
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn get_first_i64_arg(node: &KdlNode) -> Option<i64> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
        .map(|v| v as i64)
}

fn get_i64_child(node: &KdlNode, name: &str) -> Option<i64> {
    node.children()?
        .nodes()
        .iter()
        .find(|child| child.name().value() == name)
        .and_then(get_first_i64_arg)
}
