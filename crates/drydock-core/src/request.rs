//! Integration requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::BuildCondition;

/// Request source used for operator-forced builds.
pub const FORCE_SOURCE: &str = "force";

/// A single requested build.
///
/// Requests are immutable once constructed; queue merging replaces whole
/// requests rather than mutating them in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationRequest {
    condition: BuildCondition,
    /// Name of the trigger or remote source that raised the request.
    source: String,
    /// User that asked for the build, when known.
    user: Option<String>,
    requested_at: DateTime<Utc>,
    /// Named build parameters passed through to the build tasks.
    parameters: HashMap<String, String>,
    /// Publish a result even when source-control evaluation fails.
    publish_on_source_control_error: bool,
}

impl IntegrationRequest {
    pub fn new(condition: BuildCondition, source: impl Into<String>, user: Option<String>) -> Self {
        Self {
            condition,
            source: source.into(),
            user,
            requested_at: Utc::now(),
            parameters: HashMap::new(),
            publish_on_source_control_error: false,
        }
    }

    /// An operator-forced build request.
    pub fn force(user: Option<String>) -> Self {
        Self::new(BuildCondition::ForceBuild, FORCE_SOURCE, user)
    }

    pub fn with_parameters(mut self, parameters: HashMap<String, String>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_publish_on_source_control_error(mut self, publish: bool) -> Self {
        self.publish_on_source_control_error = publish;
        self
    }

    pub fn condition(&self) -> BuildCondition {
        self.condition
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn requested_at(&self) -> DateTime<Utc> {
        self.requested_at
    }

    pub fn parameters(&self) -> &HashMap<String, String> {
        &self.parameters
    }

    pub fn publish_on_source_control_error(&self) -> bool {
        self.publish_on_source_control_error
    }
}

/// Queue-merge equality: two requests are the same if they ask for the same
/// condition from the same source, regardless of timestamps or parameters.
impl PartialEq for IntegrationRequest {
    fn eq(&self, other: &Self) -> bool {
        self.condition == other.condition && self.source == other.source
    }
}

impl Eq for IntegrationRequest {}

impl std::fmt::Display for IntegrationRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.user {
            Some(user) => write!(f, "{} from {} by {}", self.condition, self.source, user),
            None => write!(f, "{} from {}", self.condition, self.source),
        }
    }
}
