//! Build conditions and their priority ordering.

use serde::{Deserialize, Serialize};

/// Why a build was requested.
///
/// Conditions form a total order used when merging queued requests:
/// `NoBuild < IfModificationExists < ForceBuild`. A request can only ever
/// upgrade a pending request for the same project, never downgrade it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum BuildCondition {
    /// Nothing to do.
    #[default]
    NoBuild,
    /// Build only if source control reports modifications.
    IfModificationExists,
    /// Build unconditionally.
    ForceBuild,
}

impl BuildCondition {
    /// Whether this condition asks for a build at all.
    pub fn should_build(&self) -> bool {
        !matches!(self, BuildCondition::NoBuild)
    }
}

impl std::fmt::Display for BuildCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BuildCondition::NoBuild => "no build",
            BuildCondition::IfModificationExists => "if modification exists",
            BuildCondition::ForceBuild => "force build",
        };
        f.write_str(s)
    }
}
