//! Core domain types and traits for the Drydock CI server.
//!
//! This crate contains:
//! - Build conditions and integration requests
//! - Queue and project declarations with duplicate-handling policies
//! - The `Trigger` and `IntegrationRunner` collaborator traits
//! - Integration results and per-project activity reporting
//! - The read-only snapshot model exposed to remote clients

pub mod condition;
pub mod error;
pub mod id;
pub mod integration;
pub mod project;
pub mod queue;
pub mod request;
pub mod snapshot;
pub mod trigger;

pub use condition::BuildCondition;
pub use error::{Error, Result};
pub use id::BuildId;
pub use request::IntegrationRequest;
