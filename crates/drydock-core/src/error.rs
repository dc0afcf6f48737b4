//! Error types for Drydock.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no such project: {0}")]
    NoSuchProject(String),

    #[error("no such queue: {0}")]
    NoSuchQueue(String),

    #[error("queue '{queue}' is full (max size {max})")]
    QueueFull { queue: String, max: usize },

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("trigger failed: {0}")]
    Trigger(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
