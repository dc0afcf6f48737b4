//! KDL configuration parsing for the Drydock CI server.
//!
//! This crate handles parsing and validation of the server configuration
//! (`drydock.kdl`): queue declarations, project declarations, and server
//! settings. Validation failures are fatal to the load, never to a running
//! server.

pub mod error;
pub mod server;

pub use error::{ConfigError, ConfigResult};
pub use server::{ServerConfig, load_server_config, parse_server_config};
