//! ballast-core — shared types and configuration for the Ballast control plane.
//!
//! Every other crate depends on this one for the cluster data model
//! (`Node`, `Container`, `Resource`, `Peer`) and the explicit `Config`
//! value that is handed to each component at construction.

pub mod config;
pub mod types;

pub use config::{Config, ConfigError, parse_duration};
pub use types::*;
