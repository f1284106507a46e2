//! netmesh-core — shared types for the netmesh overlay agent.
//!
//! Holds the routing record carried through every other crate
//! ([`TableEntry`]) and the node configuration ([`NetConfig`]).

pub mod config;
pub mod types;

pub use config::{NetConfig, NodeConfig, ResolutionConfig, TunnelConfig};
pub use types::*;
