//! Bridge: module lifecycle and tool routing.
//!
//! This module handles:
//! - Spawning subprocess modules and instantiating in-process ones
//! - JSON-RPC 2.0 communication over process stdio, correlated by id
//! - Tool discovery and aggregation across all modules
//! - Pattern-based tool routing with catalog fallback
//! - Profile activation and graceful shutdown
//!
//! Hosts use [`ModuleManager`]; the other types are exposed for hosts that
//! need finer control or introspection.

pub mod catalog;
pub mod config;
pub mod discovery;
pub mod errors;
pub mod lifecycle;
pub mod manager;
pub mod registry;
pub mod router;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use catalog::{ToolCatalog, ToolDescriptor};
pub use config::{load_config, load_config_or_default, BridgeConfig, BridgeSettings, ModuleDescriptor};
pub use errors::BridgeError;
pub use lifecycle::{InProcessModule, ModuleHandle, PackageCatalog};
pub use manager::{LoadFailure, ModuleManager, ProfileActivation};
pub use registry::ModuleStatus;
pub use router::{Resolution, ToolRouter};
pub use types::ToolDefinition;
