//! Bridge error types.

use thiserror::Error;

use super::registry::ModuleStatus;

/// Errors that can occur while loading modules or routing tool calls.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Missing, unreadable or invalid configuration.
    #[error("config error: {reason}")]
    Config { reason: String },

    /// A module's execution unit could not be started.
    #[error("failed to load module '{module}': {reason}")]
    ModuleLoad { module: String, reason: String },

    /// The initialize / tools/list handshake failed.
    #[error("discovery failed for module '{module}': {reason}")]
    Discovery { module: String, reason: String },

    /// A frame could not be encoded or decoded.
    #[error("protocol error for module '{module}': {reason}")]
    Protocol { module: String, reason: String },

    /// The module's byte stream is closed or a write failed.
    #[error("transport error for module '{module}': {reason}")]
    Transport { module: String, reason: String },

    /// No correlated response arrived before the deadline.
    #[error("request '{method}' to module '{module}' timed out after {timeout_ms}ms")]
    Timeout {
        module: String,
        method: String,
        timeout_ms: u64,
    },

    /// No routing rule or catalog entry resolves the tool name.
    #[error("no module provides tool '{tool}'{}", format_suggestions(suggestions))]
    NotFound {
        tool: String,
        suggestions: Vec<String>,
    },

    /// The resolved module exists but is not `Ready`.
    #[error("module '{module}' is unavailable (status: {status})")]
    ModuleUnavailable {
        module: String,
        status: ModuleStatus,
    },

    /// A load of the same module is already running.
    #[error("module '{module}' is already loading")]
    LoadInProgress { module: String },

    /// The request was invalidated by a manager shutdown.
    #[error("request to module '{module}' cancelled by shutdown")]
    Shutdown { module: String },

    /// The module answered with a JSON-RPC error object.
    #[error("module '{module}' returned error [{code}]: {message}")]
    Remote {
        module: String,
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// An in-process tool implementation returned an error.
    #[error("tool '{tool}' in module '{module}' failed: {reason}")]
    ToolFailed {
        module: String,
        tool: String,
        reason: String,
    },
}

impl BridgeError {
    /// Name of the module the error is attributed to, if any.
    pub fn module(&self) -> Option<&str> {
        match self {
            Self::Config { .. } | Self::NotFound { .. } => None,
            Self::ModuleLoad { module, .. }
            | Self::Discovery { module, .. }
            | Self::Protocol { module, .. }
            | Self::Transport { module, .. }
            | Self::Timeout { module, .. }
            | Self::ModuleUnavailable { module, .. }
            | Self::LoadInProgress { module }
            | Self::Shutdown { module }
            | Self::Remote { module, .. }
            | Self::ToolFailed { module, .. } => Some(module),
        }
    }
}

fn format_suggestions(suggestions: &[String]) -> String {
    if suggestions.is_empty() {
        String::new()
    } else {
        format!(" (did you mean: {})", suggestions.join(", "))
    }
}
