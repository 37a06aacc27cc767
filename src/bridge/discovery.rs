//! Discovery handshake: learn which tools a freshly started module exposes.
//!
//! Process modules: `initialize` request, `notifications/initialized`,
//! then `tools/list`. In-process modules: `initialize()` then `list_tools()`.
//! Any failure is reported as `BridgeError::Discovery` for that module.

use std::time::Duration;

use super::errors::BridgeError;
use super::lifecycle::{format_stderr_suffix, ModuleHandle, ModuleUnit};
use super::transport::ProtocolClient;
use super::types::{initialize_params, methods, InitializeResult, ListToolsResult, ToolDefinition};

/// How long a failed process gets to flush stderr before it is reported.
const STDERR_SETTLE: Duration = Duration::from_millis(200);

/// Run the discovery handshake, bounded by `timeout` overall.
pub async fn handshake(
    handle: &ModuleHandle,
    timeout: Duration,
) -> Result<Vec<ToolDefinition>, BridgeError> {
    let name = handle.name();

    let outcome = match tokio::time::timeout(timeout, run(handle)).await {
        Ok(result) => result,
        Err(_) => Err(format!(
            "handshake timed out after {}ms",
            timeout.as_millis()
        )),
    };

    match outcome {
        Ok(tools) => {
            tracing::info!(module = name, tools = tools.len(), "module discovery complete");
            Ok(tools)
        }
        Err(reason) => {
            let stderr = handle.failure_stderr(STDERR_SETTLE).await;
            if !stderr.trim().is_empty() {
                tracing::warn!(module = name, stderr = %stderr.trim(), "module stderr captured on failure");
            }
            Err(BridgeError::Discovery {
                module: name.to_string(),
                reason: format!("{reason}{}", format_stderr_suffix(&stderr)),
            })
        }
    }
}

async fn run(handle: &ModuleHandle) -> Result<Vec<ToolDefinition>, String> {
    match handle.unit() {
        ModuleUnit::Process(p) => process_handshake(p.client()).await,
        ModuleUnit::InProcess(module) => {
            module
                .initialize()
                .await
                .map_err(|e| format!("initialize failed: {e:#}"))?;
            module
                .list_tools()
                .await
                .map_err(|e| format!("list_tools failed: {e:#}"))
        }
    }
}

async fn process_handshake(client: &ProtocolClient) -> Result<Vec<ToolDefinition>, String> {
    let init = client
        .request(methods::INITIALIZE, Some(initialize_params()))
        .await
        .map_err(|e| format!("initialize failed: {e}"))?;

    // Modules are free to answer with an empty or partial object.
    match serde_json::from_value::<InitializeResult>(init) {
        Ok(info) => tracing::debug!(
            module = %client.module(),
            protocol_version = ?info.protocol_version,
            server = ?info.server_info.as_ref().map(|s| &s.name),
            "module initialized"
        ),
        Err(e) => tracing::debug!(
            module = %client.module(),
            error = %e,
            "unrecognized initialize result"
        ),
    }

    client
        .notify(methods::INITIALIZED, None)
        .await
        .map_err(|e| format!("failed to send initialized notification: {e}"))?;

    let listed = client
        .request(methods::TOOLS_LIST, None)
        .await
        .map_err(|e| format!("tools/list failed: {e}"))?;

    serde_json::from_value::<ListToolsResult>(listed)
        .map(|r| r.tools)
        .map_err(|e| format!("failed to parse tools/list response: {e}"))
}
