//! Test fixtures: an in-process echo module and a scripted stdio module.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;

use super::config::{ModuleConfig, ModuleDescriptor};
use super::lifecycle::{InProcessModule, ModuleHandle, ModuleUnit};
use super::registry::{ModuleStatus, StatusCell};
use super::types::ToolDefinition;

// ─── In-process ─────────────────────────────────────────────────────────────

/// Exposes `echo` (returns its arguments) and `explode` (always errors).
#[derive(Default)]
pub(crate) struct EchoModule {
    fail_initialize: bool,
    calls: AtomicUsize,
}

impl EchoModule {
    pub(crate) fn failing_initialize() -> Self {
        Self {
            fail_initialize: true,
            ..Self::default()
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InProcessModule for EchoModule {
    async fn initialize(&self) -> anyhow::Result<()> {
        if self.fail_initialize {
            anyhow::bail!("model file not found");
        }
        Ok(())
    }

    async fn list_tools(&self) -> anyhow::Result<Vec<ToolDefinition>> {
        Ok(["echo", "explode"]
            .into_iter()
            .map(|name| ToolDefinition {
                name: name.to_string(),
                description: format!("{name} test tool"),
                input_schema: serde_json::json!({"type": "object"}),
            })
            .collect())
    }

    async fn call_tool(
        &self,
        tool: &str,
        arguments: serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match tool {
            "echo" => Ok(serde_json::json!({ "echo": arguments })),
            "explode" => anyhow::bail!("exploded on purpose"),
            other => anyhow::bail!("unknown tool '{other}'"),
        }
    }
}

pub(crate) fn in_process_descriptor(name: &str, package: &str) -> Arc<ModuleDescriptor> {
    let cfg = ModuleConfig::in_process(package);
    Arc::new(ModuleDescriptor::from_config(name, &cfg).unwrap())
}

pub(crate) fn process_descriptor(name: &str, command: &str, args: &[&str]) -> Arc<ModuleDescriptor> {
    let cfg = ModuleConfig::process(command, args);
    Arc::new(ModuleDescriptor::from_config(name, &cfg).unwrap())
}

/// A `Ready` handle backed by an [`EchoModule`].
pub(crate) fn ready_in_process_handle(name: &str) -> Arc<ModuleHandle> {
    Arc::new(ModuleHandle::new(
        in_process_descriptor(name, "echo"),
        Arc::new(StatusCell::new(ModuleStatus::Ready)),
        ModuleUnit::InProcess(Arc::new(EchoModule::default())),
    ))
}

// ─── Scripted process ───────────────────────────────────────────────────────

/// Line-oriented JSON-RPC responder written in POSIX sh.
///
/// `tools/call` answers with `{"request": <the request frame>}`. The tool
/// names `sleepy`, `fail` and `crash` never answer, return an error and
/// exit the process respectively.
const FAKE_MODULE_SCRIPT: &str = r#"
[ -n "$FAKE_SPAWN_LOG" ] && echo spawn >> "$FAKE_SPAWN_LOG"
echo "fake module starting" >&2
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/^{"jsonrpc":"2.0","id":\([0-9]*\),.*/\1/p')
  [ -z "$id" ] && continue
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"fake","version":"0.0.1"}}}\n' "$id" ;;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[%s]}}\n' "$id" "$FAKE_TOOLS" ;;
    *'"method":"tools/call"'*'"name":"sleepy"'*)
      ;;
    *'"method":"tools/call"'*'"name":"fail"'*)
      printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32000,"message":"tool failed"}}\n' "$id" ;;
    *'"method":"tools/call"'*'"name":"crash"'*)
      exit 1 ;;
    *'"method":"tools/call"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"request":%s}}\n' "$id" "$line" ;;
    *)
      printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32601,"message":"method not found"}}\n' "$id" ;;
  esac
done
"#;

/// Builder for a [`FakeModuleScript`].
pub(crate) struct FakeModule {
    tools: Vec<String>,
}

impl FakeModule {
    pub(crate) fn new() -> Self {
        Self {
            tools: vec!["readFile".to_string()],
        }
    }

    pub(crate) fn with_tools(tools: &[&str]) -> Self {
        Self {
            tools: tools.iter().map(|t| t.to_string()).collect(),
        }
    }

    pub(crate) fn write(self) -> FakeModuleScript {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("module.sh");
        std::fs::write(&script, FAKE_MODULE_SCRIPT).unwrap();

        let tools_json = self
            .tools
            .iter()
            .map(|name| {
                serde_json::json!({
                    "name": name,
                    "description": format!("{name} tool"),
                    "inputSchema": {"type": "object"},
                })
                .to_string()
            })
            .collect::<Vec<_>>()
            .join(",");

        FakeModuleScript {
            spawn_log: dir.path().join("spawns.log"),
            dir,
            script,
            tools_json,
        }
    }
}

/// A written fake module; the script is deleted when this is dropped.
pub(crate) struct FakeModuleScript {
    #[allow(dead_code)]
    dir: TempDir,
    script: PathBuf,
    spawn_log: PathBuf,
    tools_json: String,
}

impl FakeModuleScript {
    pub(crate) fn config(&self) -> ModuleConfig {
        let script = self.script.to_string_lossy().into_owned();
        let mut cfg = ModuleConfig::process("sh", &[script.as_str()]);
        cfg.env.insert("FAKE_TOOLS".into(), self.tools_json.clone());
        cfg.env.insert(
            "FAKE_SPAWN_LOG".into(),
            self.spawn_log.to_string_lossy().into_owned(),
        );
        cfg
    }

    pub(crate) fn descriptor(&self, name: &str) -> Arc<ModuleDescriptor> {
        Arc::new(ModuleDescriptor::from_config(name, &self.config()).unwrap())
    }

    /// How many times the script has been started.
    pub(crate) fn spawn_count(&self) -> usize {
        std::fs::read_to_string(&self.spawn_log)
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }
}
