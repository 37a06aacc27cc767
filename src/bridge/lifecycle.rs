//! Module lifecycle management.
//!
//! Handles starting, monitoring and stopping module execution units. A
//! process module runs as a separate OS process speaking JSON-RPC over
//! stdio; an in-process module is a shared code unit resolved from the
//! host's `PackageCatalog`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncBufReadExt;
use tokio::process::{ChildStderr, Command};
use tokio::sync::{oneshot, watch};

use super::config::{ModuleDescriptor, ModuleKind};
use super::errors::BridgeError;
use super::registry::{ModuleStatus, StatusCell};
use super::transport::ProtocolClient;
use super::types::{methods, tool_call_params, ToolDefinition};

// ─── Constants ──────────────────────────────────────────────────────────────

/// Maximum stderr kept per module for failure diagnostics.
const STDERR_TAIL_LIMIT: usize = 2000;

/// How long the best-effort `shutdown` notification may take.
const SHUTDOWN_NOTIFY_TIMEOUT: Duration = Duration::from_millis(250);

// ─── In-process Modules ─────────────────────────────────────────────────────

/// A tool provider that runs inside the host process.
#[async_trait]
pub trait InProcessModule: Send + Sync {
    /// Called once before `list_tools`. Defaults to a no-op.
    async fn initialize(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Tools this module exposes.
    async fn list_tools(&self) -> anyhow::Result<Vec<ToolDefinition>>;

    /// Execute one tool. `tool` is the bare name (no module prefix).
    async fn call_tool(&self, tool: &str, arguments: serde_json::Value)
        -> anyhow::Result<serde_json::Value>;
}

/// Constructor for an in-process module, registered under a package name.
pub type ModuleFactory =
    Arc<dyn Fn() -> anyhow::Result<Arc<dyn InProcessModule>> + Send + Sync>;

/// Package name → factory. Resolves the `package` of in-process modules.
#[derive(Clone, Default)]
pub struct PackageCatalog {
    factories: HashMap<String, ModuleFactory>,
}

impl PackageCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for `package`, replacing any previous one.
    pub fn register<F>(&mut self, package: &str, factory: F)
    where
        F: Fn() -> anyhow::Result<Arc<dyn InProcessModule>> + Send + Sync + 'static,
    {
        self.factories.insert(package.to_string(), Arc::new(factory));
    }

    /// Register an already-built, shared instance.
    pub fn register_instance(&mut self, package: &str, module: Arc<dyn InProcessModule>) {
        self.register(package, move || Ok(Arc::clone(&module)));
    }

    fn instantiate(&self, module: &str, package: &str) -> Result<Arc<dyn InProcessModule>, BridgeError> {
        let factory = self.factories.get(package).ok_or_else(|| BridgeError::ModuleLoad {
            module: module.to_string(),
            reason: format!("unknown package '{package}'"),
        })?;
        factory().map_err(|e| BridgeError::ModuleLoad {
            module: module.to_string(),
            reason: format!("package '{package}' failed to load: {e:#}"),
        })
    }

    pub fn contains(&self, package: &str) -> bool {
        self.factories.contains_key(package)
    }
}

// ─── Execution Units ────────────────────────────────────────────────────────

/// A running subprocess with its protocol client.
pub struct ProcessUnit {
    client: ProtocolClient,
    pid: Option<u32>,
    /// Dropping or firing this asks the exit observer to kill the process.
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    /// Becomes `true` once the process has been reaped.
    exited: watch::Receiver<bool>,
    stderr_tail: Arc<Mutex<String>>,
    /// Becomes `true` once stderr reached end of stream.
    stderr_closed: watch::Receiver<bool>,
}

impl ProcessUnit {
    pub fn client(&self) -> &ProtocolClient {
        &self.client
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the process has been reaped.
    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Tail of everything the process wrote to stderr.
    pub fn stderr_tail(&self) -> String {
        self.stderr_tail.lock().clone()
    }

    /// Stderr tail after giving the drain task up to `wait` to reach EOF.
    pub async fn settled_stderr_tail(&self, wait: Duration) -> String {
        let mut closed = self.stderr_closed.clone();
        let _ = tokio::time::timeout(wait, closed.wait_for(|done| *done)).await;
        self.stderr_tail()
    }

    fn request_kill(&self) {
        if let Some(tx) = self.kill_tx.lock().take() {
            let _ = tx.send(());
        }
    }

    async fn wait_exit(&self, timeout: Duration) -> bool {
        let mut exited = self.exited.clone();
        tokio::time::timeout(timeout, exited.wait_for(|done| *done))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    /// Best-effort `shutdown` notification, close stdin, wait, then kill.
    async fn terminate(&self, grace: Duration) {
        if self.has_exited() {
            return;
        }

        let _ = tokio::time::timeout(
            SHUTDOWN_NOTIFY_TIMEOUT,
            self.client.notify(methods::SHUTDOWN, None),
        )
        .await;
        // A write stuck on a full pipe keeps stdin busy; go straight to kill.
        let closed = self.client.close_input(grace).await;
        if closed && self.wait_exit(grace).await {
            return;
        }

        tracing::warn!(
            module = %self.client.module(),
            pid = ?self.pid,
            grace_ms = grace.as_millis() as u64,
            "module did not exit gracefully, killing"
        );
        self.request_kill();
        if !self.wait_exit(grace).await {
            tracing::error!(
                module = %self.client.module(),
                pid = ?self.pid,
                "module process could not be reaped after kill"
            );
        }
    }
}

/// The live execution unit of a module.
///
/// Both kinds expose the same `invoke`, so routing never branches on kind.
pub enum ModuleUnit {
    Process(ProcessUnit),
    InProcess(Arc<dyn InProcessModule>),
}

// ─── ModuleHandle ───────────────────────────────────────────────────────────

/// Owns exactly one live execution unit for a module name.
pub struct ModuleHandle {
    descriptor: Arc<ModuleDescriptor>,
    status: Arc<StatusCell>,
    unit: ModuleUnit,
}

impl fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleHandle")
            .field("name", &self.name())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl ModuleHandle {
    pub(crate) fn new(
        descriptor: Arc<ModuleDescriptor>,
        status: Arc<StatusCell>,
        unit: ModuleUnit,
    ) -> Self {
        Self {
            descriptor,
            status,
            unit,
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    pub fn unit(&self) -> &ModuleUnit {
        &self.unit
    }

    pub fn status(&self) -> ModuleStatus {
        self.status.get()
    }

    pub fn set_status(&self, status: ModuleStatus) {
        self.status.set(status);
    }

    /// `Loading → Ready`. Fails if the unit already exited or was stopped.
    pub fn mark_ready(&self) -> bool {
        self.status.transition(ModuleStatus::Loading, ModuleStatus::Ready)
    }

    /// Protocol client of a process module.
    pub fn client(&self) -> Option<&ProtocolClient> {
        match &self.unit {
            ModuleUnit::Process(p) => Some(p.client()),
            ModuleUnit::InProcess(_) => None,
        }
    }

    /// Captured stderr tail (process modules only; empty otherwise).
    pub fn stderr_tail(&self) -> String {
        match &self.unit {
            ModuleUnit::Process(p) => p.stderr_tail(),
            ModuleUnit::InProcess(_) => String::new(),
        }
    }

    /// Stderr for failure reports, once the process had a moment to flush it.
    pub async fn failure_stderr(&self, wait: Duration) -> String {
        match &self.unit {
            ModuleUnit::Process(p) => p.settled_stderr_tail(wait).await,
            ModuleUnit::InProcess(_) => String::new(),
        }
    }

    /// Execute a tool on this module and return its raw result.
    ///
    /// `tool` is the bare tool name the module knows.
    pub async fn invoke(
        &self,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, BridgeError> {
        match &self.unit {
            ModuleUnit::Process(p) => {
                let params = Some(tool_call_params(tool, arguments));
                match self.descriptor.timeout {
                    Some(timeout) => {
                        p.client
                            .request_with_timeout(methods::TOOLS_CALL, params, timeout)
                            .await
                    }
                    None => p.client.request(methods::TOOLS_CALL, params).await,
                }
            }
            ModuleUnit::InProcess(module) => {
                module
                    .call_tool(tool, arguments)
                    .await
                    .map_err(|e| BridgeError::ToolFailed {
                        module: self.name().to_string(),
                        tool: tool.to_string(),
                        reason: format!("{e:#}"),
                    })
            }
        }
    }

    /// Reject all in-flight requests with `Shutdown`.
    pub fn cancel_pending(&self) -> usize {
        self.client().map(ProtocolClient::cancel_all).unwrap_or(0)
    }

    /// Terminate the execution unit. Idempotent.
    async fn terminate(&self, grace: Duration) {
        if !self.status.begin_shutdown() {
            return;
        }
        if let ModuleUnit::Process(p) = &self.unit {
            p.terminate(grace).await;
        }
        self.status.set(ModuleStatus::Stopped);
    }
}

// ─── ProcessSupervisor ──────────────────────────────────────────────────────

/// Starts, tracks and stops module execution units.
pub struct ProcessSupervisor {
    packages: PackageCatalog,
    request_timeout: Duration,
    shutdown_grace: Duration,
    handles: Mutex<HashMap<String, Arc<ModuleHandle>>>,
}

impl ProcessSupervisor {
    pub fn new(packages: PackageCatalog, request_timeout: Duration, shutdown_grace: Duration) -> Self {
        Self {
            packages,
            request_timeout,
            shutdown_grace,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Start a module's execution unit. The handle starts in `Loading`;
    /// the caller runs discovery before treating it as `Ready`.
    ///
    /// A previous handle for the same name is stopped first.
    pub async fn start(&self, descriptor: Arc<ModuleDescriptor>) -> Result<Arc<ModuleHandle>, BridgeError> {
        self.stop(&descriptor.name).await;

        let status = Arc::new(StatusCell::new(ModuleStatus::Loading));
        let unit = match &descriptor.kind {
            ModuleKind::Process {
                command,
                args,
                env,
                cwd,
            } => ModuleUnit::Process(self.spawn_process(
                &descriptor.name,
                command,
                args,
                env,
                cwd.as_deref(),
                Arc::clone(&status),
            )?),
            ModuleKind::InProcess { package } => {
                ModuleUnit::InProcess(self.packages.instantiate(&descriptor.name, package)?)
            }
        };

        let handle = Arc::new(ModuleHandle::new(descriptor, status, unit));
        self.handles
            .lock()
            .insert(handle.name().to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    fn spawn_process(
        &self,
        name: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        cwd: Option<&str>,
        status: Arc<StatusCell>,
    ) -> Result<ProcessUnit, BridgeError> {
        let mut cmd = Command::new(command);
        cmd.args(args);
        cmd.envs(env);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| BridgeError::ModuleLoad {
            module: name.to_string(),
            reason: format!("failed to spawn '{command}': {e}"),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| BridgeError::ModuleLoad {
            module: name.to_string(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| BridgeError::ModuleLoad {
            module: name.to_string(),
            reason: "failed to capture stdout".into(),
        })?;
        let pid = child.id();

        let stderr_tail = Arc::new(Mutex::new(String::new()));
        let (stderr_closed_tx, stderr_closed) = watch::channel(false);
        match child.stderr.take() {
            Some(stderr) => {
                tokio::spawn(drain_stderr(
                    name.to_string(),
                    stderr,
                    Arc::clone(&stderr_tail),
                    stderr_closed_tx,
                ));
            }
            None => {
                let _ = stderr_closed_tx.send(true);
            }
        }

        // Exit observer: owns the child, reaps it, and kills it on request.
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exited_tx, exited_rx) = watch::channel(false);
        let module = name.to_string();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                res = child.wait() => res,
                _ = kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let status_after = status.on_exit();
            match (&outcome, status_after) {
                (_, ModuleStatus::Stopped) => {
                    tracing::debug!(module = %module, exit = ?outcome, "module process stopped");
                }
                (Ok(exit), _) => {
                    tracing::warn!(module = %module, exit = %exit, "module process exited unexpectedly");
                }
                (Err(e), _) => {
                    tracing::warn!(module = %module, error = %e, "failed to wait on module process");
                }
            }
            let _ = exited_tx.send(true);
        });

        tracing::info!(module = name, command, pid = ?pid, "spawned module process");

        Ok(ProcessUnit {
            client: ProtocolClient::new(name, Box::new(stdin), stdout, self.request_timeout),
            pid,
            kill_tx: Mutex::new(Some(kill_tx)),
            exited: exited_rx,
            stderr_tail,
            stderr_closed,
        })
    }

    /// Stop a module: graceful termination, bounded wait, then force-kill.
    ///
    /// Stopping an unknown or already-stopped module is a no-op.
    pub async fn stop(&self, name: &str) {
        let handle = self.handles.lock().remove(name);
        if let Some(handle) = handle {
            handle.terminate(self.shutdown_grace).await;
            tracing::info!(module = name, "module stopped");
        }
    }

    /// Stop one specific handle. It is untracked only if it is still the
    /// tracked handle for its name.
    pub async fn stop_handle(&self, handle: &Arc<ModuleHandle>) {
        {
            let mut handles = self.handles.lock();
            if handles
                .get(handle.name())
                .is_some_and(|tracked| Arc::ptr_eq(tracked, handle))
            {
                handles.remove(handle.name());
            }
        }
        handle.terminate(self.shutdown_grace).await;
    }

    /// Stop every tracked module concurrently and wait for all of them.
    pub async fn stop_all(&self) {
        let handles: Vec<Arc<ModuleHandle>> = self.handles.lock().drain().map(|(_, h)| h).collect();
        if handles.is_empty() {
            return;
        }

        let grace = self.shutdown_grace;
        let tasks: Vec<_> = handles
            .into_iter()
            .map(|handle| {
                tokio::spawn(async move {
                    handle.terminate(grace).await;
                    handle.name().to_string()
                })
            })
            .collect();

        for result in futures::future::join_all(tasks).await {
            match result {
                Ok(name) => tracing::debug!(module = %name, "module stopped"),
                Err(e) => tracing::error!(error = %e, "module stop task failed"),
            }
        }
    }

    /// Handles currently tracked, including ones still in discovery.
    pub fn tracked(&self) -> Vec<Arc<ModuleHandle>> {
        self.handles.lock().values().cloned().collect()
    }

    #[cfg(test)]
    fn is_tracked(&self, name: &str) -> bool {
        self.handles.lock().contains_key(name)
    }
}

/// Forward a module's stderr to tracing, keeping a bounded tail.
async fn drain_stderr(
    module: String,
    stderr: ChildStderr,
    tail: Arc<Mutex<String>>,
    closed: watch::Sender<bool>,
) {
    let mut lines = tokio::io::BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(module = %module, stderr = %line, "module stderr");
        let mut tail = tail.lock();
        tail.push_str(&line);
        tail.push('\n');
        if tail.len() > STDERR_TAIL_LIMIT {
            let mut cut = tail.len() - STDERR_TAIL_LIMIT;
            while !tail.is_char_boundary(cut) {
                cut += 1;
            }
            tail.drain(..cut);
        }
    }
    let _ = closed.send(true);
}

/// Format a stderr suffix for error messages (empty string if no stderr).
pub(crate) fn format_stderr_suffix(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(" | stderr: {trimmed}")
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
