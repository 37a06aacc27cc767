//! ModuleManager, the public facade over supervisor, registry, catalog and router.
//!
//! Responsibilities:
//! - Activate profiles (load every enabled module, collect failures)
//! - Load individual modules (start → discover → register tools)
//! - Route tool calls, loading lazy modules on first use
//! - Shut everything down, rejecting in-flight calls first

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;

use super::catalog::{ToolCatalog, ToolDescriptor};
use super::config::{load_config_or_default, BridgeConfig, BridgeSettings, ModuleDescriptor};
use super::discovery;
use super::errors::BridgeError;
use super::lifecycle::{ModuleHandle, PackageCatalog, ProcessSupervisor};
use super::registry::{ModuleRegistry, ModuleStatus, Reservation};
use super::router::ToolRouter;

// ─── Reports ────────────────────────────────────────────────────────────────

/// A module that failed to start or complete discovery.
#[derive(Debug, Clone, Serialize)]
pub struct LoadFailure {
    pub module: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Outcome of [`ModuleManager::initialize_profile`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProfileActivation {
    pub profile: String,
    /// Modules that are `Ready`.
    pub loaded: Vec<String>,
    /// Modules whose load attempt failed.
    pub failed: Vec<LoadFailure>,
    /// Lazy modules, started on first use.
    pub deferred: Vec<String>,
    /// Disabled modules.
    pub skipped: Vec<String>,
}

impl ProfileActivation {
    fn new(profile: &str) -> Self {
        Self {
            profile: profile.to_string(),
            ..Self::default()
        }
    }
}

/// Marks a reserved registry entry `Failed` unless the load completes.
///
/// Covers load futures that are dropped half-way.
struct LoadGuard<'a> {
    registry: &'a ModuleRegistry,
    module: &'a str,
    armed: bool,
}

impl LoadGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.registry.mark_failed(self.module);
        }
    }
}

// ─── ModuleManager ──────────────────────────────────────────────────────────

/// Owns every module of one configuration and routes tool calls to them.
pub struct ModuleManager {
    config: BridgeConfig,
    descriptors: IndexMap<String, Arc<ModuleDescriptor>>,
    settings: BridgeSettings,
    supervisor: ProcessSupervisor,
    registry: ModuleRegistry,
    catalog: ToolCatalog,
    router: ToolRouter,
    failures: Mutex<Vec<LoadFailure>>,
    /// Incremented by every shutdown. Loads that straddle one are discarded.
    epoch: AtomicU64,
}

impl ModuleManager {
    /// Build a manager from a configuration document.
    ///
    /// Nothing is started until a profile or module is loaded.
    pub fn new(
        config: BridgeConfig,
        settings: BridgeSettings,
        packages: PackageCatalog,
    ) -> Result<Self, BridgeError> {
        config.validate()?;
        let descriptors = config.descriptors()?;
        let router = ToolRouter::from_config(&config.routing)?;

        Ok(Self {
            config,
            descriptors,
            supervisor: ProcessSupervisor::new(
                packages,
                settings.request_timeout,
                settings.shutdown_grace,
            ),
            settings,
            registry: ModuleRegistry::new(),
            catalog: ToolCatalog::new(),
            router,
            failures: Mutex::new(Vec::new()),
            epoch: AtomicU64::new(0),
        })
    }

    /// Build a manager from a config file; a missing or invalid file yields
    /// a manager with no modules.
    pub fn from_config_file(
        path: &Path,
        settings: BridgeSettings,
        packages: PackageCatalog,
    ) -> Result<Self, BridgeError> {
        Self::new(load_config_or_default(path), settings, packages)
    }

    // ─── Loading ────────────────────────────────────────────────────────

    /// Load every module listed by `profile`.
    ///
    /// Never aborts on a module failure; failures are reported in the
    /// returned activation. Enabled, eager modules load concurrently.
    pub async fn initialize_profile(&self, profile: &str) -> Result<ProfileActivation, BridgeError> {
        let members = self.config.profile_modules(profile)?;
        let mut activation = ProfileActivation::new(profile);
        let mut seen = HashSet::new();
        let mut to_load = Vec::new();

        for name in members {
            if !seen.insert(name.as_str()) {
                continue;
            }
            let Some(descriptor) = self.descriptors.get(name) else {
                continue;
            };
            if !descriptor.enabled {
                activation.skipped.push(name.clone());
            } else if descriptor.lazy {
                activation.deferred.push(name.clone());
            } else {
                to_load.push(name.as_str());
            }
        }

        let results =
            futures::future::join_all(to_load.iter().map(|name| self.load_module(name))).await;

        for (name, result) in to_load.into_iter().zip(results) {
            match result {
                Ok(()) => activation.loaded.push(name.to_string()),
                Err(e) => activation.failed.push(LoadFailure {
                    module: name.to_string(),
                    reason: e.to_string(),
                    at: Utc::now(),
                }),
            }
        }

        tracing::info!(
            profile,
            loaded = activation.loaded.len(),
            failed = activation.failed.len(),
            deferred = activation.deferred.len(),
            skipped = activation.skipped.len(),
            tools = self.catalog.len(),
            "profile activated"
        );

        Ok(activation)
    }

    /// Start a module, run discovery and register its tools.
    ///
    /// No-op if the module is already `Ready`.
    pub async fn load_module(&self, name: &str) -> Result<(), BridgeError> {
        let descriptor = self.descriptors.get(name).ok_or_else(|| BridgeError::Config {
            reason: format!("unknown module '{name}'"),
        })?;
        if !descriptor.enabled {
            return Err(BridgeError::ModuleLoad {
                module: name.to_string(),
                reason: "module is disabled".into(),
            });
        }

        let epoch = self.epoch.load(Ordering::Acquire);
        if self.registry.reserve(name)? == Reservation::AlreadyReady {
            tracing::debug!(module = name, "module already ready");
            return Ok(());
        }
        let guard = LoadGuard {
            registry: &self.registry,
            module: name,
            armed: true,
        };

        // Tools from an earlier, failed attempt.
        self.catalog.unregister_module(name);

        let outcome = self.start_and_discover(Arc::clone(descriptor)).await;

        if self.epoch.load(Ordering::Acquire) != epoch {
            guard.disarm();
            if let Ok(handle) = &outcome {
                self.catalog.unregister_module(name);
                self.supervisor.stop_handle(handle).await;
            }
            tracing::info!(module = name, "load interrupted by shutdown, discarded");
            return Err(BridgeError::Shutdown {
                module: name.to_string(),
            });
        }

        match outcome {
            Ok(handle) => {
                self.registry.activate(handle);
                guard.disarm();
                Ok(())
            }
            Err(e) => {
                tracing::error!(module = name, error = %e, "failed to load module");
                self.registry.mark_failed(name);
                guard.disarm();
                self.failures.lock().push(LoadFailure {
                    module: name.to_string(),
                    reason: e.to_string(),
                    at: Utc::now(),
                });
                Err(e)
            }
        }
    }

    async fn start_and_discover(
        &self,
        descriptor: Arc<ModuleDescriptor>,
    ) -> Result<Arc<ModuleHandle>, BridgeError> {
        let name = descriptor.name.clone();
        let handle = self.supervisor.start(descriptor).await?;

        let tools = match discovery::handshake(&handle, self.settings.discovery_timeout).await {
            Ok(tools) => tools,
            Err(e) => {
                self.supervisor.stop(&name).await;
                return Err(e);
            }
        };

        if !handle.mark_ready() {
            let status = handle.status();
            self.supervisor.stop(&name).await;
            return Err(BridgeError::Discovery {
                module: name,
                reason: format!("module exited during discovery (status: {status})"),
            });
        }

        let registered = self.catalog.register_module_tools(&name, tools);
        tracing::info!(
            module = %name,
            tools = registered,
            process = handle.descriptor().is_process(),
            "module ready"
        );
        Ok(handle)
    }

    // ─── Routing ────────────────────────────────────────────────────────

    /// Route a tool call to its module and return the module's result.
    ///
    /// A lazy module selected by routing is loaded first if it has never
    /// been started. A call to a module that is still loading waits for
    /// that load to settle.
    pub async fn route_tool_call(
        &self,
        tool: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, BridgeError> {
        let resolution = self.router.resolve(tool, &self.catalog)?;
        let module = resolution.module.as_str();

        if let Some(descriptor) = self.descriptors.get(module) {
            match self.registry.status(module) {
                ModuleStatus::Unloaded if descriptor.lazy && descriptor.enabled => {
                    tracing::info!(module, tool, "loading lazy module on demand");
                    match self.load_module(module).await {
                        Err(BridgeError::LoadInProgress { .. }) => {
                            self.registry.settled(module).await;
                        }
                        other => other?,
                    }
                }
                ModuleStatus::Loading => {
                    tracing::debug!(module, tool, "waiting for module load in progress");
                    self.registry.settled(module).await;
                }
                _ => {}
            }
        }

        self.router
            .dispatch(&resolution, params, &self.registry)
            .await
    }

    // ─── Shutdown ───────────────────────────────────────────────────────

    /// Reject in-flight calls, stop every module and forget all state.
    ///
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);

        // Tracked handles include modules still in discovery.
        let cancelled: usize = self
            .supervisor
            .tracked()
            .iter()
            .map(|h| h.cancel_pending())
            .sum();

        self.supervisor.stop_all().await;
        self.registry.clear();
        self.catalog.clear();

        tracing::info!(cancelled, "module manager shut down");
    }

    // ─── Introspection ──────────────────────────────────────────────────

    /// Status of a module; `Unloaded` for unknown or never-loaded names.
    pub fn module_status(&self, name: &str) -> ModuleStatus {
        self.registry.status(name)
    }

    /// `(name, status)` for every configured module, in configured order.
    pub fn module_statuses(&self) -> Vec<(String, ModuleStatus)> {
        self.descriptors
            .keys()
            .map(|name| (name.clone(), self.registry.status(name)))
            .collect()
    }

    /// Names of modules that are `Ready`.
    pub fn ready_modules(&self) -> Vec<String> {
        self.registry.ready_modules()
    }

    /// Qualified names of every discovered tool, in discovery order.
    pub fn tool_names(&self) -> Vec<String> {
        self.catalog.names()
    }

    /// Every discovered tool.
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.catalog.descriptors()
    }

    pub fn tool_count(&self) -> usize {
        self.catalog.len()
    }

    /// Load and discovery failures recorded since this manager was built.
    pub fn failures(&self) -> Vec<LoadFailure> {
        self.failures.lock().clone()
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn settings(&self) -> BridgeSettings {
        self.settings
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::config::{ModuleConfig, ProfileConfig, RoutingConfig, RuleConfig};
    use crate::bridge::testing::EchoModule;
    use std::time::Duration;

    fn settings() -> BridgeSettings {
        BridgeSettings {
            request_timeout: Duration::from_secs(5),
            discovery_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_millis(500),
        }
    }

    fn config(
        modules: Vec<(&str, ModuleConfig)>,
        profiles: &[(&str, &[&str])],
        rules: &[(&str, &str)],
    ) -> BridgeConfig {
        BridgeConfig {
            modules: modules
                .into_iter()
                .map(|(name, cfg)| (name.to_string(), cfg))
                .collect(),
            profiles: profiles
                .iter()
                .map(|(name, members)| {
                    (
                        name.to_string(),
                        ProfileConfig {
                            enabled_modules: members.iter().map(|m| m.to_string()).collect(),
                        },
                    )
                })
                .collect(),
            routing: RoutingConfig {
                rules: rules
                    .iter()
                    .map(|(pattern, target)| RuleConfig {
                        pattern: pattern.to_string(),
                        target: target.to_string(),
                    })
                    .collect(),
            },
        }
    }

    fn echo_packages(module: Arc<EchoModule>) -> PackageCatalog {
        let mut packages = PackageCatalog::new();
        packages.register_instance("echo", module);
        packages
    }

    #[test]
    fn test_invalid_rule_is_rejected() {
        let cfg = config(
            vec![("echo", ModuleConfig::in_process("echo"))],
            &[],
            &[("(", "echo")],
        );
        let err = ModuleManager::new(cfg, settings(), PackageCatalog::new())
            .err()
            .unwrap();
        assert!(matches!(err, BridgeError::Config { .. }));
    }

    #[tokio::test]
    async fn test_in_process_profile_and_call() {
        let echo = Arc::new(EchoModule::default());
        let cfg = config(
            vec![("echo", ModuleConfig::in_process("echo"))],
            &[("default", &["echo"])],
            &[],
        );
        let manager = ModuleManager::new(cfg, settings(), echo_packages(echo.clone())).unwrap();

        let activation = manager.initialize_profile("default").await.unwrap();
        assert_eq!(activation.loaded, vec!["echo"]);
        assert!(activation.failed.is_empty());
        assert_eq!(manager.module_status("echo"), ModuleStatus::Ready);
        assert_eq!(manager.tool_names(), vec!["echo.echo", "echo.explode"]);

        let result = manager
            .route_tool_call("echo", serde_json::json!({"msg": "hi"}))
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!({"echo": {"msg": "hi"}}));

        let err = manager
            .route_tool_call("echo.explode", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::ToolFailed { .. }));
        assert_eq!(echo.calls(), 2);
    }

    #[tokio::test]
    async fn test_unknown_profile_is_config_error() {
        let manager =
            ModuleManager::new(BridgeConfig::default(), settings(), PackageCatalog::new()).unwrap();
        let err = manager.initialize_profile("nope").await.unwrap_err();
        assert!(matches!(err, BridgeError::Config { .. }));
    }

    #[tokio::test]
    async fn test_profile_classifies_disabled_and_lazy() {
        let mut disabled = ModuleConfig::in_process("echo");
        disabled.enabled = false;
        let mut lazy = ModuleConfig::in_process("echo");
        lazy.lazy = true;

        let cfg = config(
            vec![
                ("eager", ModuleConfig::in_process("echo")),
                ("off", disabled),
                ("later", lazy),
            ],
            &[("all", &["eager", "off", "later", "eager"])],
            &[],
        );
        let manager =
            ModuleManager::new(cfg, settings(), echo_packages(Arc::default())).unwrap();

        let activation = manager.initialize_profile("all").await.unwrap();
        assert_eq!(activation.loaded, vec!["eager"]);
        assert_eq!(activation.skipped, vec!["off"]);
        assert_eq!(activation.deferred, vec!["later"]);
        assert_eq!(manager.module_status("later"), ModuleStatus::Unloaded);

        let err = manager.load_module("off").await.unwrap_err();
        assert!(matches!(err, BridgeError::ModuleLoad { .. }));
        let err = manager.load_module("ghost").await.unwrap_err();
        assert!(matches!(err, BridgeError::Config { .. }));
    }

    #[tokio::test]
    async fn test_lazy_module_loads_on_first_routed_call() {
        let echo = Arc::new(EchoModule::default());
        let mut lazy = ModuleConfig::in_process("echo");
        lazy.lazy = true;
        let cfg = config(
            vec![("later", lazy)],
            &[("p", &["later"])],
            &[("^echo$", "later")],
        );
        let manager = ModuleManager::new(cfg, settings(), echo_packages(echo.clone())).unwrap();
        manager.initialize_profile("p").await.unwrap();
        assert_eq!(manager.tool_count(), 0);

        let result = manager
            .route_tool_call("echo", serde_json::json!(1))
            .await
            .unwrap();
        assert_eq!(result["echo"], 1);
        assert_eq!(manager.module_status("later"), ModuleStatus::Ready);
        assert_eq!(manager.tool_count(), 2);
    }

    #[tokio::test]
    async fn test_rule_to_unloaded_module_is_unavailable() {
        let cfg = config(
            vec![("echo", ModuleConfig::in_process("echo"))],
            &[],
            &[("^echo$", "echo")],
        );
        let manager =
            ModuleManager::new(cfg, settings(), echo_packages(Arc::default())).unwrap();
        let err = manager
            .route_tool_call("echo", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BridgeError::ModuleUnavailable {
                status: ModuleStatus::Unloaded,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_failed_module_does_not_block_others() {
        let cfg = config(
            vec![
                ("ok", ModuleConfig::in_process("echo")),
                ("broken", ModuleConfig::in_process("missing-package")),
            ],
            &[("p", &["broken", "ok"])],
            &[],
        );
        let manager =
            ModuleManager::new(cfg, settings(), echo_packages(Arc::default())).unwrap();

        let activation = manager.initialize_profile("p").await.unwrap();
        assert_eq!(activation.loaded, vec!["ok"]);
        assert_eq!(activation.failed.len(), 1);
        assert_eq!(activation.failed[0].module, "broken");
        assert_eq!(manager.module_status("broken"), ModuleStatus::Failed);
        assert_eq!(manager.failures().len(), 1);
        assert!(manager
            .route_tool_call("ok.echo", serde_json::json!({}))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let cfg = config(
            vec![("echo", ModuleConfig::in_process("echo"))],
            &[("p", &["echo"])],
            &[],
        );
        let manager =
            ModuleManager::new(cfg, settings(), echo_packages(Arc::default())).unwrap();
        manager.initialize_profile("p").await.unwrap();

        manager.shutdown().await;
        manager.shutdown().await;
        assert_eq!(manager.module_status("echo"), ModuleStatus::Unloaded);
        assert_eq!(manager.tool_count(), 0);
        let err = manager
            .route_tool_call("echo", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_from_missing_config_file_is_empty() {
        let manager = ModuleManager::from_config_file(
            Path::new("/nonexistent/bridge.yaml"),
            settings(),
            PackageCatalog::new(),
        )
        .unwrap();
        assert!(manager.module_statuses().is_empty());
    }

    // ─── Process modules ────────────────────────────────────────────────

    #[cfg(unix)]
    mod process {
        use super::*;
        use crate::bridge::testing::{FakeModule, FakeModuleScript};

        fn process_manager(script: &FakeModuleScript, timeout_ms: Option<u64>) -> ModuleManager {
            let mut fs = script.config();
            fs.timeout_ms = timeout_ms;
            let cfg = config(vec![("fs", fs)], &[("coding", &["fs"])], &[]);
            ModuleManager::new(cfg, settings(), PackageCatalog::new()).unwrap()
        }

        #[tokio::test]
        async fn test_one_spawn_per_module_and_routed_call() {
            let script = FakeModule::new().write();
            let manager = process_manager(&script, None);

            let activation = manager.initialize_profile("coding").await.unwrap();
            assert_eq!(activation.loaded, vec!["fs"]);
            assert_eq!(script.spawn_count(), 1);
            assert_eq!(manager.tool_names(), vec!["fs.readFile"]);

            manager.load_module("fs").await.unwrap();
            manager.initialize_profile("coding").await.unwrap();
            assert_eq!(script.spawn_count(), 1);

            let result = manager
                .route_tool_call("readFile", serde_json::json!({"path": "a.txt"}))
                .await
                .unwrap();
            let request = &result["request"];
            assert_eq!(request["method"], "tools/call");
            assert_eq!(request["params"]["name"], "readFile");
            assert_eq!(request["params"]["arguments"]["path"], "a.txt");

            manager.shutdown().await;
        }

        #[tokio::test]
        async fn test_concurrent_calls_do_not_cross() {
            let script = FakeModule::new().write();
            let manager = process_manager(&script, None);
            manager.initialize_profile("coding").await.unwrap();

            let calls = (0..16).map(|n| {
                let manager = &manager;
                async move {
                    let result = manager
                        .route_tool_call("fs.readFile", serde_json::json!({"n": n}))
                        .await
                        .unwrap();
                    (n, result)
                }
            });
            for (n, result) in futures::future::join_all(calls).await {
                assert_eq!(result["request"]["params"]["arguments"]["n"], n);
            }

            manager.shutdown().await;
        }

        #[tokio::test]
        async fn test_silent_tool_times_out_and_purges() {
            let script = FakeModule::with_tools(&["readFile", "sleepy"]).write();
            let manager = process_manager(&script, Some(200));
            manager.initialize_profile("coding").await.unwrap();

            let err = manager
                .route_tool_call("sleepy", serde_json::json!({}))
                .await
                .unwrap_err();
            assert!(matches!(err, BridgeError::Timeout { timeout_ms: 200, .. }));

            let handle = manager.registry.ready_handle("fs").unwrap();
            assert_eq!(handle.client().unwrap().pending_count(), 0);

            // The module is still usable afterwards.
            assert!(manager
                .route_tool_call("readFile", serde_json::json!({}))
                .await
                .is_ok());
            manager.shutdown().await;
        }

        #[tokio::test]
        async fn test_remote_error_is_returned() {
            let script = FakeModule::with_tools(&["fail"]).write();
            let manager = process_manager(&script, None);
            manager.initialize_profile("coding").await.unwrap();

            let err = manager
                .route_tool_call("fail", serde_json::json!({}))
                .await
                .unwrap_err();
            match err {
                BridgeError::Remote { code, message, .. } => {
                    assert_eq!(code, -32000);
                    assert_eq!(message, "tool failed");
                }
                other => panic!("expected Remote, got {other:?}"),
            }
            manager.shutdown().await;
        }

        #[tokio::test]
        async fn test_shutdown_rejects_pending_calls() {
            let script = FakeModule::with_tools(&["sleepy"]).write();
            let manager = process_manager(&script, None);
            manager.initialize_profile("coding").await.unwrap();
            let handle = manager.registry.ready_handle("fs").unwrap();

            let call = manager.route_tool_call("sleepy", serde_json::json!({}));
            let stop = async {
                while handle.client().unwrap().pending_count() == 0 {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                manager.shutdown().await;
            };
            let (result, ()) = tokio::join!(call, stop);

            assert!(matches!(result, Err(BridgeError::Shutdown { .. })));
            assert_eq!(handle.status(), ModuleStatus::Stopped);
            assert_eq!(manager.module_status("fs"), ModuleStatus::Unloaded);
        }

        #[tokio::test]
        async fn test_crash_marks_failed_and_reload_respawns() {
            let script = FakeModule::with_tools(&["readFile", "crash"]).write();
            let manager = process_manager(&script, None);
            manager.initialize_profile("coding").await.unwrap();
            let handle = manager.registry.ready_handle("fs").unwrap();

            let err = manager
                .route_tool_call("crash", serde_json::json!({}))
                .await
                .unwrap_err();
            assert!(matches!(err, BridgeError::Transport { .. }));

            for _ in 0..100 {
                if handle.status() == ModuleStatus::Failed {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            assert_eq!(manager.module_status("fs"), ModuleStatus::Failed);

            manager.load_module("fs").await.unwrap();
            assert_eq!(script.spawn_count(), 2);
            assert_eq!(manager.module_status("fs"), ModuleStatus::Ready);
            manager.shutdown().await;
        }

        #[tokio::test]
        async fn test_concurrent_first_calls_share_lazy_load() {
            let script = FakeModule::new().write();
            let mut fs = script.config();
            fs.lazy = true;
            let cfg = config(
                vec![("fs", fs)],
                &[("coding", &["fs"])],
                &[("^readFile$", "fs")],
            );
            let manager = ModuleManager::new(cfg, settings(), PackageCatalog::new()).unwrap();
            manager.initialize_profile("coding").await.unwrap();

            let (first, second) = tokio::join!(
                manager.route_tool_call("readFile", serde_json::json!({"n": 1})),
                manager.route_tool_call("readFile", serde_json::json!({"n": 2})),
            );
            assert_eq!(first.unwrap()["request"]["params"]["arguments"]["n"], 1);
            assert_eq!(second.unwrap()["request"]["params"]["arguments"]["n"], 2);
            assert_eq!(script.spawn_count(), 1);
            manager.shutdown().await;
        }

        #[tokio::test]
        async fn test_call_during_activation_waits_for_load() {
            let script = FakeModule::new().write();
            let cfg = config(
                vec![("fs", script.config())],
                &[("coding", &["fs"])],
                &[("^readFile$", "fs")],
            );
            let manager = ModuleManager::new(cfg, settings(), PackageCatalog::new()).unwrap();

            let (activation, result) = tokio::join!(
                manager.initialize_profile("coding"),
                manager.route_tool_call("readFile", serde_json::json!({})),
            );
            assert_eq!(activation.unwrap().loaded, vec!["fs"]);
            assert!(result.is_ok(), "got {result:?}");
            assert_eq!(script.spawn_count(), 1);
            manager.shutdown().await;
        }

        #[tokio::test]
        async fn test_shutdown_during_discovery_discards_load() {
            let cfg = config(
                vec![("mute", ModuleConfig::process("sh", &["-c", "exec sleep 30"]))],
                &[],
                &[],
            );
            let manager = ModuleManager::new(cfg, settings(), PackageCatalog::new()).unwrap();

            let stop = async {
                let in_discovery = || {
                    manager
                        .supervisor
                        .tracked()
                        .iter()
                        .any(|h| h.client().is_some_and(|c| c.pending_count() > 0))
                };
                while !in_discovery() {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                manager.shutdown().await;
            };
            let (loaded, ()) = tokio::join!(manager.load_module("mute"), stop);

            assert!(matches!(loaded, Err(BridgeError::Shutdown { .. })), "got {loaded:?}");
            assert_eq!(manager.module_status("mute"), ModuleStatus::Unloaded);
            assert!(manager.failures().is_empty());
            assert!(manager.supervisor.tracked().is_empty());
        }

        /// Answers the handshake, then never reads its input again.
        fn stuck_manager(timeout_ms: Option<u64>) -> ModuleManager {
            let script = concat!(
                "read -r line; ",
                r#"printf '{"jsonrpc":"2.0","id":1,"result":{}}\n'; "#,
                "read -r line; read -r line; ",
                r#"printf '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"readFile"}]}}\n'; "#,
                "exec sleep 60",
            );
            let mut stuck = ModuleConfig::process("sh", &["-c", script]);
            stuck.timeout_ms = timeout_ms;
            let cfg = config(vec![("stuck", stuck)], &[("p", &["stuck"])], &[]);
            ModuleManager::new(cfg, settings(), PackageCatalog::new()).unwrap()
        }

        fn oversized_params() -> serde_json::Value {
            serde_json::json!({"blob": "x".repeat(1024 * 1024)})
        }

        #[tokio::test]
        async fn test_unread_input_still_times_out() {
            let manager = stuck_manager(Some(200));
            let activation = manager.initialize_profile("p").await.unwrap();
            assert_eq!(activation.loaded, vec!["stuck"]);

            let call = manager.route_tool_call("readFile", oversized_params());
            let err = tokio::time::timeout(Duration::from_secs(3), call)
                .await
                .expect("call outlived its deadline")
                .unwrap_err();
            assert!(matches!(err, BridgeError::Timeout { timeout_ms: 200, .. }));

            tokio::time::timeout(Duration::from_secs(5), manager.shutdown())
                .await
                .expect("shutdown blocked");
        }

        #[tokio::test]
        async fn test_shutdown_releases_call_blocked_on_write() {
            let manager = stuck_manager(None);
            manager.initialize_profile("p").await.unwrap();
            let handle = manager.registry.ready_handle("stuck").unwrap();

            let call = manager.route_tool_call("readFile", oversized_params());
            let stop = async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                manager.shutdown().await;
            };
            let joined = tokio::time::timeout(Duration::from_secs(5), async {
                tokio::join!(call, stop)
            })
            .await;

            let (result, ()) = joined.expect("call and shutdown still blocked");
            assert!(matches!(result, Err(BridgeError::Shutdown { .. })), "got {result:?}");
            assert_eq!(handle.status(), ModuleStatus::Stopped);
        }

        #[tokio::test]
        async fn test_discovery_failure_is_isolated() {
            let script = FakeModule::new().write();
            let cfg = config(
                vec![
                    ("fs", script.config()),
                    ("crash", ModuleConfig::process("sh", &["-c", "exit 3"])),
                ],
                &[("coding", &["crash", "fs"])],
                &[],
            );
            let manager = ModuleManager::new(cfg, settings(), PackageCatalog::new()).unwrap();

            let activation = manager.initialize_profile("coding").await.unwrap();
            assert_eq!(activation.loaded, vec!["fs"]);
            assert_eq!(activation.failed.len(), 1);
            assert_eq!(activation.failed[0].module, "crash");
            assert_eq!(manager.module_status("crash"), ModuleStatus::Failed);
            assert_eq!(manager.tool_names(), vec!["fs.readFile"]);
            manager.shutdown().await;
        }
    }
}
