//! Bridge configuration loading and validation.
//!
//! Reads the module / profile / routing document (YAML or JSON) and resolves
//! environment variables. Validation happens once, at load time, so routing
//! never has to deal with a malformed rule.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::errors::BridgeError;
use super::router::RoutingRule;

// ─── Document Types ─────────────────────────────────────────────────────────

/// How a module is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModuleKindConfig {
    /// External subprocess speaking JSON-RPC over stdio.
    Process,
    /// Code unit registered with the host's `PackageCatalog`.
    InProcess,
}

/// One entry under `modules:`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfig {
    pub kind: ModuleKindConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub lazy: bool,
    /// Extra environment variables for the subprocess.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    /// Working directory for the subprocess.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Per-module request deadline, overriding the manager default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Any other keys, passed through untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_enabled() -> bool {
    true
}

impl ModuleConfig {
    /// An enabled, eagerly loaded subprocess module.
    pub fn process(command: &str, args: &[&str]) -> Self {
        Self {
            kind: ModuleKindConfig::Process,
            command: Some(command.to_string()),
            args: args.iter().map(|a| a.to_string()).collect(),
            package: None,
            enabled: true,
            lazy: false,
            env: HashMap::new(),
            cwd: None,
            timeout_ms: None,
            extra: serde_json::Map::new(),
        }
    }

    /// An enabled, eagerly loaded in-process module.
    pub fn in_process(package: &str) -> Self {
        Self {
            kind: ModuleKindConfig::InProcess,
            command: None,
            args: Vec::new(),
            package: Some(package.to_string()),
            enabled: true,
            lazy: false,
            env: HashMap::new(),
            cwd: None,
            timeout_ms: None,
            extra: serde_json::Map::new(),
        }
    }
}

/// One entry under `profiles:`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileConfig {
    #[serde(default)]
    pub enabled_modules: Vec<String>,
}

/// One routing rule: a regex over tool names and the module it selects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    pub pattern: String,
    pub target: String,
}

/// The `routing:` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub modules: IndexMap<String, ModuleConfig>,
    #[serde(default)]
    pub profiles: IndexMap<String, ProfileConfig>,
    #[serde(default)]
    pub routing: RoutingConfig,
}

// ─── Descriptors ────────────────────────────────────────────────────────────

/// Validated execution details of a module.
#[derive(Debug, Clone, PartialEq)]
pub enum ModuleKind {
    Process {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
        cwd: Option<String>,
    },
    InProcess {
        package: String,
    },
}

/// Immutable description of one module, built from configuration.
#[derive(Debug, Clone)]
pub struct ModuleDescriptor {
    pub name: String,
    pub kind: ModuleKind,
    pub enabled: bool,
    pub lazy: bool,
    pub timeout: Option<Duration>,
    /// The module's configuration entry as written.
    pub raw_config: serde_json::Value,
}

impl ModuleDescriptor {
    /// Validate a configuration entry and build its descriptor.
    pub fn from_config(name: &str, config: &ModuleConfig) -> Result<Self, BridgeError> {
        let kind = match config.kind {
            ModuleKindConfig::Process => {
                let command = config
                    .command
                    .as_deref()
                    .filter(|c| !c.trim().is_empty())
                    .ok_or_else(|| BridgeError::Config {
                        reason: format!("process module '{name}' has no command"),
                    })?;
                ModuleKind::Process {
                    command: command.to_string(),
                    args: config.args.clone(),
                    env: config.env.clone(),
                    cwd: config.cwd.clone(),
                }
            }
            ModuleKindConfig::InProcess => {
                let package = config
                    .package
                    .as_deref()
                    .filter(|p| !p.trim().is_empty())
                    .ok_or_else(|| BridgeError::Config {
                        reason: format!("in-process module '{name}' has no package"),
                    })?;
                ModuleKind::InProcess {
                    package: package.to_string(),
                }
            }
        };

        let raw_config = serde_json::to_value(config).map_err(|e| BridgeError::Config {
            reason: format!("module '{name}': {e}"),
        })?;

        Ok(Self {
            name: name.to_string(),
            kind,
            enabled: config.enabled,
            lazy: config.lazy,
            timeout: config.timeout_ms.map(Duration::from_millis),
            raw_config,
        })
    }

    /// Whether this module runs as a subprocess.
    pub fn is_process(&self) -> bool {
        matches!(self.kind, ModuleKind::Process { .. })
    }
}

impl BridgeConfig {
    /// Parse a YAML (or JSON) document after env-var interpolation.
    pub fn from_yaml_str(raw: &str) -> Result<Self, BridgeError> {
        let interpolated = interpolate_env_vars(raw);
        serde_yaml::from_str(&interpolated).map_err(|e| BridgeError::Config {
            reason: format!("failed to parse config: {e}"),
        })
    }

    /// Build a descriptor for every module, validating each entry.
    pub fn descriptors(&self) -> Result<IndexMap<String, Arc<ModuleDescriptor>>, BridgeError> {
        self.modules
            .iter()
            .map(|(name, cfg)| {
                ModuleDescriptor::from_config(name, cfg).map(|d| (name.clone(), Arc::new(d)))
            })
            .collect()
    }

    /// Check the whole document: every module entry is well-formed, every
    /// rule pattern compiles, and profile members and rule targets name
    /// configured modules.
    pub fn validate(&self) -> Result<(), BridgeError> {
        self.descriptors()?;

        for (profile, cfg) in &self.profiles {
            for module in &cfg.enabled_modules {
                if !self.modules.contains_key(module) {
                    return Err(BridgeError::Config {
                        reason: format!("profile '{profile}' references unknown module '{module}'"),
                    });
                }
            }
        }

        for (idx, rule) in self.routing.rules.iter().enumerate() {
            RoutingRule::compile(&rule.pattern, &rule.target)?;
            if !self.modules.contains_key(&rule.target) {
                return Err(BridgeError::Config {
                    reason: format!(
                        "routing rule #{idx} ('{}') targets unknown module '{}'",
                        rule.pattern, rule.target
                    ),
                });
            }
        }

        Ok(())
    }

    /// Module names listed by a profile, in configured order.
    pub fn profile_modules(&self, profile: &str) -> Result<&[String], BridgeError> {
        self.profiles
            .get(profile)
            .map(|p| p.enabled_modules.as_slice())
            .ok_or_else(|| BridgeError::Config {
                reason: format!("unknown profile '{profile}'"),
            })
    }
}

// ─── Loading ────────────────────────────────────────────────────────────────

/// Load, parse and validate a configuration file.
pub fn load_config(path: &Path) -> Result<BridgeConfig, BridgeError> {
    let raw = std::fs::read_to_string(path).map_err(|e| BridgeError::Config {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;
    let config = BridgeConfig::from_yaml_str(&raw)?;
    config.validate()?;
    Ok(config)
}

/// Load a configuration file, falling back to an empty configuration.
///
/// A missing or broken config never prevents startup; it only means no
/// modules are available.
pub fn load_config_or_default(path: &Path) -> BridgeConfig {
    match load_config(path) {
        Ok(config) => {
            tracing::info!(
                path = %path.display(),
                modules = config.modules.len(),
                profiles = config.profiles.len(),
                rules = config.routing.rules.len(),
                "loaded bridge config"
            );
            config
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "falling back to empty bridge config"
            );
            BridgeConfig::default()
        }
    }
}

// ─── Settings ───────────────────────────────────────────────────────────────

/// Manager tunables that are not part of the configuration document.
#[derive(Debug, Clone, Copy)]
pub struct BridgeSettings {
    /// Default deadline for each request to a process module.
    pub request_timeout: Duration,
    /// Upper bound for the whole initialize + tools/list handshake.
    pub discovery_timeout: Duration,
    /// How long `stop` waits for a graceful exit before force-killing.
    pub shutdown_grace: Duration,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            discovery_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

// ─── Env-var interpolation ──────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    if let Some((var_name, default)) = expr.split_once(":-") {
        std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
    } else {
        std::env::var(expr).unwrap_or_default()
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
