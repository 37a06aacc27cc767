//! ToolRouter: resolves a tool name to the module that should execute it.
//!
//! Resolution order:
//! 1. Routing rules, in configured order; the first matching pattern wins.
//! 2. An exact qualified name (`fs.readFile`) in the catalog.
//! 3. The first catalog entry, in insertion order, ending with `.{tool}`.
//!
//! If nothing matches the call fails with `NotFound` and no module is
//! contacted. Dispatch only ever reaches modules whose status is `Ready`.

use std::time::Instant;

use regex::Regex;
use serde::Serialize;

use super::catalog::ToolCatalog;
use super::config::RoutingConfig;
use super::errors::BridgeError;
use super::registry::ModuleRegistry;

/// Number of "did you mean" suggestions attached to `NotFound`.
const MAX_SUGGESTIONS: usize = 3;

// ─── Rules ──────────────────────────────────────────────────────────────────

/// A compiled pattern → module mapping.
#[derive(Debug, Clone)]
pub struct RoutingRule {
    pattern: Regex,
    target: String,
}

impl RoutingRule {
    /// Compile a rule. Invalid patterns are configuration errors.
    pub fn compile(pattern: &str, target: &str) -> Result<Self, BridgeError> {
        let pattern = Regex::new(pattern).map_err(|e| BridgeError::Config {
            reason: format!("invalid routing pattern '{pattern}' for target '{target}': {e}"),
        })?;
        Ok(Self {
            pattern,
            target: target.to_string(),
        })
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn matches(&self, tool: &str) -> bool {
        self.pattern.is_match(tool)
    }
}

// ─── Resolution ─────────────────────────────────────────────────────────────

/// How a tool name was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "by", content = "rule")]
pub enum MatchKind {
    /// Matched the routing rule at this index.
    Rule(usize),
    /// The name was an exact qualified catalog key.
    Qualified,
    /// Bare-name suffix match in the catalog.
    BareName,
}

/// Target module plus the tool name that module knows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub module: String,
    /// Bare tool name sent in `tools/call`.
    pub tool: String,
    pub matched: MatchKind,
}

// ─── ToolRouter ─────────────────────────────────────────────────────────────

/// Ordered routing rules with catalog fallback.
#[derive(Debug, Clone, Default)]
pub struct ToolRouter {
    rules: Vec<RoutingRule>,
}

impl ToolRouter {
    pub fn new(rules: Vec<RoutingRule>) -> Self {
        Self { rules }
    }

    /// Compile every configured rule, in order.
    pub fn from_config(config: &RoutingConfig) -> Result<Self, BridgeError> {
        let rules = config
            .rules
            .iter()
            .map(|r| RoutingRule::compile(&r.pattern, &r.target))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(rules))
    }

    pub fn rules(&self) -> &[RoutingRule] {
        &self.rules
    }

    /// Decide which module handles `tool`. Contacts no module.
    pub fn resolve(&self, tool: &str, catalog: &ToolCatalog) -> Result<Resolution, BridgeError> {
        if let Some((index, rule)) = self.rules.iter().enumerate().find(|(_, r)| r.matches(tool)) {
            tracing::debug!(tool, module = %rule.target, rule = index, "routed by rule");
            return Ok(Resolution {
                module: rule.target.clone(),
                tool: bare_tool_name(&rule.target, tool).to_string(),
                matched: MatchKind::Rule(index),
            });
        }

        if let Some(descriptor) = catalog.get(tool) {
            return Ok(Resolution {
                module: descriptor.module_name,
                tool: descriptor.tool_name,
                matched: MatchKind::Qualified,
            });
        }

        if let Some(descriptor) = catalog.find_by_bare_name(tool) {
            return Ok(Resolution {
                module: descriptor.module_name,
                tool: descriptor.tool_name,
                matched: MatchKind::BareName,
            });
        }

        Err(BridgeError::NotFound {
            tool: tool.to_string(),
            suggestions: catalog.suggestions(tool, MAX_SUGGESTIONS),
        })
    }

    /// Execute a resolved call on its module, which must be `Ready`.
    ///
    /// The module's result is returned unmodified.
    pub async fn dispatch(
        &self,
        resolution: &Resolution,
        params: serde_json::Value,
        registry: &ModuleRegistry,
    ) -> Result<serde_json::Value, BridgeError> {
        let handle = registry.ready_handle(&resolution.module)?;
        let start = Instant::now();

        let result = handle.invoke(&resolution.tool, params).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match &result {
            Ok(_) => tracing::debug!(
                module = %resolution.module,
                tool = %resolution.tool,
                elapsed_ms,
                "tool call completed"
            ),
            Err(e) => tracing::warn!(
                module = %resolution.module,
                tool = %resolution.tool,
                elapsed_ms,
                error = %e,
                "tool call failed"
            ),
        }
        result
    }

    /// Resolve and dispatch in one step.
    pub async fn route(
        &self,
        tool: &str,
        params: serde_json::Value,
        catalog: &ToolCatalog,
        registry: &ModuleRegistry,
    ) -> Result<serde_json::Value, BridgeError> {
        let resolution = self.resolve(tool, catalog)?;
        self.dispatch(&resolution, params, registry).await
    }
}

/// Strip a leading `{module}.` from a tool name.
fn bare_tool_name<'a>(module: &str, tool: &'a str) -> &'a str {
    tool.strip_prefix(module)
        .and_then(|rest| rest.strip_prefix('.'))
        .unwrap_or(tool)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
