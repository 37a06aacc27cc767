//! Tool catalog: aggregates tool definitions across all modules.
//!
//! Provides:
//! - Tool lookup by qualified name (`module.tool`)
//! - Bare-name lookup in insertion order (first registered wins)
//! - "Did you mean" suggestions for unresolved names

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;

use super::types::ToolDefinition;

// ─── ToolDescriptor ─────────────────────────────────────────────────────────

/// A discovered tool, keyed by its qualified name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescriptor {
    /// `"{module}.{tool}"`, e.g. `"fs.readFile"`.
    pub qualified_name: String,
    /// Name the module itself uses, sent in `tools/call`.
    pub tool_name: String,
    pub module_name: String,
    pub description: String,
    pub schema: serde_json::Value,
}

impl ToolDescriptor {
    /// Build the catalog entry for a tool reported by `module`.
    ///
    /// Names already carrying the `module.` prefix are not prefixed twice.
    pub fn from_definition(module: &str, def: ToolDefinition) -> Self {
        let prefix = format!("{module}.");
        let tool_name = def
            .name
            .strip_prefix(&prefix)
            .map(str::to_string)
            .unwrap_or(def.name);

        Self {
            qualified_name: format!("{module}.{tool_name}"),
            tool_name,
            module_name: module.to_string(),
            description: def.description,
            schema: def.input_schema,
        }
    }
}

// ─── ToolCatalog ────────────────────────────────────────────────────────────

/// Qualified tool name → descriptor, in insertion order.
///
/// Insertion order is the deterministic fallback order for bare-name lookup.
pub struct ToolCatalog {
    tools: Mutex<IndexMap<String, ToolDescriptor>>,
}

impl ToolCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self {
            tools: Mutex::new(IndexMap::new()),
        }
    }

    /// Register the tools a module reported during discovery.
    ///
    /// Duplicate qualified names keep the first definition. Returns the
    /// number of tools registered.
    pub fn register_module_tools(&self, module: &str, tools: Vec<ToolDefinition>) -> usize {
        let mut catalog = self.tools.lock();
        let mut registered = 0;

        for def in tools {
            let descriptor = ToolDescriptor::from_definition(module, def);
            if catalog.contains_key(&descriptor.qualified_name) {
                tracing::warn!(
                    module,
                    tool = %descriptor.qualified_name,
                    "duplicate tool name reported, keeping first definition"
                );
                continue;
            }
            catalog.insert(descriptor.qualified_name.clone(), descriptor);
            registered += 1;
        }

        registered
    }

    /// Remove all tools belonging to a module, preserving the order of the rest.
    pub fn unregister_module(&self, module: &str) {
        self.tools.lock().retain(|_, t| t.module_name != module);
    }

    /// Look up a tool by its qualified name.
    pub fn get(&self, qualified_name: &str) -> Option<ToolDescriptor> {
        self.tools.lock().get(qualified_name).cloned()
    }

    /// First tool, in insertion order, whose qualified name ends with `.{tool}`.
    ///
    /// When several modules expose the same bare name only the first
    /// registered one is ever returned. Callers that need a specific module
    /// must use a routing rule.
    pub fn find_by_bare_name(&self, tool: &str) -> Option<ToolDescriptor> {
        let suffix = format!(".{tool}");
        let catalog = self.tools.lock();
        let mut matches = catalog.values().filter(|t| t.qualified_name.ends_with(&suffix));

        let first = matches.next()?.clone();
        let shadowed: Vec<&str> = matches.map(|t| t.module_name.as_str()).collect();
        if !shadowed.is_empty() {
            tracing::debug!(
                tool,
                chosen = %first.module_name,
                shadowed = ?shadowed,
                "ambiguous bare tool name, using first registered module"
            );
        }
        Some(first)
    }

    /// Up to `max_results` qualified names most similar to `name`.
    ///
    /// Compares tool suffixes (the part after the module prefix) with
    /// normalized Levenshtein similarity; names scoring 0.3 or less are
    /// not suggested.
    pub fn suggestions(&self, name: &str, max_results: usize) -> Vec<String> {
        let query = name.rsplit('.').next().unwrap_or(name);

        let mut scored: Vec<(String, f64)> = self
            .tools
            .lock()
            .values()
            .map(|t| (t.qualified_name.clone(), similarity(query, &t.tool_name)))
            .filter(|(_, score)| *score > 0.3)
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(max_results);
        scored.into_iter().map(|(name, _)| name).collect()
    }

    /// All qualified names, in insertion order.
    pub fn names(&self) -> Vec<String> {
        self.tools.lock().keys().cloned().collect()
    }

    /// All descriptors, in insertion order.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools.lock().values().cloned().collect()
    }

    /// Count tools belonging to a specific module.
    pub fn tools_for_module(&self, module: &str) -> usize {
        self.tools
            .lock()
            .values()
            .filter(|t| t.module_name == module)
            .count()
    }

    /// Remove every tool.
    pub fn clear(&self) {
        self.tools.lock().clear();
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.lock().len()
    }

    /// Whether the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.lock().is_empty()
    }
}

impl Default for ToolCatalog {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Edit Distance ──────────────────────────────────────────────────────────

/// Compute the Levenshtein edit distance between two strings.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    // Single-row DP
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=b.len() {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// Normalized similarity in 0.0–1.0 (1.0 = identical), case-insensitive.
fn similarity(a: &str, b: &str) -> f64 {
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein(&a, &b) as f64 / max_len as f64
}

// ─── Tests ───────────────────────────────────────────────────────────────────
