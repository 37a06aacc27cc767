//! Module registry: the single source of truth for "is this module usable".
//!
//! Maps module name → live handle and status. A module is routable only
//! while its entry holds a handle whose status is `Ready`.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;

use super::errors::BridgeError;
use super::lifecycle::ModuleHandle;

// ─── Status ─────────────────────────────────────────────────────────────────

/// Lifecycle status of a module.
///
/// `Loading → Ready → Failed` or `Ready → ShuttingDown → Stopped`.
/// `Unloaded` is reported for configured modules that have no entry yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleStatus {
    Unloaded,
    Loading,
    Ready,
    Failed,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unloaded => "unloaded",
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Shared, mutable status cell owned by a handle.
///
/// Exit observers write to it from background tasks.
#[derive(Debug)]
pub struct StatusCell(Mutex<ModuleStatus>);

impl StatusCell {
    pub fn new(status: ModuleStatus) -> Self {
        Self(Mutex::new(status))
    }

    pub fn get(&self) -> ModuleStatus {
        *self.0.lock()
    }

    pub fn set(&self, status: ModuleStatus) {
        *self.0.lock() = status;
    }

    /// Set `to` only if the current status is `from`.
    pub fn transition(&self, from: ModuleStatus, to: ModuleStatus) -> bool {
        let mut status = self.0.lock();
        if *status != from {
            return false;
        }
        *status = to;
        true
    }

    /// Move to `ShuttingDown` unless already stopped. Returns `false` if the
    /// module was already `Stopped`.
    pub fn begin_shutdown(&self) -> bool {
        let mut status = self.0.lock();
        if *status == ModuleStatus::Stopped {
            return false;
        }
        *status = ModuleStatus::ShuttingDown;
        true
    }

    /// Record that the execution unit exited.
    ///
    /// An exit during shutdown is a clean stop; any other exit is a failure.
    /// Returns the resulting status.
    pub fn on_exit(&self) -> ModuleStatus {
        let mut status = self.0.lock();
        *status = match *status {
            ModuleStatus::ShuttingDown | ModuleStatus::Stopped => ModuleStatus::Stopped,
            _ => ModuleStatus::Failed,
        };
        *status
    }
}

// ─── Registry ───────────────────────────────────────────────────────────────

struct RegistryEntry {
    handle: Option<Arc<ModuleHandle>>,
    /// Status reported while no handle is attached.
    detached: ModuleStatus,
}

impl RegistryEntry {
    fn status(&self) -> ModuleStatus {
        self.handle
            .as_ref()
            .map(|h| h.status())
            .unwrap_or(self.detached)
    }
}

/// Outcome of [`ModuleRegistry::reserve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// The module is already `Ready`; nothing to do.
    AlreadyReady,
    /// The caller now owns the load attempt and must finish it with
    /// [`ModuleRegistry::activate`] or [`ModuleRegistry::mark_failed`].
    Reserved,
}

/// Module name → handle + status.
pub struct ModuleRegistry {
    entries: Mutex<IndexMap<String, RegistryEntry>>,
    /// Bumped whenever a load attempt settles or the registry is cleared.
    changes: watch::Sender<u64>,
}

impl ModuleRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(IndexMap::new()),
            changes: watch::channel(0).0,
        }
    }

    fn notify_settled(&self) {
        self.changes.send_modify(|version| *version += 1);
    }

    /// Claim the right to load `name`.
    ///
    /// Atomic check-and-set, so two concurrent loads never both spawn.
    pub fn reserve(&self, name: &str) -> Result<Reservation, BridgeError> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(name) {
            match entry.status() {
                ModuleStatus::Ready => return Ok(Reservation::AlreadyReady),
                ModuleStatus::Loading => {
                    return Err(BridgeError::LoadInProgress {
                        module: name.to_string(),
                    })
                }
                ModuleStatus::ShuttingDown => {
                    return Err(BridgeError::ModuleUnavailable {
                        module: name.to_string(),
                        status: ModuleStatus::ShuttingDown,
                    })
                }
                ModuleStatus::Unloaded | ModuleStatus::Failed | ModuleStatus::Stopped => {}
            }
        }

        entries.insert(
            name.to_string(),
            RegistryEntry {
                handle: None,
                detached: ModuleStatus::Loading,
            },
        );
        Ok(Reservation::Reserved)
    }

    /// Attach a discovered, `Ready` handle to its reserved entry.
    pub fn activate(&self, handle: Arc<ModuleHandle>) {
        let name = handle.name().to_string();
        self.entries.lock().insert(
            name,
            RegistryEntry {
                handle: Some(handle),
                detached: ModuleStatus::Unloaded,
            },
        );
        self.notify_settled();
    }

    /// Record a failed load attempt. Any previous handle is detached.
    pub fn mark_failed(&self, name: &str) {
        self.entries.lock().insert(
            name.to_string(),
            RegistryEntry {
                handle: None,
                detached: ModuleStatus::Failed,
            },
        );
        self.notify_settled();
    }

    /// Current status of a module; `Unloaded` if it has no entry.
    pub fn status(&self, name: &str) -> ModuleStatus {
        self.entries
            .lock()
            .get(name)
            .map(RegistryEntry::status)
            .unwrap_or(ModuleStatus::Unloaded)
    }

    /// Wait until `name` is no longer `Loading` and return its status.
    pub async fn settled(&self, name: &str) -> ModuleStatus {
        let mut changes = self.changes.subscribe();
        loop {
            let status = self.status(name);
            if status != ModuleStatus::Loading || changes.changed().await.is_err() {
                return status;
            }
        }
    }

    /// The module's handle, only if it is `Ready`.
    pub fn ready_handle(&self, name: &str) -> Result<Arc<ModuleHandle>, BridgeError> {
        let entries = self.entries.lock();
        let entry = entries.get(name);
        let status = entry
            .map(RegistryEntry::status)
            .unwrap_or(ModuleStatus::Unloaded);

        match (status, entry.and_then(|e| e.handle.as_ref())) {
            (ModuleStatus::Ready, Some(handle)) => Ok(Arc::clone(handle)),
            _ => Err(BridgeError::ModuleUnavailable {
                module: name.to_string(),
                status,
            }),
        }
    }

    /// `(name, status)` for every entry, in registration order.
    pub fn snapshot(&self) -> Vec<(String, ModuleStatus)> {
        self.entries
            .lock()
            .iter()
            .map(|(name, e)| (name.clone(), e.status()))
            .collect()
    }

    /// Names of modules whose status is `Ready`.
    pub fn ready_modules(&self) -> Vec<String> {
        self.snapshot()
            .into_iter()
            .filter(|(_, s)| *s == ModuleStatus::Ready)
            .map(|(name, _)| name)
            .collect()
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
        self.notify_settled();
    }

    /// Number of entries (any status).
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the registry has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
