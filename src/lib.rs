pub mod bridge;

use std::path::{Path, PathBuf};

pub use bridge::{
    BridgeConfig, BridgeError, BridgeSettings, InProcessModule, ModuleManager, ModuleStatus,
    PackageCatalog, ProfileActivation, ToolDefinition,
};

/// Name of the active log file inside the log directory.
const LOG_FILE_NAME: &str = "bridge.log";

/// Rotated log files kept next to the active one.
const LOG_ROTATIONS: u32 = 3;

/// Return the platform-standard data directory for modbridge.
///
/// - macOS: `~/Library/Application Support/modbridge/`
/// - Windows: `{FOLDERID_RoamingAppData}\modbridge\`
/// - Linux: `$XDG_DATA_HOME/modbridge/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.modbridge/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("modbridge");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".modbridge")
}

/// Initialize the tracing subscriber. Writes structured logs to `log_dir`
/// (default: [`data_dir`]).
///
/// On each call:
/// 1. Rotates existing logs (bridge.log → bridge.log.1 → .2 → .3, keeps last 3).
/// 2. Opens a fresh bridge.log with a line-flushing writer for crash resilience.
/// 3. Logs a startup banner with the log path for discoverability.
///
/// Returns the path of the active log file. A subscriber installed earlier
/// by the host is left in place.
pub fn init_tracing(log_dir: Option<&Path>) -> std::io::Result<PathBuf> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_dir = log_dir.map(Path::to_path_buf).unwrap_or_else(data_dir);
    std::fs::create_dir_all(&log_dir)?;

    let log_path = log_dir.join(LOG_FILE_NAME);
    rotate_log_file(&log_path, LOG_ROTATIONS);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("modbridge=info,warn"));

    let installed = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(FlushingWriter::new(log_file))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .try_init()
        .is_ok();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %log_path.display(),
        pid = std::process::id(),
        installed,
        "=== modbridge starting ==="
    );

    Ok(log_path)
}

/// Rotate log files: `bridge.log` → `bridge.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let rotated = |i: u32| PathBuf::from(format!("{}.{i}", base_path.display()));

    let _ = std::fs::remove_file(rotated(keep));

    for i in (1..keep).rev() {
        let _ = std::fs::rename(rotated(i), rotated(i + 1));
    }

    if base_path.exists() {
        let _ = std::fs::rename(base_path, rotated(1));
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write.
///
/// Each log line reaches the file immediately, so a module that takes the
/// host down still leaves its last lines on disk.
#[derive(Clone)]
struct FlushingWriter {
    file: std::sync::Arc<parking_lot::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(parking_lot::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self.file.lock();
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::Write::flush(&mut *self.file.lock())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_rotate_log_file_shifts_and_drops_oldest() {
        let dir = tempfile::TempDir::new().unwrap();
        let base = dir.path().join("bridge.log");
        for (path, body) in [
            (base.clone(), "current"),
            (dir.path().join("bridge.log.1"), "one"),
            (dir.path().join("bridge.log.2"), "two"),
            (dir.path().join("bridge.log.3"), "three"),
        ] {
            std::fs::write(path, body).unwrap();
        }

        rotate_log_file(&base, 3);

        assert!(!base.exists());
        let read = |n: u32| std::fs::read_to_string(dir.path().join(format!("bridge.log.{n}")));
        assert_eq!(read(1).unwrap(), "current");
        assert_eq!(read(2).unwrap(), "one");
        assert_eq!(read(3).unwrap(), "two");
        assert!(read(4).is_err());
    }

    #[test]
    fn test_rotate_log_file_with_gaps() {
        let dir = tempfile::TempDir::new().unwrap();
        let base = dir.path().join("bridge.log");
        std::fs::write(&base, "current").unwrap();

        rotate_log_file(&base, 3);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("bridge.log.1")).unwrap(),
            "current"
        );
    }

    #[test]
    fn test_flushing_writer_writes_through() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("out.log");
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = FlushingWriter::new(file);
        writer.write_all(b"line one\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "line one\n");
    }

    #[test]
    fn test_init_tracing_creates_log_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let log_dir = dir.path().join("logs");
        let path = init_tracing(Some(&log_dir)).unwrap();
        assert_eq!(path, log_dir.join("bridge.log"));
        assert!(path.exists());
    }

    #[test]
    fn test_data_dir_is_named_for_crate() {
        let dir = data_dir();
        let name = dir.file_name().and_then(|n| n.to_str()).unwrap();
        assert!(name == "modbridge" || name == ".modbridge");
    }
}
