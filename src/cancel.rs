//! Cooperative stop checks consulted between units of work.
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// File name of the default stop marker inside the system temp directory.
pub const DEFAULT_STOP_MARKER: &str = "stage-catalog.stop";

pub trait CancellationMonitor {
    /// Return true when the current run should stop after the committed unit.
    fn should_stop(&self) -> bool;
}

/// Stop request signalled by the presence of a marker file.
///
/// The runner only observes the marker; operators create and remove it.
#[derive(Debug, Clone)]
pub struct StopMarker {
    path: PathBuf,
}

impl StopMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn default_path() -> PathBuf {
        std::env::temp_dir().join(DEFAULT_STOP_MARKER)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CancellationMonitor for StopMarker {
    fn should_stop(&self) -> bool {
        self.path.exists()
    }
}

/// In-process stop token.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl CancellationMonitor for StopFlag {
    fn should_stop(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Monitor that never requests a stop.
#[derive(Debug, Clone, Copy, Default)]
pub struct Never;

impl CancellationMonitor for Never {
    fn should_stop(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_presence_controls_stop() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let marker = StopMarker::new(dir.path().join("stop"));
        assert!(!marker.should_stop());
        std::fs::write(marker.path(), b"").expect("create marker");
        assert!(marker.should_stop());
        assert!(marker.path().exists(), "checking must not consume the marker");
        std::fs::remove_file(marker.path()).expect("remove marker");
        assert!(!marker.should_stop());
    }

    #[test]
    fn flag_clones_share_state() {
        let flag = StopFlag::new();
        let observer = flag.clone();
        assert!(!observer.should_stop());
        flag.request_stop();
        assert!(observer.should_stop());
        flag.clear();
        assert!(!observer.should_stop());
    }
}
