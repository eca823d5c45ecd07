//! Directory and file-name constants used by the orchestration engine.
//!
//! Centralizes every hardcoded path component (work-directory naming, the
//! per-sweep log file, the results export) so the filesystem contract lives
//! in one place.

use std::path::{Path, PathBuf};

/// File name of the structured per-sweep log inside a master's work directory.
pub const SWEEP_LOG_FILE_NAME: &str = "sweep.log";

/// File name of the aggregated results table written during finalization.
pub const RESULTS_FILE_NAME: &str = "results.csv";

/// Default workspace root when none is configured.
pub const DEFAULT_WORKSPACE_DIR: &str = "/tmp/sweeprun";

/// Configuration file name recognized by the CLI.
pub const CONFIG_FILE_NAME: &str = "sweeprun.toml";

/// Join dotted ancestor names into the work-directory name for one node.
///
/// A node at path `["top", "amp_0", "filter"]` works in
/// `<root>/top.amp_0.filter`.
pub fn dotted_path(segments: &[String]) -> String {
    segments.join(".")
}

/// Work directory for a node, named by its dotted ancestor path.
pub fn work_dir_path(workspace_root: &Path, path_segments: &[String]) -> PathBuf {
    workspace_root.join(dotted_path(path_segments))
}

/// Sweep log file path inside a master's work directory.
pub fn sweep_log_path(work_dir: &Path) -> PathBuf {
    work_dir.join(SWEEP_LOG_FILE_NAME)
}

/// Results CSV path inside a master's work directory.
pub fn results_path(work_dir: &Path) -> PathBuf {
    work_dir.join(RESULTS_FILE_NAME)
}
