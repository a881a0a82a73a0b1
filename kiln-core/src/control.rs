//! Fire-and-forget actions behind the folder and shutdown buttons.

use std::path::Path;

/// Reveals `dir` in the host file browser. Failures are logged only.
pub fn open_folder(dir: &Path) {
    let target = std::fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
    tracing::info!("opening {}", target.display());
    if let Err(e) = open::that(&target) {
        tracing::warn!("failed to open {}: {e}", target.display());
    }
}

/// Terminates the process immediately, without draining in-flight work.
pub fn shutdown() -> ! {
    tracing::info!("shutting down...");
    std::process::exit(0)
}
