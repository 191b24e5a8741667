use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Pick the first interpreter candidate that can actually be started.
///
/// Each candidate is located with `which` (bare names on `PATH`, paths as-is)
/// and then run once with `--version`. A candidate qualifies when the probe
/// starts and exits on its own within the probe timeout; the exit code is only
/// logged, since some shells reject `--version`.
pub(crate) async fn resolve_interpreter(candidates: &[String]) -> Option<PathBuf> {
    for candidate in candidates {
        if candidate.trim().is_empty() {
            continue;
        }
        let path = match which::which(candidate) {
            Ok(path) => path,
            Err(e) => {
                tracing::debug!(candidate = %candidate, error = %e, "interpreter candidate not found");
                continue;
            }
        };
        if probe(&path).await {
            tracing::debug!(candidate = %candidate, path = %path.display(), "interpreter resolved");
            return Some(path);
        }
    }
    None
}

async fn probe(path: &Path) -> bool {
    let mut command = Command::new(path);
    command
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "interpreter failed to start");
            return false;
        }
    };
    match tokio::time::timeout(PROBE_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::debug!(path = %path.display(), exit_code = ?status.code(), "interpreter probe finished");
            true
        }
        Ok(Err(e)) => {
            tracing::debug!(path = %path.display(), error = %e, "interpreter probe failed");
            false
        }
        Err(_) => {
            tracing::debug!(path = %path.display(), "interpreter probe timed out");
            false
        }
    }
}
