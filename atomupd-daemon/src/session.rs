//! The state of the single update attempt this daemon supervises at any
//! given time, and the install-helper spawning that goes with it.

use crate::error::{self, Result};
use crate::ATOMUPD_CLIENT;
use log::debug;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use tempfile::{Builder, TempPath};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

/// The lifecycle of an update attempt, exposed on the bus as an integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateStatus {
    /// The update has not been launched yet
    Idle,
    /// The update is currently being applied
    InProgress,
    /// The update has been paused
    Paused,
    /// The update process successfully completed
    Successful,
    /// An error occurred during the update
    Failed,
    /// A special case of `Failed` where the update attempt has been
    /// cancelled
    Cancelled,
}

serde_plain::derive_display_from_serialize!(UpdateStatus);

impl UpdateStatus {
    pub fn as_u32(self) -> u32 {
        match self {
            UpdateStatus::Idle => 0,
            UpdateStatus::InProgress => 1,
            UpdateStatus::Paused => 2,
            UpdateStatus::Successful => 3,
            UpdateStatus::Failed => 4,
            UpdateStatus::Cancelled => 5,
        }
    }
}

/// Everything there is to know about the current update attempt. Owned by
/// the service object; the stdout watcher holds the session generation and
/// re-checks it on every callback, so that stale events after a cancel are
/// discarded.
#[derive(Debug)]
pub struct SessionState {
    pub status: UpdateStatus,
    pub build_id: Option<String>,
    pub version: Option<String>,
    pub progress: f64,
    /// Absolute UNIX seconds; 0 when unknown.
    pub estimated_completion_time: u64,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
    pub helper_pid: Option<i32>,
    /// Bumped whenever the running helper stops being ours to watch.
    pub generation: u64,
    pub watcher: Option<JoinHandle<()>>,
    /// The private copy of the cached updates JSON handed to the helper;
    /// deleted when replaced or dropped.
    pub snapshot: Option<TempPath>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            status: UpdateStatus::Idle,
            build_id: None,
            version: None,
            progress: 0.0,
            estimated_completion_time: 0,
            failure_code: None,
            failure_message: None,
            helper_pid: None,
            generation: 0,
            watcher: None,
            snapshot: None,
        }
    }
}

impl SessionState {
    pub fn set_failure(&mut self, code: Option<&str>, message: Option<&str>) {
        self.failure_code = code.map(str::to_string);
        self.failure_message = message.map(str::to_string);
    }
}

/// Copies the cached updates JSON to a fresh temporary file. The helper gets
/// the copy, so a concurrent `CheckForUpdates` replacing the canonical file
/// cannot race with the running install.
pub fn snapshot_updates_json(updates_json: &Path) -> Result<TempPath> {
    let contents = fs::read(updates_json).context(error::ReadFileSnafu {
        path: updates_json,
    })?;

    let mut snapshot = Builder::new()
        .prefix("steamos-atomupd-")
        .suffix(".json")
        .tempfile()
        .context(error::CreateTempfileSnafu {
            path: std::env::temp_dir(),
        })?;
    snapshot
        .write_all(&contents)
        .context(error::WriteFileSnafu {
            path: snapshot.path().to_path_buf(),
        })?;

    Ok(snapshot.into_temp_path())
}

/// Spawns `steamos-atomupd-client` to apply `build_id`, with its stdout
/// piped for progress parsing.
pub fn spawn_install_helper(
    config_path: &Path,
    snapshot_path: &Path,
    build_id: &str,
    http_proxy: Option<&str>,
) -> Result<Child> {
    let mut command = Command::new(ATOMUPD_CLIENT);
    command
        .arg("--config")
        .arg(config_path)
        .arg("--update-file")
        .arg(snapshot_path)
        .arg("--update-version")
        .arg(build_id);

    if log::log_enabled!(log::Level::Debug) {
        command.arg("--debug");
    }

    if let Some(proxy) = http_proxy {
        command.env("https_proxy", proxy);
        command.env("http_proxy", proxy);
    }

    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());

    debug!("Launching '{}' to apply {}", ATOMUPD_CLIENT, build_id);
    command.spawn().context(error::HelperSpawnSnafu)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_bus_values() {
        assert_eq!(UpdateStatus::Idle.as_u32(), 0);
        assert_eq!(UpdateStatus::InProgress.as_u32(), 1);
        assert_eq!(UpdateStatus::Paused.as_u32(), 2);
        assert_eq!(UpdateStatus::Successful.as_u32(), 3);
        assert_eq!(UpdateStatus::Failed.as_u32(), 4);
        assert_eq!(UpdateStatus::Cancelled.as_u32(), 5);
    }

    #[test]
    fn status_display() {
        assert_eq!(UpdateStatus::InProgress.to_string(), "in-progress");
        assert_eq!(UpdateStatus::Idle.to_string(), "idle");
    }

    #[test]
    fn snapshot_is_a_faithful_copy() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("updates.json");
        fs::write(&source, "{\"minor\": {}}").unwrap();

        let snapshot = snapshot_updates_json(&source).unwrap();
        assert_ne!(snapshot.to_path_buf(), source);
        assert_eq!(fs::read_to_string(&snapshot).unwrap(), "{\"minor\": {}}");

        let path = snapshot.to_path_buf();
        drop(snapshot);
        assert!(!path.exists());
    }

    #[test]
    fn missing_updates_json_fails_the_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        assert!(snapshot_updates_json(&dir.path().join("absent.json")).is_err());
    }
}
