//! Well-known file locations, with the environment overrides used by the
//! automated tests and local development resolved once at startup.

use std::env;
use std::path::{Path, PathBuf};

pub const CONFIG: &str = "client.conf";
pub const DEV_CONFIG: &str = "client-dev.conf";
pub const REMOTE_INFO: &str = "remote-info.conf";

const DEFAULT_CONFIG_DIR: &str = "/etc/steamos-atomupd";
const DEFAULT_MANIFEST: &str = "/etc/steamos-atomupd/manifest.json";
const DEFAULT_UPDATE_JSON: &str = "/run/atomupd-daemon/atomupd-updates.json";

// Please keep this in sync with steamos-select-branch
const DEFAULT_BRANCH_PATH: &str = "/var/lib/steamos-branch";

const FALLBACK_CONFIG_DIR: &str = "/usr/lib/steamos-atomupd";

const USER_PREFERENCES: &str = "/etc/steamos-atomupd/preferences.conf";

/* This file is not expected to be preserved when applying a system update.
 * It is not a problem if this happens to be preserved across updates, because
 * when atomupd-daemon starts up it always tries to replace the local
 * remote-info.conf file with the latest version from the server. */
const REMOTE_INFO_PATH: &str = "/etc/steamos-atomupd/remote-info.conf";

// Please keep this in sync with steamos-customizations common.mk
const REBOOT_FOR_UPDATE: &str = "/run/steamos-atomupd/reboot_for_update";

// Please keep this in sync with steamos-customizations rauc/system.conf
const DESYNC_CONFIG_PATH: &str = "/etc/desync/config.json";

const NETRC_PATH: &str = "/root/.netrc";

/// All the on-disk locations the daemon works with. The `AU_*` environment
/// variables override individual entries for debugging and automated tests.
#[derive(Debug, Clone)]
pub struct Paths {
    pub config_dir: PathBuf,
    pub fallback_config_dir: PathBuf,
    pub manifest: PathBuf,
    pub preferences: PathBuf,
    pub legacy_branch: PathBuf,
    pub remote_info: PathBuf,
    pub updates_json: PathBuf,
    pub reboot_marker: PathBuf,
    pub netrc: PathBuf,
    pub desync_config: PathBuf,
}

fn env_or(var: &str, default: &str) -> PathBuf {
    match env::var_os(var) {
        Some(value) if !value.is_empty() => PathBuf::from(value),
        _ => PathBuf::from(default),
    }
}

impl Paths {
    /// Resolves every location, applying the environment overrides. The
    /// configuration directory and the manifest path can additionally be
    /// overridden from the command line.
    pub fn new(config_dir: Option<&Path>, manifest: Option<&Path>) -> Self {
        Self {
            config_dir: config_dir
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_DIR)),
            fallback_config_dir: env_or("AU_FALLBACK_CONFIG_PATH", FALLBACK_CONFIG_DIR),
            manifest: manifest
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MANIFEST)),
            preferences: env_or("AU_USER_PREFERENCES_FILE", USER_PREFERENCES),
            legacy_branch: env_or("AU_CHOSEN_BRANCH_FILE", DEFAULT_BRANCH_PATH),
            remote_info: env_or("AU_REMOTE_INFO_PATH", REMOTE_INFO_PATH),
            updates_json: env_or("AU_UPDATES_JSON_FILE", DEFAULT_UPDATE_JSON),
            reboot_marker: env_or("AU_REBOOT_FOR_UPDATE", REBOOT_FOR_UPDATE),
            netrc: PathBuf::from(NETRC_PATH),
            desync_config: PathBuf::from(DESYNC_CONFIG_PATH),
        }
    }

    /// The canonical configuration file, ignoring the development override.
    pub fn canonical_config(&self) -> PathBuf {
        self.config_dir.join(CONFIG)
    }

    pub fn dev_config(&self) -> PathBuf {
        self.config_dir.join(DEV_CONFIG)
    }

    pub fn fallback_config(&self) -> PathBuf {
        self.fallback_config_dir.join(CONFIG)
    }
}

#[cfg(test)]
impl Paths {
    /// A `Paths` that keeps everything under one test directory.
    pub fn for_test(root: &Path) -> Self {
        Self {
            config_dir: root.join("etc"),
            fallback_config_dir: root.join("usr-lib"),
            manifest: root.join("etc/manifest.json"),
            preferences: root.join("etc/preferences.conf"),
            legacy_branch: root.join("var-lib/steamos-branch"),
            remote_info: root.join("etc/remote-info.conf"),
            updates_json: root.join("run/atomupd-updates.json"),
            reboot_marker: root.join("run/reboot_for_update"),
            netrc: root.join("root/.netrc"),
            desync_config: root.join("etc/desync/config.json"),
        }
    }
}
