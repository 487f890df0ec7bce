//! Layered configuration resolution. The effective configuration comes from
//! the first usable layer out of: the developer override `client-dev.conf`,
//! the canonical `client.conf` merged with the downloaded `remote-info.conf`,
//! and the read-only fallback `client.conf` shipped with the image.

use crate::credentials;
use crate::error::{self, Error, Result};
use crate::paths::Paths;
use atomupd_release::ImageManifest;
use configparser::ini::Ini;
use log::{debug, info, warn};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const SERVER_SECTION: &str = "Server";
const SERVER_MANDATORY_KEYS: &[&str] = &["ImagesUrl", "MetaUrl"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpAuth {
    pub username: String,
    pub password: String,
}

impl HttpAuth {
    /// The auth type followed by the base64 encoded `username:password`.
    pub fn encoded(&self) -> String {
        credentials::encode_basic_auth(&self.username, &self.password)
    }
}

/// The one configuration the rest of the daemon consumes, produced by
/// [`select_and_load`].
#[derive(Debug, Clone)]
pub struct EffectiveConfig {
    /// The configuration file the helpers are pointed at.
    pub config_path: PathBuf,
    pub images_url: String,
    pub meta_url: String,
    /// Every `*Url` key of the `[Server]` section.
    pub urls: BTreeMap<String, String>,
    pub known_variants: Vec<String>,
    pub known_branches: Vec<String>,
    pub auth: Option<HttpAuth>,
}

fn load_ini(path: &Path) -> Result<Ini> {
    let mut ini = Ini::new_cs();
    ini.load(path).map_err(|reason| Error::ConfigParse {
        path: path.to_path_buf(),
        reason,
    })?;
    Ok(ini)
}

/// Splits a `;`-separated config list, dropping values with characters
/// outside `[A-Za-z0-9_-]`. This helps us to skip improper or unexpected
/// user inputs.
fn sanitized_list(ini: &Ini, key: &str) -> Option<Vec<String>> {
    let raw = ini.get(SERVER_SECTION, key)?;
    let valid = Regex::new("^[a-zA-Z0-9_-]+$").expect("known to be valid at compile-time");

    let mut entries = Vec::new();
    for entry in raw.split(';') {
        if entry.is_empty() {
            continue;
        }
        if valid.is_match(entry) {
            entries.push(entry.to_string());
        } else {
            warn!(
                "The config value \"{}\" has characters that are not allowed, skipping...",
                entry
            );
        }
    }
    Some(entries)
}

fn urls_from_config(ini: &Ini) -> BTreeMap<String, String> {
    let mut urls = BTreeMap::new();
    if let Some(section) = ini.get_map_ref().get(SERVER_SECTION) {
        for (key, value) in section {
            if let (true, Some(value)) = (key.ends_with("Url"), value) {
                urls.insert(key.clone(), value.clone());
            }
        }
    }
    urls
}

fn auth_from_config(ini: &Ini) -> Option<HttpAuth> {
    let username = match ini.get(SERVER_SECTION, "Username") {
        Some(username) => username,
        None => {
            debug!("Assuming no authentication required for this config");
            return None;
        }
    };
    let password = ini.get(SERVER_SECTION, "Password")?;
    Some(HttpAuth { username, password })
}

/// Parses one configuration layer, optionally merged with the remote-info
/// file. Pure with respect to everything but the files it is given, so the
/// layering is testable without any network access.
pub fn parse_config(
    config_path: &Path,
    remote_info: Option<&Path>,
    manifest: &ImageManifest,
) -> Result<EffectiveConfig> {
    let client_config = load_ini(config_path)?;

    // Ensure that the configuration has all the mandatory fields.
    for key in SERVER_MANDATORY_KEYS {
        if client_config.get(SERVER_SECTION, key).is_none() {
            return error::MissingConfigEntrySnafu {
                path: config_path,
                key: *key,
            }
            .fail();
        }
    }

    let remote = remote_info.and_then(|path| match load_ini(path) {
        Ok(ini) => Some(ini),
        Err(e) => {
            // This can happen when the host is offline or the server has no
            // remote-info file at all; the local lists still apply.
            debug!("Failed to use the additional remote info: {}", e);
            debug!("Continuing anyway...");
            None
        }
    });

    debug!("Getting the list of known variants and branches");

    let mut known_variants = match remote.as_ref().and_then(|r| sanitized_list(r, "Variants")) {
        Some(variants) => {
            debug!("Using the list of known variants from the remote info file");
            variants
        }
        None => sanitized_list(&client_config, "Variants").ok_or_else(|| {
            Error::MissingConfigEntry {
                path: config_path.to_path_buf(),
                key: "Variants".to_string(),
            }
        })?,
    };

    let mut known_branches = match remote.as_ref().and_then(|r| sanitized_list(r, "Branches")) {
        Some(branches) => {
            debug!("Using the list of known branches from the remote info file");
            branches
        }
        None => sanitized_list(&client_config, "Branches").ok_or_else(|| {
            Error::MissingConfigEntry {
                path: config_path.to_path_buf(),
                key: "Branches".to_string(),
            }
        })?,
    };

    // As a safety net against misconfigurations, the known lists always
    // include at least the defaults of the installed image.
    if !known_variants.iter().any(|v| v == &manifest.variant) {
        known_variants.push(manifest.variant.clone());
    }
    let default_branch = manifest.default_branch();
    if !known_branches.iter().any(|b| b == default_branch) {
        known_branches.push(default_branch.to_string());
    }

    let urls = urls_from_config(&client_config);
    let images_url = urls
        .get("ImagesUrl")
        .cloned()
        .ok_or_else(|| Error::MissingConfigEntry {
            path: config_path.to_path_buf(),
            key: "ImagesUrl".to_string(),
        })?;
    let meta_url = urls
        .get("MetaUrl")
        .cloned()
        .ok_or_else(|| Error::MissingConfigEntry {
            path: config_path.to_path_buf(),
            key: "MetaUrl".to_string(),
        })?;

    Ok(EffectiveConfig {
        config_path: config_path.to_path_buf(),
        images_url,
        meta_url,
        urls,
        known_variants,
        known_branches,
        auth: auth_from_config(&client_config),
    })
}

/// Parses one layer and, when it carries an HTTP auth pair, materialises the
/// credentials into the netrc and desync files the helpers consume.
fn load_config_layer(
    config_path: &Path,
    remote_info: Option<&Path>,
    manifest: &ImageManifest,
    paths: &Paths,
) -> Result<EffectiveConfig> {
    let config = parse_config(config_path, remote_info, manifest)?;

    if let Some(auth) = &config.auth {
        credentials::ensure_urls_in_netrc(
            &paths.netrc,
            config.urls.values().map(String::as_str),
            &auth.username,
            &auth.password,
        )?;
        credentials::ensure_url_in_desync(
            &paths.desync_config,
            &config.images_url,
            &auth.encoded(),
        )?;
    }

    Ok(config)
}

/// Probes the configuration layers in order and returns the effective
/// configuration of the first one that loads.
pub fn select_and_load(paths: &Paths, manifest: &ImageManifest) -> Result<EffectiveConfig> {
    let dev_config_path = paths.dev_config();
    if dev_config_path.exists() {
        // The remote info file is not loaded for a development
        // configuration: it could carry custom variants or branches that the
        // server side would otherwise replace.
        match load_config_layer(&dev_config_path, None, manifest, paths) {
            Ok(config) => {
                debug!("Loaded the configuration file '{}'", dev_config_path.display());
                return Ok(config);
            }
            Err(e) => {
                warn!(
                    "Failed to load '{}': {}\nUsing '{}' as a fallback.",
                    dev_config_path.display(),
                    e,
                    paths.canonical_config().display()
                );
            }
        }
    }

    let canonical = paths.canonical_config();
    match load_config_layer(&canonical, Some(&paths.remote_info), manifest, paths) {
        Ok(config) => {
            debug!("Loaded the configuration file '{}'", canonical.display());
            return Ok(config);
        }
        Err(e) => {
            // One last attempt, to avoid breaking atomic updates when the
            // canonical path holds an invalid configuration file.
            warn!(
                "Failed to load '{}': {}\nUsing the hardcoded path '{}' as a last resort attempt.",
                canonical.display(),
                e,
                paths.fallback_config().display()
            );
        }
    }

    load_config_layer(
        &paths.fallback_config(),
        Some(&paths.remote_info),
        manifest,
        paths,
    )
}

/// The MetaUrl from the default `client.conf`, skipping the development
/// override even when present. If the canonical file is malformed the
/// fallback path is consulted as a last resort.
pub fn meta_url_from_default_config(paths: &Paths) -> Result<String> {
    let candidates = [paths.canonical_config(), paths.fallback_config()];

    let mut last_error = None;
    for config_path in &candidates {
        match load_ini(config_path) {
            Ok(ini) => match ini.get(SERVER_SECTION, "MetaUrl") {
                Some(meta_url) => return Ok(meta_url),
                None => {
                    info!(
                        "Failed to load the MetaUrl property from '{}'",
                        config_path.display()
                    );
                    last_error = Some(Error::MissingConfigEntry {
                        path: config_path.clone(),
                        key: "MetaUrl".to_string(),
                    });
                }
            },
            Err(e) => {
                info!(
                    "Failed to load the MetaUrl property from '{}': {}",
                    config_path.display(),
                    e
                );
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| Error::MissingConfigEntry {
        path: paths.canonical_config(),
        key: "MetaUrl".to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn manifest() -> ImageManifest {
        serde_json::from_str(
            r#"{ "variant": "steamdeck", "version": "3.4.6", "buildid": "20220227.3",
                 "default_update_branch": "stable" }"#,
        )
        .unwrap()
    }

    fn test_paths() -> (tempfile::TempDir, Paths) {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::for_test(dir.path());
        fs::create_dir_all(&paths.config_dir).unwrap();
        fs::create_dir_all(&paths.fallback_config_dir).unwrap();
        fs::create_dir_all(paths.netrc.parent().unwrap()).unwrap();
        (dir, paths)
    }

    const CLIENT_CONF: &str = "\
[Server]
ImagesUrl = https://images.example.com/steamos
MetaUrl = https://meta.example.com/atomupd
Variants = steamdeck;vanilla
Branches = stable;rc
";

    #[test]
    fn canonical_layer_with_remote_info() {
        let (_dir, paths) = test_paths();
        fs::write(paths.canonical_config(), CLIENT_CONF).unwrap();
        fs::write(
            &paths.remote_info,
            "[Server]\nVariants = steamdeck\nBranches = stable;rc;beta;main\n",
        )
        .unwrap();

        let config = select_and_load(&paths, &manifest()).unwrap();
        assert_eq!(config.config_path, paths.canonical_config());
        assert_eq!(config.images_url, "https://images.example.com/steamos");
        assert_eq!(config.known_variants, vec!["steamdeck"]);
        assert_eq!(config.known_branches, vec!["stable", "rc", "beta", "main"]);
        assert_eq!(config.auth, None);
    }

    #[test]
    fn dev_config_wins_and_skips_remote_info() {
        let (_dir, paths) = test_paths();
        fs::write(paths.canonical_config(), CLIENT_CONF).unwrap();
        fs::write(
            paths.dev_config(),
            "[Server]\nImagesUrl = http://localhost:8000/images\nMetaUrl = http://localhost:8000/meta\n\
             Variants = steamdeck;custom\nBranches = stable;doodad\n",
        )
        .unwrap();
        fs::write(
            &paths.remote_info,
            "[Server]\nVariants = steamdeck\nBranches = stable\n",
        )
        .unwrap();

        let config = select_and_load(&paths, &manifest()).unwrap();
        assert_eq!(config.config_path, paths.dev_config());
        // The remote-info lists were not merged in.
        assert_eq!(config.known_variants, vec!["steamdeck", "custom"]);
        assert_eq!(config.known_branches, vec!["stable", "doodad"]);
    }

    #[test]
    fn malformed_dev_config_falls_back() {
        let (_dir, paths) = test_paths();
        fs::write(paths.dev_config(), "[Server]\nMetaUrl = only-this\n").unwrap();
        fs::write(paths.canonical_config(), CLIENT_CONF).unwrap();

        let config = select_and_load(&paths, &manifest()).unwrap();
        assert_eq!(config.config_path, paths.canonical_config());
    }

    #[test]
    fn fallback_layer_as_last_resort() {
        let (_dir, paths) = test_paths();
        fs::write(paths.fallback_config(), CLIENT_CONF).unwrap();

        let config = select_and_load(&paths, &manifest()).unwrap();
        assert_eq!(config.config_path, paths.fallback_config());
    }

    #[test]
    fn mandatory_urls_are_enforced() {
        let (_dir, paths) = test_paths();
        fs::write(
            paths.canonical_config(),
            "[Server]\nImagesUrl = https://images.example.com\nVariants = steamdeck\nBranches = stable\n",
        )
        .unwrap();

        let err = select_and_load(&paths, &manifest()).unwrap_err();
        assert!(matches!(err, Error::MissingConfigEntry { key, .. } if key == "MetaUrl"));
    }

    #[test]
    fn lists_are_sanitized_and_manifest_defaults_appended() {
        let (_dir, paths) = test_paths();
        fs::write(
            paths.canonical_config(),
            "[Server]\nImagesUrl = https://images.example.com\nMetaUrl = https://meta.example.com\n\
             Variants = vanilla;bad value;in/valid\nBranches = rc\n",
        )
        .unwrap();

        let config = select_and_load(&paths, &manifest()).unwrap();
        // Bad entries dropped, manifest defaults appended.
        assert_eq!(config.known_variants, vec!["vanilla", "steamdeck"]);
        assert_eq!(config.known_branches, vec!["rc", "stable"]);
    }

    #[test]
    fn auth_triggers_credential_materialisation() {
        let (_dir, paths) = test_paths();
        fs::write(
            paths.canonical_config(),
            "[Server]\nImagesUrl = https://images.example.com/steamos\nMetaUrl = https://meta.example.com\n\
             Variants = steamdeck\nBranches = stable\nUsername = deck\nPassword = hunter2\n",
        )
        .unwrap();

        let config = select_and_load(&paths, &manifest()).unwrap();
        assert!(config.auth.is_some());

        let netrc = fs::read_to_string(&paths.netrc).unwrap();
        assert!(netrc.contains("machine images.example.com login deck password hunter2"));
        assert!(netrc.contains("machine meta.example.com login deck password hunter2"));

        let desync: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&paths.desync_config).unwrap()).unwrap();
        assert_eq!(
            desync["store-options"]["https://images.example.com/steamos/*/*/*/"]["http-auth"],
            "Basic ZGVjazpodW50ZXIy"
        );
    }

    #[test]
    fn meta_url_skips_dev_config() {
        let (_dir, paths) = test_paths();
        fs::write(
            paths.dev_config(),
            "[Server]\nImagesUrl = http://localhost/i\nMetaUrl = http://localhost/meta\n\
             Variants = steamdeck\nBranches = stable\n",
        )
        .unwrap();
        fs::write(paths.canonical_config(), CLIENT_CONF).unwrap();

        assert_eq!(
            meta_url_from_default_config(&paths).unwrap(),
            "https://meta.example.com/atomupd"
        );
    }
}
