//! The writable user preferences: which variant and branch this host tracks,
//! plus the optional HTTP proxy. The preferences file is rewritten in full on
//! every mutation; the deprecated single-line `steamos-branch` file is
//! migrated once and then deleted.

use crate::error::{self, Error, Result};
use crate::paths::Paths;
use crate::util::write_atomically;
use atomupd_release::ImageManifest;
use configparser::ini::Ini;
use log::{debug, warn};
use std::fs;
use std::path::Path;

const CHOICES_SECTION: &str = "Choices";
const PROXY_SECTION: &str = "Proxy";

struct VariantConversion {
    expanded: &'static str,
    contracted: &'static str,
}

/* This is the same contracted->expanded relation that steamos-update uses */
static VARIANT_CONVERSIONS: &[VariantConversion] = &[
    VariantConversion {
        expanded: "steamdeck",
        contracted: "rel",
    },
    VariantConversion {
        expanded: "steamdeck-rc",
        contracted: "rc",
    },
    VariantConversion {
        expanded: "steamdeck-beta",
        contracted: "beta",
    },
    VariantConversion {
        expanded: "steamdeck-bc",
        contracted: "bc",
    },
    VariantConversion {
        expanded: "steamdeck-main",
        contracted: "main",
    },
    VariantConversion {
        expanded: "steamdeck-staging",
        contracted: "staging",
    },
];

/// In Jupiter the chosen variant was historically stored in a contracted
/// form. Returns the expanded version usable with `steamos-atomupd-client`,
/// or the input unchanged when it doesn't need to be expanded.
fn expand_variant(variant: &str) -> &str {
    for conversion in VARIANT_CONVERSIONS {
        if variant == conversion.contracted {
            return conversion.expanded;
        }
    }

    debug!("The variant {} doesn't need to be expanded", variant);
    variant
}

/// Converts the legacy single-token variant into the `(variant, branch)`
/// pair used by the new preferences. Adapted from steamos-atomupd
/// `convert_from_legacy_variant()`.
fn convert_from_legacy_variant(legacy_variant: &str) -> Result<(String, String)> {
    let expanded = expand_variant(legacy_variant);

    if expanded == "steamdeck" {
        Ok(("steamdeck".to_string(), "stable".to_string()))
    } else if let Some(branch) = expanded.strip_prefix("steamdeck-") {
        Ok(("steamdeck".to_string(), branch.to_string()))
    } else {
        warn!("The legacy variant '{}' is unexpected", expanded);
        error::UnexpectedLegacyVariantSnafu { variant: expanded }.fail()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPreferences {
    pub variant: String,
    pub branch: String,
    /// `None` when no proxy is configured; an empty address never appears.
    pub http_proxy: Option<(String, i32)>,
}

impl UserPreferences {
    pub fn load(path: &Path) -> Result<Self> {
        let mut preferences = Ini::new_cs();
        preferences
            .load(path)
            .map_err(|reason| Error::PreferencesParse {
                path: path.to_path_buf(),
                reason,
            })?;

        let variant = preferences
            .get(CHOICES_SECTION, "Variant")
            .ok_or_else(|| Error::MissingPreference {
                key: "Variant".to_string(),
                path: path.to_path_buf(),
            })?;
        let branch = preferences
            .get(CHOICES_SECTION, "Branch")
            .ok_or_else(|| Error::MissingPreference {
                key: "Branch".to_string(),
                path: path.to_path_buf(),
            })?;

        let http_proxy = match preferences.get(PROXY_SECTION, "Address") {
            Some(address) if !address.is_empty() => {
                match preferences.getint(PROXY_SECTION, "Port") {
                    Ok(Some(port)) => Some((address, port as i32)),
                    Ok(None) | Err(_) => {
                        warn!(
                            "Failed to parse the configured Proxy Port from '{}', trying to continue...",
                            path.display()
                        );
                        None
                    }
                }
            }
            _ => {
                debug!("The user preferences config file doesn't have an HTTP proxy configured");
                None
            }
        };

        Ok(Self {
            variant,
            branch,
            http_proxy,
        })
    }

    /// Rewrites the preferences file. The whole file is replaced atomically;
    /// a partially written file is never observable.
    pub fn store(&self, path: &Path) -> Result<()> {
        let mut preferences = Ini::new_cs();
        preferences.set(
            CHOICES_SECTION,
            "Variant",
            Some(self.variant.clone()),
        );
        preferences.set(CHOICES_SECTION, "Branch", Some(self.branch.clone()));

        if let Some((address, port)) = &self.http_proxy {
            if !address.is_empty() {
                preferences.set(PROXY_SECTION, "Address", Some(address.clone()));
                preferences.set(PROXY_SECTION, "Port", Some(port.to_string()));
            }
        }

        write_atomically(path, preferences.writes().as_bytes(), None)
    }
}

/// Migrates the deprecated `steamos-branch` file into a new preferences
/// file. Returns the migrated preferences on success. The legacy file is
/// always deleted once it has been migrated or declared unusable, so the
/// migration cannot re-trigger on future starts.
fn migrate_legacy_preferences(paths: &Paths) -> Result<UserPreferences> {
    let legacy_path = &paths.legacy_branch;

    debug!(
        "Parsing the legacy steamos-branch file '{}'",
        legacy_path.display()
    );

    let contents = match fs::read_to_string(legacy_path) {
        Ok(contents) => contents,
        Err(source) => {
            warn!(
                "The legacy config file '{}' is probably malformed",
                legacy_path.display()
            );
            let _ = fs::remove_file(legacy_path);
            return Err(Error::ReadFile {
                path: legacy_path.clone(),
                source,
            });
        }
    };

    // steamos-select-branch may have added one trailing newline; more than
    // one line means the file is malformed.
    let legacy_variant = contents.strip_suffix('\n').unwrap_or(&contents);
    if legacy_variant.contains('\n') {
        warn!(
            "The legacy config file '{}' has multiple lines, seems to be malformed",
            legacy_path.display()
        );
        let _ = fs::remove_file(legacy_path);
        return error::LegacyBranchFileSnafu {
            path: legacy_path.clone(),
            reason: "the file has multiple lines",
        }
        .fail();
    }

    let (variant, branch) = match convert_from_legacy_variant(legacy_variant) {
        Ok(pair) => pair,
        Err(e) => {
            warn!(
                "Unparsable legacy branch file variant '{}', removing '{}'",
                legacy_variant,
                legacy_path.display()
            );
            let _ = fs::remove_file(legacy_path);
            return Err(e);
        }
    };

    let preferences = UserPreferences {
        variant,
        branch,
        http_proxy: None,
    };
    preferences.store(&paths.preferences)?;

    debug!(
        "The user preferences have been migrated to the new '{}' file",
        paths.preferences.display()
    );

    // After migrating the preferences we can remove the deprecated old
    // branch file.
    let _ = fs::remove_file(legacy_path);

    Ok(preferences)
}

/// Retrieves the variant and branch this host tracks: from the legacy branch
/// file if it is still around and no preferences file exists yet, then from
/// the preferences file, and as a last resort from the image manifest
/// defaults (creating the preferences file from them).
pub fn load_or_migrate(paths: &Paths, manifest: &ImageManifest) -> Result<UserPreferences> {
    if paths.legacy_branch.exists() && !paths.preferences.exists() {
        match migrate_legacy_preferences(paths) {
            Ok(preferences) => return Ok(preferences),
            Err(e) => debug!("{}", e),
        }
    }

    if paths.preferences.exists() {
        match UserPreferences::load(&paths.preferences) {
            Ok(preferences) => return Ok(preferences),
            Err(e) => {
                warn!(
                    "The user preferences config file '{}' is probably malformed: {}",
                    paths.preferences.display(),
                    e
                );
            }
        }
    }

    debug!(
        "Parsing the image manifest '{}' to grab the variant and branch",
        paths.manifest.display()
    );
    let preferences = UserPreferences {
        variant: manifest.variant.clone(),
        branch: manifest.default_branch().to_string(),
        http_proxy: None,
    };
    preferences.store(&paths.preferences)?;
    Ok(preferences)
}

/// Convenience used by the manifest-defaults fallback after an HTTP 4xx:
/// the same conversion, but fed from an already parsed manifest.
pub fn manifest_defaults(manifest: &ImageManifest) -> (String, String) {
    (
        manifest.variant.clone(),
        manifest.default_branch().to_string(),
    )
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
        fs::create_dir_all(paths.legacy_branch.parent().unwrap()).unwrap();
        (dir, paths)
    }

    #[test]
    fn store_load_roundtrip() {
        let (_dir, paths) = test_paths();
        let preferences = UserPreferences {
            variant: "steamdeck".to_string(),
            branch: "beta".to_string(),
            http_proxy: Some(("proxy.lan".to_string(), 3128)),
        };
        preferences.store(&paths.preferences).unwrap();
        assert_eq!(UserPreferences::load(&paths.preferences).unwrap(), preferences);
    }

    #[test]
    fn store_removes_old_proxy() {
        let (_dir, paths) = test_paths();
        let with_proxy = UserPreferences {
            variant: "steamdeck".to_string(),
            branch: "stable".to_string(),
            http_proxy: Some(("proxy.lan".to_string(), 8080)),
        };
        with_proxy.store(&paths.preferences).unwrap();

        let without_proxy = UserPreferences {
            http_proxy: None,
            ..with_proxy
        };
        without_proxy.store(&paths.preferences).unwrap();

        let loaded = UserPreferences::load(&paths.preferences).unwrap();
        assert_eq!(loaded.http_proxy, None);
        let raw = fs::read_to_string(&paths.preferences).unwrap();
        assert!(!raw.contains("Proxy"));
    }

    #[test]
    fn legacy_conversion() {
        assert_eq!(
            convert_from_legacy_variant("steamdeck").unwrap(),
            ("steamdeck".to_string(), "stable".to_string())
        );
        assert_eq!(
            convert_from_legacy_variant("rc").unwrap(),
            ("steamdeck".to_string(), "rc".to_string())
        );
        assert_eq!(
            convert_from_legacy_variant("rel").unwrap(),
            ("steamdeck".to_string(), "stable".to_string())
        );
        assert_eq!(
            convert_from_legacy_variant("steamdeck-main").unwrap(),
            ("steamdeck".to_string(), "main".to_string())
        );
        assert!(convert_from_legacy_variant("holo").is_err());
    }

    #[test]
    fn migrates_legacy_file_once() {
        let (_dir, paths) = test_paths();
        fs::write(&paths.legacy_branch, "beta\n").unwrap();

        let preferences = load_or_migrate(&paths, &manifest()).unwrap();
        assert_eq!(preferences.variant, "steamdeck");
        assert_eq!(preferences.branch, "beta");

        // The legacy file is gone and the new preferences are on disk.
        assert!(!paths.legacy_branch.exists());
        assert_eq!(UserPreferences::load(&paths.preferences).unwrap(), preferences);
    }

    #[test]
    fn legacy_file_ignored_when_preferences_exist() {
        let (_dir, paths) = test_paths();
        let existing = UserPreferences {
            variant: "steamdeck".to_string(),
            branch: "rc".to_string(),
            http_proxy: None,
        };
        existing.store(&paths.preferences).unwrap();
        fs::write(&paths.legacy_branch, "main").unwrap();

        let preferences = load_or_migrate(&paths, &manifest()).unwrap();
        assert_eq!(preferences, existing);
        // Not a migration, so the legacy file stays untouched.
        assert!(paths.legacy_branch.exists());
    }

    #[test]
    fn malformed_legacy_file_is_deleted() {
        let (_dir, paths) = test_paths();
        fs::write(&paths.legacy_branch, "beta\nstable\n").unwrap();

        let preferences = load_or_migrate(&paths, &manifest()).unwrap();
        assert!(!paths.legacy_branch.exists());
        // Fell back to the manifest defaults.
        assert_eq!(preferences.variant, "steamdeck");
        assert_eq!(preferences.branch, "stable");
    }

    #[test]
    fn manifest_defaults_create_preferences() {
        let (_dir, paths) = test_paths();
        let preferences = load_or_migrate(&paths, &manifest()).unwrap();
        assert_eq!(preferences.variant, "steamdeck");
        assert_eq!(preferences.branch, "stable");
        assert!(paths.preferences.exists());
    }
}
