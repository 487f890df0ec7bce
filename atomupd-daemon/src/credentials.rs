//! Keeps the system netrc and the desync configuration in sync with the HTTP
//! authentication carried by the effective configuration, so that the update
//! helpers can reach the image server. The updaters are pure functions over
//! file contents; both produce deterministic output and are idempotent.

use crate::error::{self, Error, Result};
use crate::util::{host_from_url, write_atomically};
use base64::Engine;
use log::{debug, warn};
use serde_json::{json, Value};
use snafu::{ensure, ResultExt};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

/// The retry base interval handed to desync, to let it wait a sane amount of
/// time before re-trying a failed HTTP request. Nanoseconds.
const ERROR_RETRY_BASE_INTERVAL: i64 = 1_000_000_000;

/// Returns the `Authorization` header value for an HTTP Basic user/password
/// pair.
pub fn encode_basic_auth(username: &str, password: &str) -> String {
    let user_pass = format!("{}:{}", username, password);
    format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode(user_pass)
    )
}

/// Ensures every host appears in the netrc text with the given login.
/// Unrelated entries are preserved verbatim; entries whose login changed are
/// rewritten in place; missing hosts are appended in sorted order. Returns
/// the new text and whether it differs from the input.
pub fn update_netrc(
    existing: &str,
    hosts: &BTreeSet<String>,
    username: &str,
    password: &str,
) -> (String, bool) {
    let login = format!("login {} password {}", username, password);

    let mut missing: BTreeSet<&str> = hosts.iter().map(String::as_str).collect();
    let mut updated = String::new();
    let mut changed = false;

    for line in existing.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let mut parts = line.splitn(3, ' ');
        let keyword = parts.next().unwrap_or("");
        let (host, entry_login) = match (parts.next(), parts.next()) {
            (Some(host), Some(entry_login)) if keyword == "machine" => (host, entry_login),
            _ => {
                // Dropped from the rewritten text, but not by itself a
                // reason to rewrite the file.
                warn!("netrc is possibly malformed, unexpected line: {}", line);
                continue;
            }
        };

        if missing.remove(host) && entry_login != login {
            debug!("The login information for {} has been updated", host);
            changed = true;
            updated.push_str(&format!("machine {} {}\n", host, login));
            continue;
        }

        // This entry was either not edited or only present in the netrc,
        // keeping it as-is.
        updated.push_str(line);
        updated.push('\n');
    }

    // The remaining hosts are new; they come out sorted so the output is
    // deterministic.
    for host in missing {
        changed = true;
        updated.push_str(&format!("machine {} {}\n", host, login));
    }

    (updated, changed)
}

/// Returns the `(login, password)` a netrc carries for `host`, if any.
pub fn lookup_netrc(existing: &str, host: &str) -> Option<(String, String)> {
    for line in existing.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if let ["machine", machine, "login", login, "password", password] = parts.as_slice() {
            if *machine == host {
                return Some((login.to_string(), password.to_string()));
            }
        }
    }
    None
}

/// Makes sure the hosts of all the configured URLs are reachable with the
/// configured login. Creates the netrc with mode 0600 when absent; rewrites
/// it, atomically, only when something actually changed.
pub fn ensure_urls_in_netrc<'a, I>(
    netrc_path: &Path,
    urls: I,
    username: &str,
    password: &str,
) -> Result<()>
where
    I: IntoIterator<Item = &'a str>,
{
    let hosts: BTreeSet<String> = urls.into_iter().map(host_from_url).collect();

    let existing = match fs::read_to_string(netrc_path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("There isn't a netrc file");
            String::new()
        }
        Err(source) => {
            return Err(Error::ReadFile {
                path: netrc_path.to_path_buf(),
                source,
            })
        }
    };

    let (updated, changed) = update_netrc(&existing, &hosts, username, password);
    if changed {
        debug!("Updating the netrc file...");
        write_atomically(netrc_path, updated.as_bytes(), Some(0o600))?;
    }
    Ok(())
}

/// Ensures the image URL is known to desync with the given HTTP auth header.
/// Returns the new JSON text and whether it differs from the input.
///
/// The URL globs use three `*` because the first element is the image name,
/// usually "steamdeck", then the version and finally the "castr" directory.
/// The server isn't too strict on the paths used, so to cover any reasonable
/// additional sub directory the entries go up to five `*`.
pub fn update_desync(existing: &str, url: &str, auth_encoded: &str) -> Result<(String, bool)> {
    let mut root: Value = serde_json::from_str(existing).context(error::DesyncParseSnafu {
        path: Path::new("config.json"),
    })?;

    ensure!(
        root.is_object(),
        error::DesyncNotAnObjectSnafu {
            path: Path::new("config.json")
        }
    );

    let object = root.as_object_mut().ok_or(Error::DesyncNotAnObject {
        path: "config.json".into(),
    })?;
    let store_options = object
        .entry("store-options")
        .or_insert_with(|| json!({}));
    let store_options = match store_options.as_object_mut() {
        Some(map) => map,
        None => {
            return error::DesyncNotAnObjectSnafu {
                path: Path::new("config.json"),
            }
            .fail()
        }
    };

    let mut changed = false;
    let mut url_entry = format!(
        "{}{}{}",
        url,
        if url.ends_with('/') { "" } else { "/" },
        "*/*/"
    );

    for _ in 0..3 {
        url_entry.push_str("*/");

        match store_options.get_mut(&url_entry) {
            Some(Value::Object(url_object)) => {
                let old_auth = url_object.get("http-auth").and_then(Value::as_str);
                if old_auth != Some(auth_encoded) {
                    debug!("The auth token for {} has been updated", url_entry);
                    url_object.insert("http-auth".to_string(), json!(auth_encoded));
                    changed = true;
                }
            }
            _ => {
                store_options.insert(
                    url_entry.clone(),
                    json!({
                        "http-auth": auth_encoded,
                        "error-retry-base-interval": ERROR_RETRY_BASE_INTERVAL,
                    }),
                );
                changed = true;
            }
        }
    }

    let output = serde_json::to_string_pretty(&root).context(error::DesyncParseSnafu {
        path: Path::new("config.json"),
    })?;
    Ok((output, changed))
}

/// Like [`update_desync`], but against the on-disk configuration, creating
/// the JSON skeleton when the file is absent. Only rewrites on change.
pub fn ensure_url_in_desync(desync_path: &Path, url: &str, auth_encoded: &str) -> Result<()> {
    let existing = match fs::read_to_string(desync_path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => "{ }".to_string(),
        Err(source) => {
            return Err(Error::ReadFile {
                path: desync_path.to_path_buf(),
                source,
            })
        }
    };

    let (updated, changed) = update_desync(&existing, url, auth_encoded)?;
    if changed {
        debug!("Updating the desync config file...");
        if let Some(parent) = desync_path.parent() {
            fs::create_dir_all(parent).context(error::CreateDirectorySnafu { path: parent })?;
        }
        write_atomically(desync_path, updated.as_bytes(), Some(0o600))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn basic_auth_encoding() {
        assert_eq!(
            encode_basic_auth("gordon", "breen"),
            "Basic Z29yZG9uOmJyZWVu"
        );
    }

    #[test]
    fn netrc_from_scratch_is_sorted() {
        let (text, changed) = update_netrc(
            "",
            &hosts(&["images.example.com", "atomupd.example.com"]),
            "deck",
            "hunter2",
        );
        assert!(changed);
        assert_eq!(
            text,
            "machine atomupd.example.com login deck password hunter2\n\
             machine images.example.com login deck password hunter2\n"
        );
    }

    #[test]
    fn netrc_is_idempotent() {
        let hosts = hosts(&["images.example.com", "meta.example.com"]);
        let (first, _) = update_netrc("", &hosts, "deck", "hunter2");
        let (second, changed) = update_netrc(&first, &hosts, "deck", "hunter2");
        assert!(!changed);
        assert_eq!(first, second);
    }

    #[test]
    fn netrc_updates_login_in_place() {
        let existing = "machine other.example.com login foo password bar\n\
                        machine images.example.com login deck password old\n";
        let (text, changed) = update_netrc(
            existing,
            &hosts(&["images.example.com"]),
            "deck",
            "new",
        );
        assert!(changed);
        assert_eq!(
            text,
            "machine other.example.com login foo password bar\n\
             machine images.example.com login deck password new\n"
        );
    }

    #[test]
    fn netrc_lookup() {
        let existing = "machine images.example.com login deck password hunter2\n";
        assert_eq!(
            lookup_netrc(existing, "images.example.com"),
            Some(("deck".to_string(), "hunter2".to_string()))
        );
        assert_eq!(lookup_netrc(existing, "meta.example.com"), None);
    }

    #[test]
    fn desync_skeleton() {
        let (text, changed) =
            update_desync("{ }", "https://images.example.com/steamos", "Basic Zm9v").unwrap();
        assert!(changed);
        let parsed: Value = serde_json::from_str(&text).unwrap();
        let store_options = parsed["store-options"].as_object().unwrap();
        for key in [
            "https://images.example.com/steamos/*/*/*/",
            "https://images.example.com/steamos/*/*/*/*/",
            "https://images.example.com/steamos/*/*/*/*/*/",
        ] {
            let entry = store_options.get(key).unwrap();
            assert_eq!(entry["http-auth"], "Basic Zm9v");
            assert_eq!(entry["error-retry-base-interval"], 1_000_000_000i64);
        }
    }

    #[test]
    fn desync_is_idempotent() {
        let (first, _) = update_desync("{ }", "https://images.example.com/", "Basic Zm9v").unwrap();
        let (second, changed) =
            update_desync(&first, "https://images.example.com/", "Basic Zm9v").unwrap();
        assert!(!changed);
        assert_eq!(first, second);
    }

    #[test]
    fn desync_refreshes_auth() {
        let (first, _) = update_desync("{ }", "https://images.example.com", "Basic b2xk").unwrap();
        let (second, changed) =
            update_desync(&first, "https://images.example.com", "Basic bmV3").unwrap();
        assert!(changed);
        let parsed: Value = serde_json::from_str(&second).unwrap();
        assert_eq!(
            parsed["store-options"]["https://images.example.com/*/*/*/"]["http-auth"],
            "Basic bmV3"
        );
        // Unrelated keys survive the refresh.
        assert!(parsed["store-options"]
            .as_object()
            .unwrap()
            .contains_key("https://images.example.com/*/*/*/*/*/"));
    }

    #[test]
    fn desync_preserves_foreign_entries() {
        let existing = r#"{ "store-options": { "https://other.example.com/*/": { "http-auth": "Basic eA==" } } }"#;
        let (text, changed) =
            update_desync(existing, "https://images.example.com", "Basic Zm9v").unwrap();
        assert!(changed);
        let parsed: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            parsed["store-options"]["https://other.example.com/*/"]["http-auth"],
            "Basic eA=="
        );
    }
}
