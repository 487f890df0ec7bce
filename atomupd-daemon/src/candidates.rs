//! Invocation of the query helper and parsing of its JSON reply into the
//! available / available-later listing.
//!
//! Despite its name, the `candidates` member of the reply does not list
//! multiple updates that can be applied immediately. It is a chain: a single
//! update that can be applied now, followed by zero or more updates that can
//! only be applied after passing through the earlier checkpoints.

use crate::config::EffectiveConfig;
use crate::error::{self, Error, Result};
use crate::ATOMUPD_CLIENT;
use log::debug;
use serde::Deserialize;
use snafu::{ensure, ResultExt};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// How long a query may take before it is abandoned. Generous, to tolerate
/// slow networks.
const QUERY_TIMEOUT: Duration = Duration::from_secs(90);

/// The helper exit status that signals an HTTP response in the 4xx range.
const EXIT_HTTP_4XX: i32 = 2;

#[derive(Debug, Deserialize)]
struct QueryReply {
    minor: Option<MinorUpdates>,
}

#[derive(Debug, Deserialize)]
struct MinorUpdates {
    candidates: Vec<Candidate>,
    replacement_eol_variant: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    image: CandidateImage,
}

#[derive(Debug, Deserialize)]
struct CandidateImage {
    buildid: String,
    version: String,
    variant: String,
    #[serde(default)]
    estimated_size: u64,
}

/// One entry of the update listing published on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateInfo {
    pub version: String,
    pub variant: String,
    pub estimated_size: u64,
    /// The build ID that must be applied before this one, for the
    /// checkpointed entries.
    pub requires: Option<String>,
}

pub type CandidateMap = BTreeMap<String, CandidateInfo>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateListing {
    pub available: CandidateMap,
    pub available_later: CandidateMap,
    /// Set when the server declared the requested variant end-of-life and
    /// proposes this replacement.
    pub replacement_eol_variant: Option<String>,
}

/// Parses the helper stdout. An empty output or an empty JSON object means
/// no updates are available. `updated_build_id` is the update that has
/// already been applied and is waiting for a reboot, if any: a first
/// candidate matching it has already been installed and is suppressed, so
/// the same update is never applied twice.
pub fn parse_candidates(
    output: &str,
    updated_build_id: Option<&str>,
) -> Result<CandidateListing> {
    // A terminating NUL followed by other data would silently truncate the
    // JSON, reject it outright.
    ensure!(!output.contains('\0'), error::HelperOutputNulSnafu);

    let trimmed = output.trim();
    if trimmed.is_empty() {
        // In theory when no updates are available the helper prints an empty
        // JSON object instead, but assume no updates here too.
        return Ok(CandidateListing::default());
    }

    let reply: QueryReply = serde_json::from_str(trimmed).context(error::QueryParseSnafu)?;
    let minor = match reply.minor {
        Some(minor) => minor,
        None => return Ok(CandidateListing::default()),
    };

    let mut listing = CandidateListing {
        replacement_eol_variant: minor.replacement_eol_variant,
        ..Default::default()
    };

    let mut requires: Option<String> = None;
    for (index, candidate) in minor.candidates.into_iter().enumerate() {
        let image = candidate.image;

        if index == 0 && Some(image.buildid.as_str()) == updated_build_id {
            // The first proposed update has already been applied and only
            // needs a reboot; the rest of the chain still requires it.
            debug!(
                "The proposed update to version '{}' has already been applied. Reboot to start using it.",
                image.buildid
            );
            requires = Some(image.buildid);
            continue;
        }

        let info = CandidateInfo {
            version: image.version,
            variant: image.variant,
            estimated_size: image.estimated_size,
            requires: requires.take(),
        };

        if index == 0 {
            listing.available.insert(image.buildid.clone(), info);
        } else {
            listing.available_later.insert(image.buildid.clone(), info);
        }

        requires = Some(image.buildid);
    }

    Ok(listing)
}

/// What the query helper needs to know.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub variant: String,
    pub branch: String,
    pub penultimate: bool,
    pub http_proxy: Option<String>,
}

/// Spawns `steamos-atomupd-client` in query mode and returns its stdout.
/// Exit status 2 is reported as [`Error::QueryHttp4xx`] so the caller can
/// fall back to the manifest defaults.
pub async fn run_query_helper(
    config: &EffectiveConfig,
    manifest_path: &Path,
    request: &QueryRequest,
) -> Result<String> {
    let mut command = Command::new(ATOMUPD_CLIENT);
    command
        .arg("--config")
        .arg(&config.config_path)
        .arg("--manifest-file")
        .arg(manifest_path)
        .arg("--variant")
        .arg(&request.variant)
        .arg("--branch")
        .arg(&request.branch)
        .arg("--query-only")
        .arg("--estimate-download-size");

    if request.penultimate {
        command.arg("--penultimate-update");
    }
    if log::log_enabled!(log::Level::Debug) {
        command.arg("--debug");
    }

    if let Some(proxy) = &request.http_proxy {
        command.env("https_proxy", proxy);
        command.env("http_proxy", proxy);
    }

    command.stdin(Stdio::null());
    command.kill_on_drop(true);

    debug!("Querying the available updates with '{}'", ATOMUPD_CLIENT);
    let output = tokio::time::timeout(QUERY_TIMEOUT, command.output())
        .await
        .map_err(|_| Error::HelperTimeout {
            seconds: QUERY_TIMEOUT.as_secs(),
        })?
        .context(error::HelperSpawnSnafu)?;

    if !output.status.success() {
        if output.status.code() == Some(EXIT_HTTP_4XX) {
            return error::QueryHttp4xxSnafu.fail();
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let message = if stderr.trim().is_empty() {
            output.status.to_string()
        } else {
            format!("{}: {}", output.status, stderr.trim())
        };
        return error::HelperFailedSnafu { message }.fail();
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fixture(name: &str) -> String {
        fs::read_to_string(Path::new("tests/data").join(name)).unwrap()
    }

    #[test]
    fn single_applicable_update() {
        let listing = parse_candidates(&fixture("update_single.json"), None).unwrap();

        assert_eq!(listing.available.len(), 1);
        let info = &listing.available["20220227.3"];
        assert_eq!(info.version, "snapshot");
        assert_eq!(info.variant, "steamdeck");
        assert_eq!(info.estimated_size, 70910463);
        assert_eq!(info.requires, None);
        assert!(listing.available_later.is_empty());
        assert_eq!(listing.replacement_eol_variant, None);
    }

    #[test]
    fn chained_candidates() {
        let listing = parse_candidates(&fixture("update_checkpoints.json"), None).unwrap();

        assert_eq!(listing.available.len(), 1);
        assert_eq!(listing.available["20211225.1"].requires, None);

        assert_eq!(listing.available_later.len(), 2);
        assert_eq!(
            listing.available_later["20220101.1"].requires.as_deref(),
            Some("20211225.1")
        );
        assert_eq!(
            listing.available_later["20220227.3"].requires.as_deref(),
            Some("20220101.1")
        );
    }

    #[test]
    fn eol_variant_replacement() {
        let listing = parse_candidates(&fixture("update_eol_variant.json"), None).unwrap();

        assert_eq!(
            listing.replacement_eol_variant.as_deref(),
            Some("steamdeck-replacement")
        );
        assert_eq!(
            listing.available["20240508.1"].variant,
            "steamdeck-replacement"
        );
    }

    #[test]
    fn pending_reboot_suppression() {
        let listing =
            parse_candidates(&fixture("update_single.json"), Some("20220227.3")).unwrap();
        assert!(listing.available.is_empty());
        assert!(listing.available_later.is_empty());
    }

    #[test]
    fn pending_reboot_keeps_the_rest_of_the_chain() {
        let listing =
            parse_candidates(&fixture("update_checkpoints.json"), Some("20211225.1")).unwrap();

        assert!(listing.available.is_empty());
        assert_eq!(listing.available_later.len(), 2);
        // The chain is unchanged: the first checkpoint still requires the
        // suppressed (already applied) update.
        assert_eq!(
            listing.available_later["20220101.1"].requires.as_deref(),
            Some("20211225.1")
        );
    }

    #[test]
    fn pending_reboot_of_a_different_build_changes_nothing() {
        let listing =
            parse_candidates(&fixture("update_single.json"), Some("20220222.1")).unwrap();
        assert_eq!(listing.available.len(), 1);
    }

    #[test]
    fn no_updates_available() {
        assert_eq!(parse_candidates("", None).unwrap(), CandidateListing::default());
        assert_eq!(parse_candidates("{}", None).unwrap(), CandidateListing::default());
        assert_eq!(
            parse_candidates("  \n", None).unwrap(),
            CandidateListing::default()
        );
    }

    #[test]
    fn malformed_output_is_rejected() {
        assert!(matches!(
            parse_candidates("{\"minor\": {}}", None),
            Err(Error::QueryParse { .. })
        ));
        assert!(matches!(
            parse_candidates("not json", None),
            Err(Error::QueryParse { .. })
        ));
        assert!(matches!(
            parse_candidates("{}\0trailing", None),
            Err(Error::HelperOutputNul)
        ));
    }
}
