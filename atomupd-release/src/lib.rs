/*!
# Background

This library gives you a typed view of the identity of the currently installed
SteamOS image: the `ImageManifest` structure that represents the read-only
JSON manifest shipped with the image, and the `BuildId` type used to name and
order image builds.

The manifest is read at runtime because it is owned by the image build
pipeline and changes with every update.
*/

use log::warn;
use serde::Deserialize;
use snafu::{ensure, ResultExt};
use std::cmp::Ordering;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

const DEFAULT_MANIFEST_FILE: &str = "/etc/steamos-atomupd/manifest.json";

/// The update branch assumed when the manifest doesn't name one.
pub const FALLBACK_BRANCH: &str = "stable";

pub mod error {
    use snafu::Snafu;
    use std::io;
    use std::path::PathBuf;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("The provided build ID is empty"))]
        EmptyBuildId,

        #[snafu(display(
            "Build ID '{}' doesn't follow the expected YYYYMMDD[.N] format",
            buildid
        ))]
        BuildIdFormat { buildid: String },

        #[snafu(display("The date in the build ID '{}' is not valid", buildid))]
        BuildIdDate { buildid: String },

        #[snafu(display("The increment part of the build ID is unexpected: '{}'", buildid))]
        BuildIdIncrement { buildid: String },

        #[snafu(display("Unable to read manifest file '{}': {}", path.display(), source))]
        ReadManifestFile { path: PathBuf, source: io::Error },

        #[snafu(display("Unable to parse manifest file '{}': {}", path.display(), source))]
        ParseManifest {
            path: PathBuf,
            source: serde_json::Error,
        },
    }
}
pub use error::Error;
pub type Result<T> = std::result::Result<T, error::Error>;

/// # BuildId
///
/// Identifies one image build. Build IDs are in the form `YYYYMMDD[.N]`: an
/// ISO-8601 date without separators, optionally followed by a dot and a
/// non-negative increment. Two build IDs are ordered by `(date, increment)`,
/// with a missing increment counting as zero.
///
/// Formatting a parsed `BuildId` reproduces the accepted input exactly, so
/// the textual form can be used as a stable key.
#[derive(Debug, Clone)]
pub struct BuildId {
    date: u32,
    increment: u64,
    raw: String,
}

impl BuildId {
    /// The date part, as the integer `YYYYMMDD`.
    pub fn date(&self) -> u32 {
        self.date
    }

    /// The increment part, zero when absent.
    pub fn increment(&self) -> u64 {
        self.increment
    }
}

impl FromStr for BuildId {
    type Err = Error;

    fn from_str(buildid: &str) -> Result<Self> {
        ensure!(!buildid.is_empty(), error::EmptyBuildIdSnafu);

        let (date_str, increment_str) = match buildid.split_once('.') {
            Some((date, inc)) => (date, Some(inc)),
            None => (buildid, None),
        };

        ensure!(
            date_str.len() == 8 && date_str.bytes().all(|b| b.is_ascii_digit()),
            error::BuildIdFormatSnafu { buildid }
        );

        // The parse can't fail after the digit check, but the compiler
        // doesn't know that.
        let date: u32 = date_str
            .parse()
            .map_err(|_| Error::BuildIdFormat {
                buildid: buildid.to_string(),
            })?;

        let month = (date / 100) % 100;
        let day = date % 100;
        ensure!(
            month <= 12 && day <= 31,
            error::BuildIdDateSnafu { buildid }
        );

        let increment = match increment_str {
            Some(inc) => {
                // Leading zeros are rejected so that every accepted build ID
                // has a single textual form.
                ensure!(
                    !inc.is_empty()
                        && inc.bytes().all(|b| b.is_ascii_digit())
                        && (inc == "0" || !inc.starts_with('0')),
                    error::BuildIdIncrementSnafu { buildid }
                );
                inc.parse().map_err(|_| Error::BuildIdIncrement {
                    buildid: buildid.to_string(),
                })?
            }
            None => 0,
        };

        Ok(Self {
            date,
            increment,
            raw: buildid.to_string(),
        })
    }
}

impl TryFrom<String> for BuildId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<BuildId> for String {
    fn from(buildid: BuildId) -> Self {
        buildid.raw
    }
}

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl PartialEq for BuildId {
    fn eq(&self, other: &Self) -> bool {
        self.date == other.date && self.increment == other.increment
    }
}

impl Eq for BuildId {}

impl Ord for BuildId {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.date, self.increment).cmp(&(other.date, other.increment))
    }
}

impl PartialOrd for BuildId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<'de> Deserialize<'de> for BuildId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// ImageManifest represents the JSON manifest installed alongside the running
/// image. It is the source of truth for what is installed right now.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageManifest {
    pub buildid: BuildId,
    pub version: String,
    pub variant: String,
    default_update_branch: Option<String>,

    // Only needed to assemble the remote-info URL; older manifests may not
    // carry them.
    pub release: Option<String>,
    pub product: Option<String>,
    pub arch: Option<String>,
}

impl ImageManifest {
    pub fn new() -> Result<Self> {
        Self::from_file(DEFAULT_MANIFEST_FILE)
    }

    pub fn from_file<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let manifest_data =
            fs::read_to_string(path).context(error::ReadManifestFileSnafu { path })?;
        serde_json::from_str(&manifest_data).context(error::ParseManifestSnafu { path })
    }

    /// The branch new installations of this image should track. Falls back to
    /// `stable` when the manifest doesn't name one.
    pub fn default_branch(&self) -> &str {
        match &self.default_update_branch {
            Some(branch) => branch,
            None => {
                warn!(
                    "The image manifest doesn't have a default update branch, using `{}` as a last resort",
                    FALLBACK_BRANCH
                );
                FALLBACK_BRANCH
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buildid_roundtrip() {
        for raw in ["20220227.3", "20211225.1", "20220101", "20240508.0", "20220101.10"] {
            let buildid: BuildId = raw.parse().unwrap();
            assert_eq!(buildid.to_string(), raw);
        }
    }

    #[test]
    fn buildid_rejections() {
        assert!(matches!("".parse::<BuildId>(), Err(Error::EmptyBuildId)));
        for raw in ["2022", "202202270", "2022022a", "-0220227", "snapshot"] {
            assert!(
                matches!(raw.parse::<BuildId>(), Err(Error::BuildIdFormat { .. })),
                "{} should be rejected as malformed",
                raw
            );
        }
        for raw in ["20221327.1", "20220234"] {
            assert!(matches!(
                raw.parse::<BuildId>(),
                Err(Error::BuildIdDate { .. })
            ));
        }
        for raw in ["20220227.", "20220227.a", "20220227.-1", "20220227.01"] {
            assert!(
                matches!(raw.parse::<BuildId>(), Err(Error::BuildIdIncrement { .. })),
                "{} should be rejected on the increment",
                raw
            );
        }
    }

    #[test]
    fn buildid_ordering() {
        let older: BuildId = "20211225.1".parse().unwrap();
        let newer: BuildId = "20220101.1".parse().unwrap();
        assert!(older < newer);

        let base: BuildId = "20220101".parse().unwrap();
        let increment: BuildId = "20220101.2".parse().unwrap();
        assert!(base < increment);

        let explicit_zero: BuildId = "20220101.0".parse().unwrap();
        assert_eq!(base, explicit_zero);
    }

    #[test]
    fn manifest_parse() {
        let manifest: ImageManifest = serde_json::from_str(
            r#"{
                "product": "steamos",
                "release": "holo",
                "variant": "steamdeck",
                "arch": "amd64",
                "version": "snapshot",
                "buildid": "20220227.3",
                "default_update_branch": "rc",
                "checkpoint": false
            }"#,
        )
        .unwrap();
        assert_eq!(manifest.variant, "steamdeck");
        assert_eq!(manifest.buildid.to_string(), "20220227.3");
        assert_eq!(manifest.default_branch(), "rc");
        assert_eq!(manifest.release.as_deref(), Some("holo"));
    }

    #[test]
    fn manifest_default_branch_fallback() {
        let manifest: ImageManifest = serde_json::from_str(
            r#"{ "variant": "steamdeck", "version": "3.2", "buildid": "20220101" }"#,
        )
        .unwrap();
        assert_eq!(manifest.default_branch(), "stable");
    }
}
