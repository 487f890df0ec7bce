use snafu::Snafu;
use std::io;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Logger setup error: {}", source))]
    Logger { source: log::SetLoggerError },

    #[snafu(display("Unable to load the image manifest: {}", source))]
    Release { source: atomupd_release::Error },

    #[snafu(display("Failed to read '{}': {}", path.display(), source))]
    ReadFile { path: PathBuf, source: io::Error },

    #[snafu(display("Failed to write '{}': {}", path.display(), source))]
    WriteFile { path: PathBuf, source: io::Error },

    #[snafu(display("Failed to create a temporary file in '{}': {}", path.display(), source))]
    CreateTempfile { path: PathBuf, source: io::Error },

    #[snafu(display("Failed to replace '{}': {}", path.display(), source))]
    PersistFile {
        path: PathBuf,
        source: tempfile::PathPersistError,
    },

    #[snafu(display("Failed to create directory '{}': {}", path.display(), source))]
    CreateDirectory { path: PathBuf, source: io::Error },

    #[snafu(display("Failed to parse the config file '{}': {}", path.display(), reason))]
    ConfigParse { path: PathBuf, reason: String },

    #[snafu(display("The config file '{}' doesn't have the expected '{}' entry", path.display(), key))]
    MissingConfigEntry { path: PathBuf, key: String },

    #[snafu(display("Failed to parse the preferences file '{}': {}", path.display(), reason))]
    PreferencesParse { path: PathBuf, reason: String },

    #[snafu(display("Failed to parse the chosen {} from '{}'", key, path.display()))]
    MissingPreference { key: String, path: PathBuf },

    #[snafu(display("The legacy config file '{}' could not be used: {}", path.display(), reason))]
    LegacyBranchFile { path: PathBuf, reason: String },

    #[snafu(display("The legacy variant '{}' is unexpected", variant))]
    UnexpectedLegacyVariant { variant: String },

    #[snafu(display("Expected to find a JSON object in '{}'", path.display()))]
    DesyncNotAnObject { path: PathBuf },

    #[snafu(display("Failed to parse the desync config '{}': {}", path.display(), source))]
    DesyncParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[snafu(display("The image manifest does not have the expected release, product and arch keys"))]
    MissingManifestKeys,

    #[snafu(display("Failed to set up the HTTP client: {}", source))]
    HttpClient { source: reqwest::Error },

    #[snafu(display("The download from '{}' failed: {}", url, source))]
    Download { url: String, source: reqwest::Error },

    #[snafu(display("An error occurred calling the 'steamos-atomupd-client' helper: {}", source))]
    HelperSpawn { source: io::Error },

    #[snafu(display("The 'steamos-atomupd-client' helper did not reply within {} seconds", seconds))]
    HelperTimeout { seconds: u64 },

    #[snafu(display("'steamos-atomupd-client' helper returned an error: {}", message))]
    HelperFailed { message: String },

    #[snafu(display("The server query returned HTTP 4xx"))]
    QueryHttp4xx,

    #[snafu(display("Helper output is not valid JSON: contains \\0"))]
    HelperOutputNul,

    #[snafu(display("The helper output is not a valid JSON: {}", source))]
    QueryParse { source: serde_json::Error },

    #[snafu(display("The argument '{}' is not a valid option", key))]
    InvalidOption { key: String },

    #[snafu(display("The argument '{}' must have a boolean value", key))]
    OptionType { key: String },

    #[snafu(display("Failed to start a new update because one is already in progress"))]
    UpdateAlreadyInProgress,

    #[snafu(display("It is not possible to start an update before calling \"CheckForUpdates\""))]
    NoPriorCheck,

    #[snafu(display("There isn't an update in progress that can be paused"))]
    NotInProgress,

    #[snafu(display("There isn't a paused update that can be resumed"))]
    NotPaused,

    #[snafu(display("There isn't an update in progress that can be cancelled"))]
    NothingToCancel,

    #[snafu(display("Unexpectedly the PID of the install helper is not set"))]
    NoHelperPid,

    #[snafu(display("Unable to send signal {} to PID {}: {}", signal, pid, source))]
    SendSignal {
        signal: String,
        pid: i32,
        source: nix::Error,
    },

    #[snafu(display("Failed to run systemctl: {}", source))]
    SystemctlRun { source: io::Error },

    #[snafu(display("An error occurred while trying to gather the RAUC PID: {}", reason))]
    RaucPid { reason: String },

    #[snafu(display("Failed to run pidof: {}", source))]
    PidofRun { source: io::Error },

    #[snafu(display("There isn't a running process for {}", process))]
    NoSuchProcess { process: String },

    #[snafu(display("An error occurred while trying to gather the {} PID", process))]
    PidParse { process: String },

    #[snafu(display("Unable to set up a signal handler: {}", source))]
    SignalHandler { source: io::Error },

    #[snafu(display("D-Bus failure: {}", source))]
    Zbus { source: zbus::Error },
}

impl From<zbus::Error> for Error {
    fn from(err: zbus::Error) -> Self {
        Error::Zbus { source: err }
    }
}

impl From<Error> for zbus::fdo::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::InvalidOption { .. } | Error::OptionType { .. } => {
                zbus::fdo::Error::InvalidArgs(err.to_string())
            }
            _ => zbus::fdo::Error::Failed(err.to_string()),
        }
    }
}
