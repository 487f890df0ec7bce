//! Small helpers shared across the daemon.

use crate::error::{self, Result};
use snafu::ResultExt;
use std::fs::Permissions;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tempfile::NamedTempFile;

/// Writes `contents` to `path` by way of a temporary file in the same
/// directory that is fsynced and renamed into place, so that readers never
/// observe a partial file.
pub fn write_atomically(path: &Path, contents: &[u8], mode: Option<u32>) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp =
        NamedTempFile::new_in(dir).context(error::CreateTempfileSnafu { path: dir })?;
    temp.write_all(contents)
        .context(error::WriteFileSnafu { path })?;
    temp.as_file()
        .sync_all()
        .context(error::WriteFileSnafu { path })?;
    if let Some(mode) = mode {
        temp.as_file()
            .set_permissions(Permissions::from_mode(mode))
            .context(error::WriteFileSnafu { path })?;
    }
    temp.into_temp_path()
        .persist(path)
        .context(error::PersistFileSnafu { path })?;
    Ok(())
}

/// Extracts the host component out of an URL, keeping an eventual port.
pub fn host_from_url(url: &str) -> String {
    let host = match url.split_once("://") {
        Some((_scheme, rest)) => rest,
        None => url,
    };
    match host.split_once('/') {
        Some((host, _path)) => host.to_string(),
        None => host.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_extraction() {
        assert_eq!(host_from_url("https://images.example.com/steamos"), "images.example.com");
        assert_eq!(host_from_url("http://meta.example.com"), "meta.example.com");
        assert_eq!(host_from_url("meta.example.com/atomupd"), "meta.example.com");
        assert_eq!(host_from_url("https://images.example.com:8443/a/b"), "images.example.com:8443");
    }

    #[test]
    fn atomic_write_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("file.conf");
        write_atomically(&target, b"first", None).unwrap();
        write_atomically(&target, b"second", Some(0o600)).unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "second");
        let mode = std::os::unix::fs::MetadataExt::mode(&std::fs::metadata(&target).unwrap());
        assert_eq!(mode & 0o777, 0o600);
    }
}
