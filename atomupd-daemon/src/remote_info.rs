//! Refresh of the small `remote-info.conf` file the update server publishes
//! per variant. The download is aggressive about timing out: the file is
//! tiny, and a failure is never fatal because the daemon keeps using
//! whatever local copy exists.

use crate::config;
use crate::credentials::lookup_netrc;
use crate::error::{self, Error, Result};
use crate::paths::{Paths, REMOTE_INFO};
use crate::util::host_from_url;
use atomupd_release::ImageManifest;
use log::debug;
use snafu::ResultExt;
use std::fs;
use std::path::Path;
use std::time::Duration;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds `<MetaUrl>/<release>/<product>/<arch>/<variant>/remote-info.conf`.
pub fn remote_info_url(meta_url: &str, manifest: &ImageManifest, variant: &str) -> Result<String> {
    let (release, product, arch) = match (&manifest.release, &manifest.product, &manifest.arch) {
        (Some(release), Some(product), Some(arch)) => (release, product, arch),
        _ => return error::MissingManifestKeysSnafu.fail(),
    };

    Ok(format!(
        "{}/{}/{}/{}/{}/{}",
        meta_url.trim_end_matches('/'),
        release,
        product,
        arch,
        variant,
        REMOTE_INFO
    ))
}

/// Downloads `url` to `target`, staging through `<target>.part` so the
/// destination is only ever replaced by a complete file.
fn download_file(
    target: &Path,
    url: &str,
    http_proxy: Option<&str>,
    auth: Option<(String, String)>,
) -> Result<()> {
    let mut builder = reqwest::blocking::Client::builder()
        .connect_timeout(DOWNLOAD_TIMEOUT)
        .timeout(DOWNLOAD_TIMEOUT);

    if let Some(proxy) = http_proxy {
        let proxy_url = if proxy.contains("://") {
            proxy.to_string()
        } else {
            format!("http://{}", proxy)
        };
        builder = builder.proxy(reqwest::Proxy::all(proxy_url).context(error::HttpClientSnafu)?);
    }

    let client = builder.build().context(error::HttpClientSnafu)?;

    let mut request = client.get(url);
    if let Some((login, password)) = auth {
        request = request.basic_auth(login, Some(password));
    }

    let response = request
        .send()
        .and_then(|response| response.error_for_status())
        .context(error::DownloadSnafu { url })?;
    let body = response.bytes().context(error::DownloadSnafu { url })?;

    let mut part = target.as_os_str().to_os_string();
    part.push(".part");
    let part = Path::new(&part);

    if let Err(source) = fs::write(part, &body) {
        let _ = fs::remove_file(part);
        return Err(Error::WriteFile {
            path: part.to_path_buf(),
            source,
        });
    }
    if let Err(source) = fs::rename(part, target) {
        let _ = fs::remove_file(part);
        return Err(Error::WriteFile {
            path: target.to_path_buf(),
            source,
        });
    }

    Ok(())
}

/// Replaces the local remote-info file with the latest server version for
/// the tracked variant. Blocking; run it on a worker thread.
pub fn download_remote_info(
    paths: &Paths,
    manifest: &ImageManifest,
    variant: &str,
    http_proxy: Option<&str>,
) -> Result<()> {
    let meta_url = config::meta_url_from_default_config(paths)?;
    let url = remote_info_url(&meta_url, manifest, variant)?;

    // The helpers reach the server through the netrc credentials; reuse them
    // for this download too.
    let auth = fs::read_to_string(&paths.netrc)
        .ok()
        .and_then(|netrc| lookup_netrc(&netrc, &host_from_url(&url)));

    debug!("Downloading the remote info from {}", url);
    download_file(&paths.remote_info, &url, http_proxy, auth)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> ImageManifest {
        serde_json::from_str(
            r#"{ "variant": "steamdeck", "version": "3.4.6", "buildid": "20220227.3",
                 "release": "holo", "product": "steamos", "arch": "amd64" }"#,
        )
        .unwrap()
    }

    #[test]
    fn url_building() {
        assert_eq!(
            remote_info_url("https://meta.example.com/atomupd", &manifest(), "steamdeck").unwrap(),
            "https://meta.example.com/atomupd/holo/steamos/amd64/steamdeck/remote-info.conf"
        );
        // A trailing slash doesn't double up.
        assert_eq!(
            remote_info_url("https://meta.example.com/", &manifest(), "vanilla").unwrap(),
            "https://meta.example.com/holo/steamos/amd64/vanilla/remote-info.conf"
        );
    }

    #[test]
    fn url_requires_manifest_keys() {
        let manifest: ImageManifest = serde_json::from_str(
            r#"{ "variant": "steamdeck", "version": "3.4.6", "buildid": "20220227.3" }"#,
        )
        .unwrap();
        assert!(matches!(
            remote_info_url("https://meta.example.com", &manifest, "steamdeck"),
            Err(Error::MissingManifestKeys)
        ));
    }
}
