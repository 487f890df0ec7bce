/*!
# Introduction

atomupd-daemon is the per-host service that mediates atomic SteamOS image
updates. It owns the lifecycle of update queries and installations: it decides
which updates exist for the image the host is running, launches and supervises
the `steamos-atomupd-client` helper that performs the actual transfer and
apply through RAUC, tracks progress, and exposes the
`com.steampowered.Atomupd1` interface on the system message bus to
unprivileged clients.

The daemon is the only writer of its on-disk state: the user preferences, the
netrc and desync credential files, the cached remote-info file and the cached
update-candidates JSON. All of those are replaced atomically so that partial
writes are never observable by the helpers that consume them.
*/

/// The helper that performs the actual transfer and image apply.
pub const ATOMUPD_CLIENT: &str = "steamos-atomupd-client";

pub mod candidates;
pub mod config;
pub mod credentials;
pub mod daemon;
pub mod error;
pub mod paths;
pub mod policy;
pub mod preferences;
pub mod process;
pub mod progress;
pub mod remote_info;
pub mod session;
pub mod util;
