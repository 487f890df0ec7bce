/*!
atomupd-manager is a thin command line client for atomupd-daemon: every
subcommand maps onto one call to the `com.steampowered.Atomupd1` interface on
the system bus.
*/

use futures::stream::StreamExt;
use log::debug;
use simplelog::{Config as LogConfig, LevelFilter, SimpleLogger};
use snafu::ResultExt;
use std::collections::HashMap;
use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};
use std::{env, process};
use zbus::zvariant::Value;
use zbus::Connection;

mod atomupd1;

use atomupd1::{Atomupd1Proxy, Candidates};

const DEV_CONFIG_PATH: &str = "/etc/steamos-atomupd/client-dev.conf";

fn usage() -> ! {
    let program_name = env::args().next().unwrap_or_else(|| "program".to_string());
    #[rustfmt::skip]
    eprintln!("\
USAGE:
    {} [ --verbose ] <SUBCOMMAND>

SUBCOMMANDS:
    check [--penultimate]          Query the available updates
    update <BUILDID>               Install the given update, following its progress
    custom-update <URL>            Install an arbitrary image from the given URL
    switch-variant <VARIANT>       Track a different variant
    switch-branch <BRANCH>         Track a different branch
    list-variants                  Print the known variants
    list-branches                  Print the known branches
    tracked-variant                Print the variant this host tracks
    tracked-branch                 Print the branch this host tracks
    get-update-status              Print the state of the current update attempt
    create-dev-conf <IMAGES-URL> <META-URL>
                                   Write a client-dev.conf pointing at a custom server",
        program_name);
    process::exit(2)
}

/// Prints a more specific message before exiting through usage().
fn usage_msg<S: AsRef<str>>(msg: S) -> ! {
    eprintln!("{}\n", msg.as_ref());
    usage();
}

mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(crate)))]
    pub(crate) enum Error {
        #[snafu(display("Logger setup error: {}", source))]
        Logger { source: log::SetLoggerError },

        #[snafu(display("D-Bus failure: {}", source))]
        ZbusFailure { source: zbus::Error },

        #[snafu(display("Failed to write '{}': {}", path, source))]
        WriteDevConfig {
            path: String,
            source: std::io::Error,
        },

        #[snafu(display("{}: {}", code, message))]
        UpdateFailed { code: String, message: String },

        #[snafu(display("The update has been cancelled"))]
        UpdateCancelled,
    }

    impl From<zbus::Error> for Error {
        fn from(err: zbus::Error) -> Self {
            Error::ZbusFailure { source: err }
        }
    }
}

use error::Error;
type Result<T> = std::result::Result<T, Error>;

fn status_name(status: u32) -> &'static str {
    match status {
        0 => "idle",
        1 => "in-progress",
        2 => "paused",
        3 => "successful",
        4 => "failed",
        5 => "cancelled",
        _ => "unknown",
    }
}

fn print_candidates(heading: &str, candidates: &Candidates) {
    if candidates.is_empty() {
        return;
    }

    println!("{}", heading);
    for (buildid, entry) in candidates {
        let version = entry
            .get("version")
            .and_then(|value| String::try_from(value.clone()).ok())
            .unwrap_or_default();
        let size = entry
            .get("estimated_size")
            .and_then(|value| u64::try_from(value.clone()).ok())
            .unwrap_or(0);
        let requires = entry
            .get("requires")
            .and_then(|value| String::try_from(value.clone()).ok());

        match requires {
            Some(requires) => {
                println!("  {} ({}, {} bytes, requires {})", buildid, version, size, requires)
            }
            None => println!("  {} ({}, {} bytes)", buildid, version, size),
        }
    }
}

async fn check(proxy: &Atomupd1Proxy<'_>, penultimate: bool) -> Result<()> {
    let mut options: HashMap<&str, Value<'_>> = HashMap::new();
    if penultimate {
        options.insert("penultimate", Value::from(true));
    }

    let (available, available_later) = proxy.check_for_updates(options).await?;

    if available.is_empty() && available_later.is_empty() {
        println!("No update available");
        return Ok(());
    }

    print_candidates("Available updates:", &available);
    print_candidates("Available updates (requiring a checkpoint):", &available_later);
    Ok(())
}

/// Prints one progress line, overwriting the previous one. The second `\r`
/// is necessary to avoid breaking the legacy steamos-update script parsing.
async fn print_progress(proxy: &Atomupd1Proxy<'_>, percentage: f64) -> Result<()> {
    print!("\r\x1B[K\r{:.2}%  ", percentage);

    let completion_time = proxy.estimated_completion_time().await?;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);
    if completion_time > now {
        let remaining = completion_time - now;
        if remaining >= 60 {
            print!("{}m", remaining / 60);
        }
        print!("{:02}s", remaining % 60);
    }

    let _ = std::io::stdout().flush();
    Ok(())
}

/// Launches an update and waits until it either completes or fails,
/// printing the progress reported by the daemon. A SIGINT tries to cancel
/// the update instead of leaving it running in the background.
async fn launch_update(
    proxy: &Atomupd1Proxy<'_>,
    update_id: Option<&str>,
    update_url: Option<&str>,
) -> Result<()> {
    let mut status_changes = proxy.receive_update_status_changed().await;
    let mut progress_changes = proxy.receive_progress_percentage_changed().await;

    match (update_id, update_url) {
        (Some(update_id), _) => proxy.start_update(update_id).await?,
        (None, Some(update_url)) => {
            let mut options: HashMap<&str, Value<'_>> = HashMap::new();
            options.insert("url", Value::from(update_url));
            proxy.start_custom_update(options).await?;
        }
        (None, None) => usage(),
    }

    loop {
        tokio::select! {
            changed = status_changes.next() => {
                let changed = match changed {
                    Some(changed) => changed,
                    None => continue,
                };
                match changed.get().await? {
                    // successful
                    3 => {
                        println!("\nUpdate completed");
                        return Ok(());
                    }
                    // failed
                    4 => {
                        println!("\nThe update failed!");
                        return error::UpdateFailedSnafu {
                            code: proxy.failure_code().await?,
                            message: proxy.failure_message().await?,
                        }
                        .fail();
                    }
                    _ => {}
                }
            }
            changed = progress_changes.next() => {
                if let Some(changed) = changed {
                    print_progress(proxy, changed.get().await?).await?;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                debug!("Caught signal. Stopping eventual updates.");
                let _ = proxy.cancel_update().await;
                return error::UpdateCancelledSnafu.fail();
            }
        }
    }
}

async fn update_status(proxy: &Atomupd1Proxy<'_>) -> Result<()> {
    let status = proxy.update_status().await?;
    println!("Status: {}", status_name(status));

    let build_id = proxy.update_build_id().await?;
    if !build_id.is_empty() {
        let version = proxy.update_version().await?;
        println!("Update: {} ({})", build_id, version);
    }

    match status {
        // in-progress or paused
        1 | 2 => println!("Progress: {:.2}%", proxy.progress_percentage().await?),
        // failed
        4 => {
            println!("Failure code: {}", proxy.failure_code().await?);
            println!("Failure message: {}", proxy.failure_message().await?);
        }
        _ => {}
    }
    Ok(())
}

async fn create_dev_conf(
    proxy: &Atomupd1Proxy<'_>,
    images_url: &str,
    meta_url: &str,
) -> Result<()> {
    let known_variants = proxy.known_variants().await?;
    let known_branches = proxy.known_branches().await?;

    let mut dev_config = configparser::ini::Ini::new_cs();
    dev_config.set("Server", "ImagesUrl", Some(images_url.to_string()));
    dev_config.set("Server", "MetaUrl", Some(meta_url.to_string()));
    dev_config.set("Server", "Variants", Some(known_variants.join(";")));
    dev_config.set("Server", "Branches", Some(known_branches.join(";")));

    dev_config
        .write(DEV_CONFIG_PATH)
        .context(error::WriteDevConfigSnafu {
            path: DEV_CONFIG_PATH,
        })?;
    println!("Created {}", DEV_CONFIG_PATH);
    println!("Run `atomupd-manager check` to query the custom server");
    Ok(())
}

async fn run() -> Result<()> {
    let mut log_level = LevelFilter::Warn;
    let mut subcommand = None;
    let mut arguments: Vec<String> = Vec::new();

    for arg in env::args().skip(1) {
        match arg.as_ref() {
            "--verbose" if subcommand.is_none() => log_level = LevelFilter::Debug,
            _ if subcommand.is_none() => subcommand = Some(arg),
            _ => arguments.push(arg),
        }
    }

    SimpleLogger::init(log_level, LogConfig::default()).context(error::LoggerSnafu)?;

    let subcommand = subcommand.unwrap_or_else(|| usage());

    debug!("Connecting to the system bus");
    let connection = Connection::system().await?;
    let proxy = Atomupd1Proxy::new(&connection).await?;

    match (subcommand.as_str(), arguments.as_slice()) {
        ("check", []) => check(&proxy, false).await,
        ("check", [flag]) if flag == "--penultimate" => check(&proxy, true).await,
        ("update", [buildid]) => launch_update(&proxy, Some(buildid), None).await,
        ("custom-update", [url]) => launch_update(&proxy, None, Some(url)).await,
        ("switch-variant", [variant]) => {
            proxy.switch_to_variant(variant).await?;
            println!("Now tracking the variant {}", variant);
            Ok(())
        }
        ("switch-branch", [branch]) => {
            if branch == "staging" {
                println!(
                    "The staging branch has a high risk of breaking.\nDo NOT use it unless you know what you are doing."
                );
            }
            proxy.switch_to_branch(branch).await?;
            println!("Now tracking the branch {}", branch);
            Ok(())
        }
        ("list-variants", []) => {
            for variant in proxy.known_variants().await? {
                println!("{}", variant);
            }
            Ok(())
        }
        ("list-branches", []) => {
            for branch in proxy.known_branches().await? {
                println!("{}", branch);
            }
            Ok(())
        }
        ("tracked-variant", []) => {
            println!("{}", proxy.variant().await?);
            Ok(())
        }
        ("tracked-branch", []) => {
            println!("{}", proxy.branch().await?);
            Ok(())
        }
        ("get-update-status", []) => update_status(&proxy).await,
        ("create-dev-conf", [images_url, meta_url]) => {
            create_dev_conf(&proxy, images_url, meta_url).await
        }
        _ => usage_msg(format!("Unexpected arguments for '{}'", subcommand)),
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{}", e);
        process::exit(1);
    }
}
