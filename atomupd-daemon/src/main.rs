use atomupd_daemon::daemon::{Atomupd1, ATOMUPD1_BUS_NAME, ATOMUPD1_PATH};
use atomupd_daemon::error::{self, Result};
use atomupd_daemon::paths::Paths;
use atomupd_release::ImageManifest;
use futures::stream::StreamExt;
use log::debug;
use simplelog::{Config as LogConfig, LevelFilter, SimpleLogger};
use snafu::ResultExt;
use std::path::PathBuf;
use std::{env, process};
use tokio::signal::unix::{signal, SignalKind};
use zbus::fdo::{DBusProxy, RequestNameFlags, RequestNameReply};
use zbus::names::WellKnownName;
use zbus::Connection;

/// Stores the command line arguments
struct Args {
    config_directory: Option<PathBuf>,
    manifest_file: Option<PathBuf>,
    replace: bool,
    log_level: LevelFilter,
}

/// Prints an usage message
fn usage() -> ! {
    let program_name = env::args().next().unwrap_or_else(|| "program".to_string());
    eprintln!(
        r"Usage: {}
            Options:
                    [ --config-directory DIR ]  Directory holding client.conf (default /etc/steamos-atomupd)
                    [ --manifest-file PATH ]    Custom image manifest (default /etc/steamos-atomupd/manifest.json)
                    [ --replace ]               Replace a previous instance with the same bus name
                    [ --verbose ]               Be more verbose
                    [ --version ]               Print version number and exit",
        program_name,
    );
    process::exit(2);
}

/// Prints a more specific message before exiting through usage().
fn usage_msg<S: AsRef<str>>(msg: S) -> ! {
    eprintln!("{}\n", msg.as_ref());
    usage();
}

/// Parses the command line arguments
fn parse_args(args: std::env::Args) -> Args {
    let mut config_directory = None;
    let mut manifest_file = None;
    let mut replace = false;
    let mut log_level = LevelFilter::Info;

    let mut iter = args.skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_ref() {
            "--config-directory" => {
                config_directory = Some(PathBuf::from(iter.next().unwrap_or_else(|| {
                    usage_msg("Did not give argument to --config-directory")
                })));
            }

            "--manifest-file" => {
                manifest_file = Some(PathBuf::from(iter.next().unwrap_or_else(|| {
                    usage_msg("Did not give argument to --manifest-file")
                })));
            }

            "--replace" => replace = true,

            "--verbose" => log_level = LevelFilter::Debug,

            "--version" => {
                println!(
                    "atomupd-daemon:\n Package: atomupd-daemon\n Version: {}",
                    env!("CARGO_PKG_VERSION")
                );
                process::exit(0);
            }

            _ => usage(),
        }
    }

    Args {
        config_directory,
        manifest_file,
        replace,
        log_level,
    }
}

async fn run() -> Result<()> {
    let args = parse_args(env::args());

    // SimpleLogger will send errors to stderr and anything less to stdout.
    SimpleLogger::init(args.log_level, LogConfig::default()).context(error::LoggerSnafu)?;

    let paths = Paths::new(args.config_directory.as_deref(), args.manifest_file.as_deref());
    let manifest = ImageManifest::from_file(&paths.manifest).context(error::ReleaseSnafu)?;

    let connection = Connection::system().await?;
    let atomupd = Atomupd1::new(&connection, paths, manifest).await?;
    connection
        .object_server()
        .at(ATOMUPD1_PATH, atomupd)
        .await?;

    // The object is in place, claim the well-known name. A newer instance
    // may replace us; we shut down when that happens.
    let dbus = DBusProxy::new(&connection).await?;
    let mut flags = RequestNameFlags::AllowReplacement | RequestNameFlags::DoNotQueue;
    if args.replace {
        flags |= RequestNameFlags::ReplaceExisting;
    }
    let name = WellKnownName::try_from(ATOMUPD1_BUS_NAME).map_err(zbus::Error::from)?;
    match dbus.request_name(name, flags).await.map_err(zbus::Error::from)? {
        RequestNameReply::PrimaryOwner => {
            debug!(
                "Acquired the name {} on the system message bus",
                ATOMUPD1_BUS_NAME
            );
        }
        _ => return Err(zbus::Error::NameTaken.into()),
    }

    let mut name_lost = dbus.receive_name_lost().await?;
    let mut sigint = signal(SignalKind::interrupt()).context(error::SignalHandlerSnafu)?;
    let mut sigterm = signal(SignalKind::terminate()).context(error::SignalHandlerSnafu)?;

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                debug!("Caught SIGINT. Initiating shutdown.");
                break;
            }
            _ = sigterm.recv() => {
                debug!("Caught SIGTERM. Initiating shutdown.");
                break;
            }
            lost = name_lost.next() => {
                match lost {
                    Some(lost) => {
                        if let Ok(lost_args) = lost.args() {
                            if lost_args.name().as_str() == ATOMUPD1_BUS_NAME {
                                debug!(
                                    "Lost the name {} on the system message bus",
                                    ATOMUPD1_BUS_NAME
                                );
                                break;
                            }
                        }
                    }
                    None => break,
                }
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{}", e);
        process::exit(1);
    }
}
