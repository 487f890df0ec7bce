//! The `com.steampowered.Atomupd1` interface: typed method dispatch, the
//! property surface, and the session supervision glue.
//!
//! All writing methods serialise on one logical executor (the writer lock);
//! property reads are served from the state snapshot concurrently. Every
//! property mutation is published on the bus before the method that caused
//! it replies.

use crate::candidates::{self, CandidateMap, QueryRequest};
use crate::config::{self, EffectiveConfig};
use crate::error::{self, Error, Result};
use crate::paths::Paths;
use crate::policy::{self, AuthorityProxy};
use crate::preferences::{self, UserPreferences};
use crate::process;
use crate::progress;
use crate::remote_info;
use crate::session::{self, SessionState, UpdateStatus};
use crate::util;
use crate::ATOMUPD_CLIENT;
use atomupd_release::{BuildId, ImageManifest};
use chrono::Utc;
use log::{debug, info, warn};
use nix::sys::signal::Signal;
use snafu::ResultExt;
use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::task::spawn_blocking;
use zbus::message::{Flags, Header};
use zbus::object_server::SignalEmitter;
use zbus::zvariant::{OwnedValue, Value};
use zbus::{fdo, interface, Connection};

pub const ATOMUPD1_PATH: &str = "/com/steampowered/Atomupd1";
pub const ATOMUPD1_BUS_NAME: &str = "com.steampowered.Atomupd1";

/// The version of this interface, exposed in the "Version" property.
const ATOMUPD_VERSION: u32 = 6;

/// The update maps as they travel on the bus (`a{sa{sv}}`).
pub type BusCandidates = HashMap<String, HashMap<String, OwnedValue>>;

/// Everything mutable behind the property surface.
#[derive(Debug)]
pub struct State {
    pub config: EffectiveConfig,
    pub variant: String,
    pub branch: String,
    pub http_proxy: Option<(String, i32)>,
    pub available: CandidateMap,
    pub available_later: CandidateMap,
    pub session: SessionState,
}

pub struct Atomupd1 {
    paths: Paths,
    manifest: ImageManifest,
    authority: AuthorityProxy<'static>,
    state: Arc<Mutex<State>>,
    /// Serialises the writing methods; held across their suspension points.
    writer: Arc<tokio::sync::Mutex<()>>,
}

fn http_proxy_string(http_proxy: &Option<(String, i32)>) -> Option<String> {
    match http_proxy {
        Some((address, port)) if !address.is_empty() => Some(format!("{}:{}", address, port)),
        _ => None,
    }
}

/// The tracked variant and branch are always part of the known lists when a
/// request is answered, no matter what the configuration says. Returns
/// whether anything had to be appended.
fn ensure_tracked_in_known(state: &mut State) -> bool {
    let mut appended = false;
    if !state
        .config
        .known_variants
        .iter()
        .any(|variant| variant == &state.variant)
    {
        state.config.known_variants.push(state.variant.clone());
        appended = true;
    }
    if !state
        .config
        .known_branches
        .iter()
        .any(|branch| branch == &state.branch)
    {
        state.config.known_branches.push(state.branch.clone());
        appended = true;
    }
    appended
}

fn candidate_map_to_bus(map: &CandidateMap) -> fdo::Result<BusCandidates> {
    let mut bus_map = BusCandidates::new();
    for (buildid, info) in map {
        let mut entry = HashMap::new();
        let failed = |e: zbus::zvariant::Error| fdo::Error::Failed(e.to_string());
        entry.insert(
            "version".to_string(),
            Value::new(info.version.as_str()).try_to_owned().map_err(failed)?,
        );
        entry.insert(
            "variant".to_string(),
            Value::new(info.variant.as_str()).try_to_owned().map_err(failed)?,
        );
        entry.insert(
            "estimated_size".to_string(),
            Value::new(info.estimated_size).try_to_owned().map_err(failed)?,
        );
        if let Some(requires) = &info.requires {
            entry.insert(
                "requires".to_string(),
                Value::new(requires.as_str()).try_to_owned().map_err(failed)?,
            );
        }
        bus_map.insert(buildid.clone(), entry);
    }
    Ok(bus_map)
}

impl Atomupd1 {
    /// Builds the service object: loads preferences (migrating the legacy
    /// branch file if needed), refreshes the remote-info file, resolves the
    /// configuration, terminates stray helper processes, and restores the
    /// reboot-pending marker and the cached candidate listing.
    pub async fn new(
        connection: &Connection,
        paths: Paths,
        manifest: ImageManifest,
    ) -> Result<Self> {
        let authority = AuthorityProxy::new(connection).await?;

        let preferences = preferences::load_or_migrate(&paths, &manifest)?;
        debug!(
            "Tracking the variant {} and branch {}",
            preferences.variant, preferences.branch
        );

        // The download uses a blocking HTTP client; keep it off the
        // runtime threads.
        let download_paths = paths.clone();
        let download_manifest = manifest.clone();
        let download_variant = preferences.variant.clone();
        let download_proxy = http_proxy_string(&preferences.http_proxy);
        let downloaded = spawn_blocking(move || {
            remote_info::download_remote_info(
                &download_paths,
                &download_manifest,
                &download_variant,
                download_proxy.as_deref(),
            )
        })
        .await;
        match downloaded {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                info!("Failed to download the remote info: {}", e);
                info!("Continuing anyway...");
            }
            Err(e) => info!("Failed to download the remote info: {}", e),
        }

        let config = config::select_and_load(&paths, &manifest)?;

        if let Some(parent) = paths.updates_json.parent() {
            fs::create_dir_all(parent).context(error::CreateDirectorySnafu { path: parent })?;
        }

        // Never more than one install helper alive at a time: take care of
        // leftovers from a previous instance before accepting requests.
        match process::process_pid(ATOMUPD_CLIENT) {
            Ok(pid) => {
                debug!("There is already a {} process running, stopping it...", ATOMUPD_CLIENT);
                process::ensure_pid_is_killed(pid);
            }
            Err(e) => debug!("{}", e),
        }
        debug!("Stopping the RAUC service, if it's running...");
        match process::rauc_service_pid() {
            Ok(pid) => process::ensure_pid_is_killed(pid),
            Err(e) => debug!("{}", e),
        }

        let mut session = SessionState::default();
        if let Ok(contents) = fs::read_to_string(&paths.reboot_marker) {
            debug!(
                "An update has already been successfully installed, it will be applied at the next reboot"
            );
            let trimmed = contents.trim();
            let (buildid, version) = match trimmed.split_once('-') {
                Some((buildid, version)) => (buildid, Some(version)),
                None => (trimmed, None),
            };
            if !buildid.is_empty() {
                session.build_id = Some(buildid.trim().to_string());
            }
            if let Some(version) = version {
                session.version = Some(version.trim().to_string());
            }
            session.status = UpdateStatus::Successful;
        }

        let mut state = State {
            config,
            variant: preferences.variant,
            branch: preferences.branch,
            http_proxy: preferences.http_proxy,
            available: CandidateMap::new(),
            available_later: CandidateMap::new(),
            session,
        };

        // Restore the listing the previous instance published, so long as
        // the cached file is still valid.
        if paths.updates_json.exists() {
            Self::restore_cached_listing(&paths, &mut state);
        }

        ensure_tracked_in_known(&mut state);

        Ok(Self {
            paths,
            manifest,
            authority,
            state: Arc::new(Mutex::new(state)),
            writer: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    fn restore_cached_listing(paths: &Paths, state: &mut State) {
        let contents = match fs::read_to_string(&paths.updates_json) {
            Ok(contents) => contents,
            Err(e) => {
                warn!("Unable to read the existing updates JSON file: {}", e);
                return;
            }
        };

        let updated_build_id = match state.session.status {
            UpdateStatus::Successful => state.session.build_id.clone(),
            _ => None,
        };

        // Not a critical issue on failure: the next CheckForUpdates will
        // replace the unexpected file.
        let listing = match candidates::parse_candidates(&contents, updated_build_id.as_deref()) {
            Ok(listing) => listing,
            Err(e) => {
                warn!("Unable to parse the existing updates JSON file: {}", e);
                return;
            }
        };

        state.available = listing.available;
        state.available_later = listing.available_later;

        if let Some(replacement) = listing.replacement_eol_variant {
            if replacement != state.variant {
                debug!(
                    "Switching from the EOL variant {} to its replacement {}",
                    state.variant, replacement
                );
                let preferences = UserPreferences {
                    variant: replacement.clone(),
                    branch: state.branch.clone(),
                    http_proxy: state.http_proxy.clone(),
                };
                match preferences.store(&paths.preferences) {
                    Ok(()) => state.variant = replacement,
                    Err(e) => {
                        warn!(
                            "An error occurred while switching to the new variant '{}': {}",
                            replacement, e
                        );
                        state.available.clear();
                        state.available_later.clear();
                    }
                }
            }
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn authorize(&self, header: &Header<'_>, action_id: &str) -> fdo::Result<()> {
        let sender = header
            .sender()
            .ok_or_else(|| fdo::Error::AccessDenied("The caller is unknown".to_string()))?;
        let interactive = header
            .primary()
            .flags()
            .contains(Flags::AllowInteractiveAuth);
        policy::check_authorization(&self.authority, sender.as_str(), action_id, interactive).await
    }

    /// Replaces the effective configuration and publishes the refreshed
    /// known lists.
    async fn apply_config(
        &self,
        config: EffectiveConfig,
        emitter: &SignalEmitter<'_>,
    ) -> zbus::Result<()> {
        {
            let mut state = self.state();
            state.config = config;
            ensure_tracked_in_known(&mut state);
        }
        self.known_variants_changed(emitter).await?;
        self.known_branches_changed(emitter).await?;
        Ok(())
    }

    /// The variant switch shared by the method handler, the EOL handover and
    /// the HTTP-4xx fallback. A failure to persist the preferences aborts
    /// the switch before the property is updated.
    async fn switch_variant_internal(
        &self,
        variant: &str,
        clear_available: bool,
        emitter: &SignalEmitter<'_>,
    ) -> Result<()> {
        let preferences = {
            let state = self.state();
            if state.variant == variant {
                debug!("We are already tracking the variant {}, nothing to do", variant);
                return Ok(());
            }
            UserPreferences {
                variant: variant.to_string(),
                branch: state.branch.clone(),
                http_proxy: state.http_proxy.clone(),
            }
        };

        preferences.store(&self.paths.preferences)?;

        let appended = {
            let mut state = self.state();
            if clear_available {
                state.available.clear();
                state.available_later.clear();
            }
            state.variant = variant.to_string();
            ensure_tracked_in_known(&mut state)
        };

        if clear_available {
            self.updates_available_changed(emitter).await?;
            self.updates_available_later_changed(emitter).await?;
        }
        if appended {
            self.known_variants_changed(emitter).await?;
        }
        self.variant_changed(emitter).await?;

        Ok(())
    }

    async fn switch_branch_internal(
        &self,
        branch: &str,
        emitter: &SignalEmitter<'_>,
    ) -> Result<()> {
        let preferences = {
            let state = self.state();
            if state.branch == branch {
                debug!("We are already tracking the branch {}, nothing to do", branch);
                return Ok(());
            }
            UserPreferences {
                variant: state.variant.clone(),
                branch: branch.to_string(),
                http_proxy: state.http_proxy.clone(),
            }
        };

        preferences.store(&self.paths.preferences)?;

        let appended = {
            let mut state = self.state();
            state.available.clear();
            state.available_later.clear();
            state.branch = branch.to_string();
            ensure_tracked_in_known(&mut state)
        };

        self.updates_available_changed(emitter).await?;
        self.updates_available_later_changed(emitter).await?;
        if appended {
            self.known_branches_changed(emitter).await?;
        }
        self.branch_changed(emitter).await?;

        Ok(())
    }

    /// The single user-visible form of automatic fallback: on an HTTP 4xx
    /// from the query server, revert to the manifest defaults and ask the
    /// caller to retry.
    async fn handle_query_4xx(
        &self,
        emitter: &SignalEmitter<'_>,
    ) -> fdo::Result<(BusCandidates, BusCandidates)> {
        let (default_variant, default_branch) = preferences::manifest_defaults(&self.manifest);

        let (current_variant, current_branch) = {
            let state = self.state();
            (state.variant.clone(), state.branch.clone())
        };

        if current_variant == default_variant && current_branch == default_branch {
            return Err(fdo::Error::Failed(
                "The server query returned HTTP 4xx. We are already following the default \
                 variant and branch, nothing else we can do..."
                    .to_string(),
            ));
        }

        warn!(
            "The server query returned HTTP 4xx. Reverting the variant and branch to the default values: {}, {}",
            default_variant, default_branch
        );

        self.switch_variant_internal(&default_variant, true, emitter)
            .await
            .map_err(|e| {
                fdo::Error::Failed(format!(
                    "An error occurred while switching to the default variant '{}': {}",
                    default_variant, e
                ))
            })?;
        self.switch_branch_internal(&default_branch, emitter)
            .await
            .map_err(|e| {
                fdo::Error::Failed(format!(
                    "An error occurred while switching to the default branch '{}': {}",
                    default_branch, e
                ))
            })?;

        Err(fdo::Error::Failed(format!(
            "The server query returned HTTP 4xx. The tracked variant and branch have been \
             reverted to the default values: '{}', '{}'",
            default_variant, default_branch
        )))
    }

    async fn signal_session(&self, signal: Signal) -> Result<()> {
        let helper_pid = self.state().session.helper_pid;
        spawn_blocking(move || process::signal_install_procs(helper_pid, signal))
            .await
            .map_err(|e| Error::HelperFailed {
                message: e.to_string(),
            })?
    }
}

#[interface(name = "com.steampowered.Atomupd1")]
impl Atomupd1 {
    /// Queries the update server for the candidates applicable to the
    /// tracked variant and branch, stores the listing, and returns it.
    async fn check_for_updates(
        &self,
        options: HashMap<String, OwnedValue>,
        #[zbus(header)] header: Header<'_>,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> fdo::Result<(BusCandidates, BusCandidates)> {
        self.authorize(&header, policy::ACTION_CHECK_FOR_UPDATES)
            .await?;
        let _writer = self.writer.lock().await;

        let mut penultimate = false;
        for (key, value) in &options {
            match key.as_str() {
                "penultimate" => {
                    penultimate = bool::try_from(value.clone())
                        .map_err(|_| Error::OptionType { key: key.clone() })?;
                }
                _ => return Err(Error::InvalidOption { key: key.clone() }.into()),
            }
        }

        let (variant, branch, http_proxy) = {
            let state = self.state();
            (
                state.variant.clone(),
                state.branch.clone(),
                http_proxy_string(&state.http_proxy),
            )
        };

        if !self.paths.remote_info.exists() {
            debug!("We don't have a remote info file, trying to download it again...");
            let paths = self.paths.clone();
            let manifest = self.manifest.clone();
            let download_variant = variant.clone();
            let download_proxy = http_proxy.clone();
            let downloaded = spawn_blocking(move || {
                remote_info::download_remote_info(
                    &paths,
                    &manifest,
                    &download_variant,
                    download_proxy.as_deref(),
                )
            })
            .await
            .map_err(|e| fdo::Error::Failed(e.to_string()))?;

            match downloaded {
                Ok(()) => {
                    let paths = self.paths.clone();
                    let manifest = self.manifest.clone();
                    let config = spawn_blocking(move || config::select_and_load(&paths, &manifest))
                        .await
                        .map_err(|e| fdo::Error::Failed(e.to_string()))?
                        .map_err(|e| {
                            fdo::Error::Failed(format!(
                                "An error occurred while reloading the configuration, please \
                                 fix your conf file and retry: {}",
                                e
                            ))
                        })?;
                    self.apply_config(config, &emitter).await?;
                }
                Err(e) => debug!("Failed to download the remote info: {}", e),
            }
        }

        let config = self.state().config.clone();
        let request = QueryRequest {
            variant,
            branch,
            penultimate,
            http_proxy,
        };

        let output = match candidates::run_query_helper(&config, &self.paths.manifest, &request).await
        {
            Ok(output) => output,
            Err(Error::QueryHttp4xx) => return self.handle_query_4xx(&emitter).await,
            Err(e) => {
                return Err(fdo::Error::Failed(format!(
                    "An error occurred calling the '{}' helper: {}",
                    ATOMUPD_CLIENT, e
                )))
            }
        };

        let updated_build_id = {
            let state = self.state();
            match state.session.status {
                UpdateStatus::Successful => state.session.build_id.clone(),
                _ => None,
            }
        };

        let listing = candidates::parse_candidates(&output, updated_build_id.as_deref())
            .map_err(|e| {
                fdo::Error::Failed(format!(
                    "An error occurred while parsing the helper output JSON: {}",
                    e
                ))
            })?;

        util::write_atomically(&self.paths.updates_json, output.as_bytes(), None).map_err(|e| {
            fdo::Error::Failed(format!(
                "An error occurred while storing the helper output JSON: {}",
                e
            ))
        })?;

        if let Some(replacement) = &listing.replacement_eol_variant {
            debug!(
                "Switching from the EOL variant {} to its replacement {}",
                self.state().variant,
                replacement
            );
            // The listing just computed under the old variant name is
            // deliberately retained.
            self.switch_variant_internal(replacement, false, &emitter)
                .await
                .map_err(|e| {
                    fdo::Error::Failed(format!(
                        "An error occurred while switching to the new variant '{}': {}",
                        replacement, e
                    ))
                })?;
        }

        {
            let mut state = self.state();
            state.available = listing.available.clone();
            state.available_later = listing.available_later.clone();
        }
        self.updates_available_changed(&emitter).await?;
        self.updates_available_later_changed(&emitter).await?;

        Ok((
            candidate_map_to_bus(&listing.available)?,
            candidate_map_to_bus(&listing.available_later)?,
        ))
    }

    /// Starts applying the given build. Requires a prior successful
    /// `CheckForUpdates`; the policy action is the downgrade one when the
    /// requested build is older than the running image.
    async fn start_update(
        &self,
        id: &str,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] connection: &Connection,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> fdo::Result<()> {
        let requested: BuildId = id
            .parse()
            .map_err(|e: atomupd_release::Error| fdo::Error::InvalidArgs(e.to_string()))?;

        let action = policy::start_update_action(&self.manifest.buildid, &requested);
        self.authorize(&header, action).await?;
        let _writer = self.writer.lock().await;

        {
            let state = self.state();
            if matches!(
                state.session.status,
                UpdateStatus::InProgress | UpdateStatus::Paused
            ) {
                return Err(Error::UpdateAlreadyInProgress.into());
            }
        }

        if !self.paths.updates_json.exists() {
            return Err(Error::NoPriorCheck.into());
        }

        let http_proxy = {
            let mut state = self.state();
            state.session.build_id = Some(id.to_string());

            match state.available.get(id).map(|info| info.version.clone()) {
                Some(version) => state.session.version = Some(version),
                None => {
                    warn!(
                        "The chosen buildid '{}' doesn't seem to be available, the update is expected to fail",
                        id
                    );
                    state.session.version = None;
                }
            }

            http_proxy_string(&state.http_proxy)
        };
        self.update_build_i_d_changed(&emitter).await?;
        self.update_version_changed(&emitter).await?;

        // The helper reads a private copy, so a concurrent CheckForUpdates
        // cannot replace the JSON out from under the running install.
        let snapshot = session::snapshot_updates_json(&self.paths.updates_json).map_err(|e| {
            fdo::Error::Failed(format!(
                "Failed to create a copy of the JSON update file: {}",
                e
            ))
        })?;

        let config_path = self.state().config.config_path.clone();
        let mut child = session::spawn_install_helper(
            &config_path,
            &snapshot,
            id,
            http_proxy.as_deref(),
        )
        .map_err(|e| {
            fdo::Error::Failed(format!("Failed to launch the \"{}\" helper: {}", ATOMUPD_CLIENT, e))
        })?;

        let helper_pid = child.id().map(|pid| pid as i32);

        let generation = {
            let mut state = self.state();
            state.session.generation += 1;
            state.session.snapshot = Some(snapshot);
            state.session.helper_pid = helper_pid;
            state.session.progress = 0.0;
            state.session.estimated_completion_time = 0;
            state.session.status = UpdateStatus::InProgress;
            state.session.set_failure(None, None);
            state.session.generation
        };

        let stdout = child.stdout.take();
        let watcher = tokio::spawn(watch_install(
            connection.clone(),
            self.state.clone(),
            child,
            stdout,
            generation,
        ));
        self.state().session.watcher = Some(watcher);

        self.progress_percentage_changed(&emitter).await?;
        self.estimated_completion_time_changed(&emitter).await?;
        self.update_status_changed(&emitter).await?;
        self.failure_code_changed(&emitter).await?;
        self.failure_message_changed(&emitter).await?;

        Ok(())
    }

    /// Reserved for applying an arbitrary image outside the published
    /// candidates; the server-side contract is not realised yet.
    async fn start_custom_update(
        &self,
        _options: HashMap<String, OwnedValue>,
    ) -> fdo::Result<()> {
        Err(fdo::Error::NotSupported(
            "StartCustomUpdate is not available yet".to_string(),
        ))
    }

    /// Pauses the in-progress update by stopping the install helper and the
    /// whole image-apply process group.
    async fn pause_update(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> fdo::Result<()> {
        self.authorize(&header, policy::ACTION_MANAGE_PENDING_UPDATE)
            .await?;
        let _writer = self.writer.lock().await;

        if self.state().session.status != UpdateStatus::InProgress {
            return Err(Error::NotInProgress.into());
        }

        self.signal_session(Signal::SIGSTOP).await.map_err(|e| {
            fdo::Error::Failed(format!(
                "An error occurred while attempting to pause the installation process: {}",
                e
            ))
        })?;

        self.state().session.status = UpdateStatus::Paused;
        self.update_status_changed(&emitter).await?;
        Ok(())
    }

    async fn resume_update(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> fdo::Result<()> {
        self.authorize(&header, policy::ACTION_MANAGE_PENDING_UPDATE)
            .await?;
        let _writer = self.writer.lock().await;

        if self.state().session.status != UpdateStatus::Paused {
            return Err(Error::NotPaused.into());
        }

        self.signal_session(Signal::SIGCONT).await.map_err(|e| {
            fdo::Error::Failed(format!(
                "An error occurred while attempting to resume the installation process: {}",
                e
            ))
        })?;

        self.state().session.status = UpdateStatus::InProgress;
        self.update_status_changed(&emitter).await?;
        Ok(())
    }

    /// Cancels the in-progress or paused update, terminating the install
    /// helper and then the image-apply process group, escalating to SIGKILL
    /// where needed.
    async fn cancel_update(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> fdo::Result<()> {
        self.authorize(&header, policy::ACTION_MANAGE_PENDING_UPDATE)
            .await?;
        let _writer = self.writer.lock().await;

        let helper_pid = {
            let mut state = self.state();
            if !matches!(
                state.session.status,
                UpdateStatus::InProgress | UpdateStatus::Paused
            ) {
                return Err(Error::NothingToCancel.into());
            }

            // Detach the child watch first, so the exit caused by our
            // SIGTERM doesn't flip the session to Failed.
            state.session.generation += 1;
            if let Some(watcher) = state.session.watcher.take() {
                watcher.abort();
            }
            state.session.helper_pid.take()
        };

        let cancelled = spawn_blocking(move || -> Result<()> {
            // The install helper goes first: killing RAUC while the helper
            // still runs could let the helper execute RAUC again before the
            // termination signal reaches it.
            if let Some(pid) = helper_pid {
                process::ensure_pid_is_killed(pid);
            }

            // A RAUC operation can't be cancelled through its D-Bus API, so
            // act on its PID instead.
            let rauc_pid = process::rauc_service_pid()?;
            process::ensure_pid_is_killed(rauc_pid);
            Ok(())
        })
        .await
        .map_err(|e| fdo::Error::Failed(e.to_string()))?;

        match cancelled {
            Ok(()) => {
                self.state().session.status = UpdateStatus::Cancelled;
                self.update_status_changed(&emitter).await?;
                Ok(())
            }
            // The update may well still be running, but we can't know.
            Err(e) => Err(fdo::Error::Failed(format!(
                "Failed to cancel an update: {}",
                e
            ))),
        }
    }

    /// Switches the tracked variant, persisting the choice and clearing the
    /// candidate listing. No automatic re-query is performed.
    async fn switch_to_variant(
        &self,
        variant: &str,
        #[zbus(header)] header: Header<'_>,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> fdo::Result<()> {
        self.authorize(&header, policy::ACTION_SWITCH_VARIANT_OR_BRANCH)
            .await?;
        let _writer = self.writer.lock().await;

        self.switch_variant_internal(variant, true, &emitter)
            .await
            .map_err(|e| {
                fdo::Error::Failed(format!(
                    "An error occurred while switching to the chosen variant: {}",
                    e
                ))
            })
    }

    async fn switch_to_branch(
        &self,
        branch: &str,
        #[zbus(header)] header: Header<'_>,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> fdo::Result<()> {
        self.authorize(&header, policy::ACTION_SWITCH_VARIANT_OR_BRANCH)
            .await?;
        let _writer = self.writer.lock().await;

        self.switch_branch_internal(branch, &emitter)
            .await
            .map_err(|e| {
                fdo::Error::Failed(format!(
                    "An error occurred while switching to the chosen branch: {}",
                    e
                ))
            })
    }

    /// Re-runs the configuration resolution, refreshing the remote-info
    /// file first. The candidate listing is cleared either way.
    async fn reload_configuration(
        &self,
        _options: HashMap<String, OwnedValue>,
        #[zbus(header)] header: Header<'_>,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> fdo::Result<()> {
        self.authorize(&header, policy::ACTION_RELOAD_CONFIGURATION)
            .await?;
        let _writer = self.writer.lock().await;

        {
            let mut state = self.state();
            state.available.clear();
            state.available_later.clear();
        }
        self.updates_available_changed(&emitter).await?;
        self.updates_available_later_changed(&emitter).await?;

        let (variant, http_proxy) = {
            let state = self.state();
            (state.variant.clone(), http_proxy_string(&state.http_proxy))
        };
        let paths = self.paths.clone();
        let manifest = self.manifest.clone();
        let refreshed = spawn_blocking(move || {
            if let Err(e) =
                remote_info::download_remote_info(&paths, &manifest, &variant, http_proxy.as_deref())
            {
                debug!("Failed to download the remote info: {}", e);
            }
            config::select_and_load(&paths, &manifest)
        })
        .await
        .map_err(|e| fdo::Error::Failed(e.to_string()))?;

        let config = refreshed.map_err(|e| {
            fdo::Error::Failed(format!(
                "An error occurred while reloading the configuration, please fix your conf \
                 file and retry: {}",
                e
            ))
        })?;
        self.apply_config(config, &emitter).await?;

        Ok(())
    }

    /// Routes the helpers through an HTTP proxy, persisted in the user
    /// preferences.
    async fn enable_http_proxy(
        &self,
        address: &str,
        port: i32,
        _options: HashMap<String, OwnedValue>,
        #[zbus(header)] header: Header<'_>,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> fdo::Result<()> {
        self.authorize(&header, policy::ACTION_MANAGE_HTTP_PROXY)
            .await?;
        let _writer = self.writer.lock().await;

        let http_proxy = if address.is_empty() {
            None
        } else {
            Some((address.to_string(), port))
        };

        let preferences = {
            let state = self.state();
            UserPreferences {
                variant: state.variant.clone(),
                branch: state.branch.clone(),
                http_proxy: http_proxy.clone(),
            }
        };
        preferences.store(&self.paths.preferences).map_err(|e| {
            fdo::Error::Failed(format!(
                "An error occurred while enabling the HTTP proxy: {}",
                e
            ))
        })?;

        self.state().http_proxy = http_proxy;
        self.http_proxy_changed(&emitter).await?;
        Ok(())
    }

    async fn disable_http_proxy(
        &self,
        #[zbus(header)] header: Header<'_>,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> fdo::Result<()> {
        self.authorize(&header, policy::ACTION_MANAGE_HTTP_PROXY)
            .await?;
        let _writer = self.writer.lock().await;

        let preferences = {
            let state = self.state();
            UserPreferences {
                variant: state.variant.clone(),
                branch: state.branch.clone(),
                http_proxy: None,
            }
        };
        preferences.store(&self.paths.preferences).map_err(|e| {
            fdo::Error::Failed(format!(
                "An error occurred while disabling the HTTP proxy: {}",
                e
            ))
        })?;

        self.state().http_proxy = None;
        self.http_proxy_changed(&emitter).await?;
        Ok(())
    }

    #[zbus(property)]
    fn version(&self) -> u32 {
        ATOMUPD_VERSION
    }

    #[zbus(property)]
    fn variant(&self) -> String {
        self.state().variant.clone()
    }

    #[zbus(property)]
    fn branch(&self) -> String {
        self.state().branch.clone()
    }

    #[zbus(property)]
    fn known_variants(&self) -> Vec<String> {
        self.state().config.known_variants.clone()
    }

    #[zbus(property)]
    fn known_branches(&self) -> Vec<String> {
        self.state().config.known_branches.clone()
    }

    #[zbus(property, name = "CurrentBuildID")]
    fn current_build_id(&self) -> String {
        self.manifest.buildid.to_string()
    }

    #[zbus(property)]
    fn current_version(&self) -> String {
        self.manifest.version.clone()
    }

    #[zbus(property, name = "UpdateBuildID")]
    fn update_build_id(&self) -> String {
        self.state().session.build_id.clone().unwrap_or_default()
    }

    #[zbus(property)]
    fn update_version(&self) -> String {
        self.state().session.version.clone().unwrap_or_default()
    }

    #[zbus(property)]
    fn update_status(&self) -> u32 {
        self.state().session.status.as_u32()
    }

    #[zbus(property)]
    fn progress_percentage(&self) -> f64 {
        self.state().session.progress
    }

    #[zbus(property)]
    fn estimated_completion_time(&self) -> u64 {
        self.state().session.estimated_completion_time
    }

    #[zbus(property)]
    fn failure_code(&self) -> String {
        self.state().session.failure_code.clone().unwrap_or_default()
    }

    #[zbus(property)]
    fn failure_message(&self) -> String {
        self.state()
            .session
            .failure_message
            .clone()
            .unwrap_or_default()
    }

    #[zbus(property)]
    fn updates_available(&self) -> fdo::Result<BusCandidates> {
        candidate_map_to_bus(&self.state().available)
    }

    #[zbus(property)]
    fn updates_available_later(&self) -> fdo::Result<BusCandidates> {
        candidate_map_to_bus(&self.state().available_later)
    }

    #[zbus(property)]
    fn http_proxy(&self) -> (String, i32) {
        self.state()
            .http_proxy
            .clone()
            .unwrap_or_else(|| (String::new(), 0))
    }
}

/// Follows one install attempt to completion: streams the helper stdout
/// into progress updates, then maps the exit status onto the terminal
/// session state. Holds only the session generation; a bumped generation
/// (cancel, or a newer attempt) makes every remaining event a no-op.
async fn watch_install(
    connection: Connection,
    state: Arc<Mutex<State>>,
    mut child: Child,
    stdout: Option<tokio::process::ChildStdout>,
    generation: u64,
) {
    fn lock_state(state: &Arc<Mutex<State>>) -> MutexGuard<'_, State> {
        state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    if let Some(stdout) = stdout {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    debug!("Unable to read the update progress: {}", e);
                    break;
                }
            };

            let tick = match progress::parse_tick(&line, Utc::now()) {
                Some(tick) => tick,
                None => continue,
            };

            {
                let mut state = lock_state(&state);
                if state.session.generation != generation {
                    return;
                }
                state.session.progress = tick.percentage;
                state.session.estimated_completion_time = tick
                    .completion_time
                    .map(|time| time.timestamp().max(0) as u64)
                    .unwrap_or(0);
            }
            emit_progress_changed(&connection).await;
        }
    }

    let wait_result = child.wait().await;

    {
        let mut state = lock_state(&state);
        if state.session.generation != generation {
            // Cancelled while we were waiting; the cancel path owns the
            // status from here.
            return;
        }

        match wait_result {
            Ok(status) if status.success() => {
                debug!("The update has been successfully applied");
                state.session.status = UpdateStatus::Successful;
                state.session.set_failure(None, None);
            }
            Ok(status) => {
                let message = format!("'{}' helper failed: {}", ATOMUPD_CLIENT, status);
                debug!("{}", message);
                state.session.status = UpdateStatus::Failed;
                state
                    .session
                    .set_failure(Some("org.freedesktop.DBus.Error"), Some(&message));
            }
            Err(e) => {
                let message = format!("Unable to wait for the '{}' helper: {}", ATOMUPD_CLIENT, e);
                debug!("{}", message);
                state.session.status = UpdateStatus::Failed;
                state
                    .session
                    .set_failure(Some("org.freedesktop.DBus.Error"), Some(&message));
            }
        }

        state.session.helper_pid = None;
        state.session.watcher = None;
    }

    emit_session_status_changed(&connection).await;
}

async fn emit_progress_changed(connection: &Connection) {
    let iface = match connection
        .object_server()
        .interface::<_, Atomupd1>(ATOMUPD1_PATH)
        .await
    {
        Ok(iface) => iface,
        Err(_) => return,
    };
    let me = iface.get().await;
    let _ = me.progress_percentage_changed(iface.signal_emitter()).await;
    let _ = me
        .estimated_completion_time_changed(iface.signal_emitter())
        .await;
}

async fn emit_session_status_changed(connection: &Connection) {
    let iface = match connection
        .object_server()
        .interface::<_, Atomupd1>(ATOMUPD1_PATH)
        .await
    {
        Ok(iface) => iface,
        Err(_) => return,
    };
    let me = iface.get().await;
    let _ = me.update_status_changed(iface.signal_emitter()).await;
    let _ = me.failure_code_changed(iface.signal_emitter()).await;
    let _ = me.failure_message_changed(iface.signal_emitter()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidates::CandidateInfo;
    use std::collections::BTreeMap;

    #[test]
    fn tracked_pair_is_always_known() {
        let config = EffectiveConfig {
            config_path: "/etc/steamos-atomupd/client.conf".into(),
            images_url: "https://images.example.com".to_string(),
            meta_url: "https://meta.example.com".to_string(),
            urls: BTreeMap::new(),
            known_variants: vec!["steamdeck".to_string()],
            known_branches: vec!["stable".to_string()],
            auth: None,
        };
        let mut state = State {
            config,
            variant: "vanilla".to_string(),
            branch: "rc".to_string(),
            http_proxy: None,
            available: CandidateMap::new(),
            available_later: CandidateMap::new(),
            session: SessionState::default(),
        };

        assert!(ensure_tracked_in_known(&mut state));
        assert!(state.config.known_variants.contains(&"vanilla".to_string()));
        assert!(state.config.known_branches.contains(&"rc".to_string()));

        // Nothing left to append the second time around.
        assert!(!ensure_tracked_in_known(&mut state));
    }

    #[test]
    fn proxy_string_formatting() {
        assert_eq!(
            http_proxy_string(&Some(("proxy.lan".to_string(), 3128))).as_deref(),
            Some("proxy.lan:3128")
        );
        assert_eq!(http_proxy_string(&Some((String::new(), 8080))), None);
        assert_eq!(http_proxy_string(&None), None);
    }

    #[test]
    fn candidate_bus_shape() {
        let mut map = CandidateMap::new();
        map.insert(
            "20220227.3".to_string(),
            CandidateInfo {
                version: "snapshot".to_string(),
                variant: "steamdeck".to_string(),
                estimated_size: 70910463,
                requires: Some("20220101.1".to_string()),
            },
        );

        let bus_map = candidate_map_to_bus(&map).unwrap();
        let entry = &bus_map["20220227.3"];
        assert_eq!(
            String::try_from(entry["version"].clone()).unwrap(),
            "snapshot"
        );
        assert_eq!(u64::try_from(entry["estimated_size"].clone()).unwrap(), 70910463);
        assert_eq!(
            String::try_from(entry["requires"].clone()).unwrap(),
            "20220101.1"
        );

        let mut no_requires = CandidateMap::new();
        no_requires.insert(
            "20220227.3".to_string(),
            CandidateInfo {
                version: "snapshot".to_string(),
                variant: "steamdeck".to_string(),
                estimated_size: 0,
                requires: None,
            },
        );
        let bus_map = candidate_map_to_bus(&no_requires).unwrap();
        assert!(!bus_map["20220227.3"].contains_key("requires"));
    }
}
