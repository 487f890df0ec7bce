//! Client-side view of the `com.steampowered.Atomupd1` interface.

use std::collections::HashMap;
use zbus::proxy;
use zbus::zvariant::{OwnedValue, Value};

/// The update maps returned by `CheckForUpdates` (`a{sa{sv}}`).
pub type Candidates = HashMap<String, HashMap<String, OwnedValue>>;

#[proxy(
    interface = "com.steampowered.Atomupd1",
    default_service = "com.steampowered.Atomupd1",
    default_path = "/com/steampowered/Atomupd1",
    gen_blocking = false
)]
pub trait Atomupd1 {
    fn check_for_updates(
        &self,
        options: HashMap<&str, Value<'_>>,
    ) -> zbus::Result<(Candidates, Candidates)>;

    fn start_update(&self, id: &str) -> zbus::Result<()>;

    fn start_custom_update(&self, options: HashMap<&str, Value<'_>>) -> zbus::Result<()>;

    fn cancel_update(&self) -> zbus::Result<()>;

    fn switch_to_variant(&self, variant: &str) -> zbus::Result<()>;

    fn switch_to_branch(&self, branch: &str) -> zbus::Result<()>;

    #[zbus(property)]
    fn variant(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn branch(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn known_variants(&self) -> zbus::Result<Vec<String>>;

    #[zbus(property)]
    fn known_branches(&self) -> zbus::Result<Vec<String>>;

    #[zbus(property)]
    fn update_status(&self) -> zbus::Result<u32>;

    #[zbus(property, name = "UpdateBuildID")]
    fn update_build_id(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn update_version(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn progress_percentage(&self) -> zbus::Result<f64>;

    #[zbus(property)]
    fn estimated_completion_time(&self) -> zbus::Result<u64>;

    #[zbus(property)]
    fn failure_code(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn failure_message(&self) -> zbus::Result<String>;
}
