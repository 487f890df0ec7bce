//! Authorisation of the bus methods through polkit. Every method names one
//! action identifier; the upgrade/downgrade split for `StartUpdate` is
//! computed in one place from the build ID comparison.

use atomupd_release::BuildId;
use std::collections::HashMap;
use zbus::zvariant::Value;
use zbus::{fdo, proxy};

pub const ACTION_CHECK_FOR_UPDATES: &str = "com.steampowered.atomupd1.check-for-updates";
pub const ACTION_START_UPGRADE: &str = "com.steampowered.atomupd1.start-upgrade";
pub const ACTION_START_DOWNGRADE: &str = "com.steampowered.atomupd1.start-downgrade";
pub const ACTION_MANAGE_PENDING_UPDATE: &str = "com.steampowered.atomupd1.manage-pending-update";
pub const ACTION_SWITCH_VARIANT_OR_BRANCH: &str =
    "com.steampowered.atomupd1.switch-variant-or-branch";
pub const ACTION_RELOAD_CONFIGURATION: &str = "com.steampowered.atomupd1.reload-configuration";
pub const ACTION_MANAGE_HTTP_PROXY: &str = "com.steampowered.atomupd1.manage-http-proxy";

/// PolkitCheckAuthorizationFlags.ALLOW_USER_INTERACTION
const ALLOW_USER_INTERACTION: u32 = 1;

#[proxy(
    interface = "org.freedesktop.PolicyKit1.Authority",
    default_service = "org.freedesktop.PolicyKit1",
    default_path = "/org/freedesktop/PolicyKit1/Authority",
    gen_blocking = false
)]
pub trait Authority {
    #[allow(clippy::type_complexity)]
    fn check_authorization(
        &self,
        subject: &(&str, HashMap<&str, Value<'_>>),
        action_id: &str,
        details: &HashMap<&str, &str>,
        flags: u32,
        cancellation_id: &str,
    ) -> zbus::Result<(bool, bool, HashMap<String, String>)>;
}

/// Picks the action identifier `StartUpdate` must be authorised for:
/// requesting anything older than the running image is a downgrade.
pub fn start_update_action(current: &BuildId, requested: &BuildId) -> &'static str {
    if requested < current {
        ACTION_START_DOWNGRADE
    } else {
        ACTION_START_UPGRADE
    }
}

/// Asks polkit whether `sender` may perform `action_id`, allowing
/// interactive authentication when the caller set the corresponding message
/// flag. Refusals and engine failures are both access-denied errors; no
/// state may change after either.
pub async fn check_authorization(
    authority: &AuthorityProxy<'_>,
    sender: &str,
    action_id: &str,
    allow_interaction: bool,
) -> fdo::Result<()> {
    let mut subject_details = HashMap::new();
    subject_details.insert("name", Value::from(sender));

    let flags = if allow_interaction {
        ALLOW_USER_INTERACTION
    } else {
        0
    };

    let (is_authorized, _is_challenge, _details) = authority
        .check_authorization(
            &("system-bus-name", subject_details),
            action_id,
            &HashMap::new(),
            flags,
            "",
        )
        .await
        .map_err(|e| {
            fdo::Error::AccessDenied(format!(
                "An error occurred while checking for authorizations: {}",
                e
            ))
        })?;

    if !is_authorized {
        return Err(fdo::Error::AccessDenied(
            "User is not allowed to execute this method".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downgrade_classification() {
        let current: BuildId = "20220101.1".parse().unwrap();

        let older: BuildId = "20211225.1".parse().unwrap();
        assert_eq!(start_update_action(&current, &older), ACTION_START_DOWNGRADE);

        let newer: BuildId = "20220227.3".parse().unwrap();
        assert_eq!(start_update_action(&current, &newer), ACTION_START_UPGRADE);

        // Re-installing the running build counts as an upgrade.
        let same: BuildId = "20220101.1".parse().unwrap();
        assert_eq!(start_update_action(&current, &same), ACTION_START_UPGRADE);

        // The increment alone decides when the dates match.
        let lower_increment: BuildId = "20220101.0".parse().unwrap();
        assert_eq!(
            start_update_action(&current, &lower_increment),
            ACTION_START_DOWNGRADE
        );
    }
}
