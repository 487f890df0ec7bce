//! Control over the install helper and the RAUC service processes. The RAUC
//! service is not our child, so everything here works with plain PIDs: a
//! `waitpid` probe where possible, an existence check where not, and an
//! escalate-on-timeout termination policy.

use crate::error::{self, Error, Result};
use log::debug;
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{getpgid, Pid};
use snafu::ResultExt;
use std::process::Command;
use std::thread;
use std::time::Duration;

/// Returns the RAUC service MainPID, or 0 when the service isn't running.
///
/// At the moment a RAUC operation can't be cancelled or paused through its
/// D-Bus API, so the daemon acts on its PID directly.
pub fn rauc_service_pid() -> Result<i32> {
    let output = Command::new("systemctl")
        .args(["show", "--property", "MainPID", "rauc"])
        .output()
        .context(error::SystemctlRunSnafu)?;

    if !output.status.success() {
        return error::RaucPidSnafu {
            reason: format!("systemctl exited with {}", output.status),
        }
        .fail();
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let value = match stdout.trim_end().strip_prefix("MainPID=") {
        Some(value) => value,
        None => {
            debug!(
                "Systemctl output is '{}' instead of the expected 'MainPID=X'",
                stdout
            );
            return error::RaucPidSnafu {
                reason: "unexpected systemctl output",
            }
            .fail();
        }
    };

    value.parse().map_err(|_| {
        debug!("Unable to parse Systemctl output: {}", stdout);
        Error::RaucPid {
            reason: "unexpected systemctl output".to_string(),
        }
    })
}

/// Looks up a process by name. Errors when there is no such process.
pub fn process_pid(process: &str) -> Result<i32> {
    let output = Command::new("pidof")
        .args(["--single-shot", "-x", process])
        .output()
        .context(error::PidofRunSnafu)?;

    if output.status.code() == Some(1) {
        return error::NoSuchProcessSnafu { process }.fail();
    }
    if !output.status.success() {
        return error::PidParseSnafu { process }.fail();
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout.trim().parse().map_err(|_| {
        debug!("Unable to parse pidof output: {}", stdout);
        Error::PidParse {
            process: process.to_string(),
        }
    })
}

/// Terminates a process, escalating if it doesn't comply. SIGTERM first,
/// then up to 2 seconds of polling (resuming a stopped process group so the
/// signal can be delivered), and finally SIGKILL.
///
/// The PID is not necessarily one of our children: `waitpid` failing with
/// ECHILD downgrades to an existence probe. Killing the RAUC service this
/// way is safe, it handles the termination gracefully and is started again
/// by the next update attempt.
pub fn ensure_pid_is_killed(pid: i32) {
    if pid < 1 {
        return;
    }

    let pid = Pid::from_raw(pid);
    let pgid = getpgid(Some(pid)).unwrap_or(pid);

    debug!("Sending SIGTERM to PID {}", pid);

    if kill(pid, Signal::SIGTERM).is_ok() {
        // The PIDs we are trying to stop usually do it in less than a
        // second. We wait up to 2s before escalating to SIGKILL.
        for _ in 0..4 {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED)) {
                Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => {
                    debug!("PID {} terminated successfully", pid);
                    return;
                }
                Ok(WaitStatus::Stopped(..)) => {
                    debug!(
                        "PID {} is currently paused, sending SIGCONT to the group {}",
                        pid, pgid
                    );
                    let _ = killpg(pgid, Signal::SIGCONT);
                }
                Ok(_) => {}
                Err(Errno::ESRCH) => {
                    debug!("PID {} terminated successfully", pid);
                    return;
                }
                Err(Errno::ECHILD) => {
                    // Not our child, fall back to an existence probe.
                    if kill(pid, None).is_err() {
                        debug!("PID {} terminated successfully", pid);
                        return;
                    }

                    // We can't see WIFSTOPPED for a non-child, so send a
                    // SIGCONT regardless of the state of the process.
                    debug!(
                        "Sending SIGCONT to the group {} to ensure that the PIDs are not paused",
                        pgid
                    );
                    let _ = killpg(pgid, Signal::SIGCONT);
                }
                Err(_) => {}
            }

            debug!("PID {} is still running", pid);
            thread::sleep(Duration::from_millis(500));
        }
    }

    debug!("Sending SIGKILL to PID {}", pid);
    let _ = kill(pid, Signal::SIGKILL);
    let _ = waitpid(pid, None);
}

/// Sends `signal` to the install helper PID and to the whole RAUC service
/// process group, to also reach an eventual chunk-fetching desync child.
pub fn signal_install_procs(helper_pid: Option<i32>, signal: Signal) -> Result<()> {
    let helper_pid = helper_pid.ok_or(Error::NoHelperPid)?;

    debug!(
        "Sending signal {} to the install helper with PID {}",
        signal.as_str(),
        helper_pid
    );
    kill(Pid::from_raw(helper_pid), signal).context(error::SendSignalSnafu {
        signal: signal.as_str(),
        pid: helper_pid,
    })?;

    let rauc_pid = rauc_service_pid()?;
    if rauc_pid > 0 {
        let pgid = getpgid(Some(Pid::from_raw(rauc_pid))).context(error::SendSignalSnafu {
            signal: signal.as_str(),
            pid: rauc_pid,
        })?;
        debug!(
            "Sending signal {} to the RAUC service PGID {}",
            signal.as_str(),
            pgid
        );
        killpg(pgid, signal).context(error::SendSignalSnafu {
            signal: signal.as_str(),
            pid: pgid.as_raw(),
        })?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn kill_terminates_a_child() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id() as i32;

        let start = Instant::now();
        ensure_pid_is_killed(pid);
        assert!(start.elapsed() < Duration::from_secs(4));

        // Gone for real: the signal 0 probe no longer finds it.
        assert_eq!(
            kill(Pid::from_raw(pid), None),
            Err(Errno::ESRCH),
            "PID {} should be gone",
            pid
        );
    }

    #[test]
    fn kill_resumes_a_stopped_child() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id() as i32;
        kill(Pid::from_raw(pid), Signal::SIGSTOP).unwrap();

        let start = Instant::now();
        ensure_pid_is_killed(pid);
        assert!(start.elapsed() < Duration::from_secs(4));
        assert_eq!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH));
    }

    #[test]
    fn kill_tolerates_a_dead_pid() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id() as i32;
        child.wait().unwrap();

        // Already reaped by the wait above; this must not hang or panic.
        ensure_pid_is_killed(pid);
    }
}
