//! Final halt/poweroff/reboot
//!
//! The supervisor drives all services to HALTED before calling in here;
//! this module only deals with what is left of the machine:
//! 1. SIGTERM to all remaining processes, short grace, then SIGKILL
//! 2. Sync filesystems
//! 3. Unmount everything unmountable, in reverse order
//! 4. reboot(2) with the requested mode

use nix::sys::reboot::{reboot, RebootMode};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{sync, Pid};
use std::fs;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

/// Requested way down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltKind {
    /// Stop, don't power off
    Halt,
    Poweroff,
    Reboot,
}

impl HaltKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Halt => "halt",
            Self::Poweroff => "poweroff",
            Self::Reboot => "reboot",
        }
    }

    fn to_reboot_mode(self) -> RebootMode {
        match self {
            Self::Halt => RebootMode::RB_HALT_SYSTEM,
            Self::Poweroff => RebootMode::RB_POWER_OFF,
            Self::Reboot => RebootMode::RB_AUTOBOOT,
        }
    }
}

/// Execute the final shutdown sequence.  Never returns.
pub fn finalize(kind: HaltKind) -> ! {
    log::info!("Initiating {} sequence", kind.as_str());

    terminate_stragglers();

    log::info!("Syncing filesystems");
    sync();

    unmount_filesystems();
    sync();

    log::info!("Executing {}", kind.as_str());
    if let Err(e) = reboot(kind.to_reboot_mode()) {
        log::error!("reboot() failed: {}", e);
    }

    // reboot(2) failed; as PID 1 we cannot exit
    loop {
        sleep(Duration::from_secs(1));
    }
}

/// SIGTERM then SIGKILL to every process still alive
fn terminate_stragglers() {
    log::info!("Sending SIGTERM to all processes");
    let _ = kill(Pid::from_raw(-1), Signal::SIGTERM);
    sleep(Duration::from_secs(2));

    log::info!("Sending SIGKILL to remaining processes");
    let _ = kill(Pid::from_raw(-1), Signal::SIGKILL);
    sleep(Duration::from_millis(100));
}

/// Unmount everything except the virtual and root filesystems
fn unmount_filesystems() {
    log::info!("Unmounting filesystems");

    let mounts = match fs::read_to_string("/proc/mounts") {
        Ok(m) => m,
        Err(e) => {
            log::error!("Cannot read /proc/mounts: {}", e);
            return;
        }
    };

    let mut mount_points: Vec<&str> = mounts
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .collect();
    mount_points.reverse();

    let skip = ["/", "/proc", "/sys", "/dev", "/run"];
    for mount_point in mount_points {
        if skip.contains(&mount_point) {
            continue;
        }

        let path = Path::new(mount_point);
        log::debug!("Unmounting {}", mount_point);
        if let Err(e) = nix::mount::umount(path) {
            log::debug!("Unmount of {} failed: {}, trying lazy", mount_point, e);
            if let Err(e) = nix::mount::umount2(path, nix::mount::MntFlags::MNT_DETACH) {
                log::warn!("Failed to unmount {}: {}", mount_point, e);
            }
        }
    }
}
