//! Base filesystem mounting
//!
//! Mounts the virtual filesystems an init needs before anything else can
//! run.  The condition store lives on the /run tmpfs, so conditions only
//! become usable after this module has done its work.

use nix::mount::{mount, MsFlags};
use std::fs;
use std::io::Write;
use std::path::Path;

/// Write to the kernel log; survives better than anything else this
/// early in boot.
fn kmsg(msg: &str) {
    if let Ok(mut f) = fs::OpenOptions::new().write(true).open("/dev/kmsg") {
        let _ = writeln!(f, "servd: {}", msg);
    }
    eprintln!("servd: {}", msg);
}

struct MountPoint {
    source: &'static str,
    target: &'static str,
    fstype: &'static str,
    flags: MsFlags,
    data: Option<&'static str>,
}

const BASE_MOUNTS: &[MountPoint] = &[
    MountPoint {
        source: "proc",
        target: "/proc",
        fstype: "proc",
        flags: MsFlags::MS_NOSUID
            .union(MsFlags::MS_NODEV)
            .union(MsFlags::MS_NOEXEC),
        data: None,
    },
    MountPoint {
        source: "sysfs",
        target: "/sys",
        fstype: "sysfs",
        flags: MsFlags::MS_NOSUID
            .union(MsFlags::MS_NODEV)
            .union(MsFlags::MS_NOEXEC),
        data: None,
    },
    MountPoint {
        source: "devtmpfs",
        target: "/dev",
        fstype: "devtmpfs",
        flags: MsFlags::MS_NOSUID,
        data: Some("mode=0755"),
    },
    MountPoint {
        source: "devpts",
        target: "/dev/pts",
        fstype: "devpts",
        flags: MsFlags::MS_NOSUID.union(MsFlags::MS_NOEXEC),
        data: Some("gid=5,mode=0620,ptmxmode=0666"),
    },
    MountPoint {
        source: "tmpfs",
        target: "/run",
        fstype: "tmpfs",
        flags: MsFlags::MS_NOSUID.union(MsFlags::MS_NODEV),
        data: Some("mode=0755"),
    },
];

/// Mount the base filesystems
pub fn mount_base_filesystems() -> Result<(), MountError> {
    kmsg("Mounting base filesystems ...");

    for mp in BASE_MOUNTS {
        mount_one(mp)?;
    }

    // Runtime directories for conditions and pidfiles
    for dir in ["/run/servd", "/run/servd/cond"] {
        if let Err(e) = fs::create_dir_all(dir) {
            return Err(MountError::CreateDir {
                path: dir.to_string(),
                source: e,
            });
        }
    }

    kmsg("Base filesystems mounted");
    Ok(())
}

fn mount_one(mp: &MountPoint) -> Result<(), MountError> {
    let target = Path::new(mp.target);

    if is_mountpoint(target) {
        log::debug!("{} already mounted", mp.target);
        return Ok(());
    }

    if !target.exists() {
        fs::create_dir_all(target).map_err(|e| MountError::CreateDir {
            path: mp.target.to_string(),
            source: e,
        })?;
    }

    mount(Some(mp.source), target, Some(mp.fstype), mp.flags, mp.data).map_err(|e| {
        kmsg(&format!(
            "FAILED to mount {} on {}: {}",
            mp.fstype, mp.target, e
        ));
        MountError::Mount {
            target: mp.target.to_string(),
            fstype: mp.fstype.to_string(),
            source: e,
        }
    })?;

    kmsg(&format!("Mounted {} on {}", mp.fstype, mp.target));
    Ok(())
}

fn is_mountpoint(path: &Path) -> bool {
    if let Ok(mounts) = fs::read_to_string("/proc/mounts") {
        let path_str = path.to_string_lossy();
        return mounts.lines().any(|line| {
            let mut parts = line.split_whitespace();
            parts.next().is_some() && parts.next() == Some(path_str.as_ref())
        });
    }

    // No /proc yet: compare device ids with the parent
    use std::os::unix::fs::MetadataExt;
    let Some(parent) = path.parent().filter(|p| p.exists()) else {
        return false;
    };
    match (fs::metadata(path), fs::metadata(parent)) {
        (Ok(target_meta), Ok(parent_meta)) => target_meta.dev() != parent_meta.dev(),
        _ => false,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MountError {
    #[error("Failed to create directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to mount {fstype} on {target}: {source}")]
    Mount {
        target: String,
        fstype: String,
        #[source]
        source: nix::Error,
    },
}
