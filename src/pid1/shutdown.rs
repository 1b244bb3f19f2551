//! Final shutdown for PID 1, entered after service rollback has completed.
//!
//! At this point every supervised service is stopped; anything still running
//! is an orphan or a process we never managed. Those are terminated with an
//! escalating sweep, filesystem buffers are flushed and writable filesystems
//! taken down, and finally the kernel is asked for the requested transition.

use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

use nix::mount::{mount, umount, MsFlags};
use nix::sys::reboot::{reboot, RebootMode};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{sync, Pid};

use crate::protocol::ShutdownType;

/// How long stragglers get to react to SIGTERM before SIGKILL, in polls.
const TERM_POLL_INTERVAL: Duration = Duration::from_millis(250);
const TERM_GRACE_POLLS: u32 = 20;

/// Take the system down. Never returns.
pub fn shutdown(kind: ShutdownType) -> ! {
    sweep_processes();

    log::info!("flushing filesystem buffers");
    sync();
    detach_filesystems();

    log::info!("requesting {:?} from the kernel", kind);
    let mode = match kind {
        ShutdownType::Halt => RebootMode::RB_HALT_SYSTEM,
        ShutdownType::Poweroff => RebootMode::RB_POWER_OFF,
        ShutdownType::Reboot => RebootMode::RB_AUTOBOOT,
    };
    if let Err(e) = reboot(mode) {
        log::error!("reboot(2) failed: {}", e);
    }

    // PID 1 must never return; park until the machine is reset by hand.
    loop {
        unsafe {
            libc::pause();
        }
    }
}

/// Terminate whatever outlived the rollback. As PID 1 every orphan reparents
/// to us, so progress is observable: reap between polls and stop as soon as
/// `kill(-1, 0)` finds no remaining target.
fn sweep_processes() {
    if kill(Pid::from_raw(-1), Signal::SIGTERM).is_err() {
        // ESRCH: nothing out there but us.
        return;
    }
    log::info!("terminating remaining processes");

    for _ in 0..TERM_GRACE_POLLS {
        thread::sleep(TERM_POLL_INTERVAL);
        reap_stragglers();
        if kill(Pid::from_raw(-1), None).is_err() {
            return;
        }
    }

    log::warn!("some processes ignored SIGTERM; sending SIGKILL");
    let _ = kill(Pid::from_raw(-1), Signal::SIGKILL);
    thread::sleep(TERM_POLL_INTERVAL);
    reap_stragglers();
}

fn reap_stragglers() {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

/// Filesystem types with no backing store; there is nothing of theirs to
/// flush or detach.
const NO_BACKING_STORE: &[&str] = &[
    "proc",
    "sysfs",
    "devtmpfs",
    "devpts",
    "tmpfs",
    "cgroup",
    "cgroup2",
    "securityfs",
    "debugfs",
    "ramfs",
    "mqueue",
    "bpf",
];

/// Take down writable filesystems before the kernel transition. Mounts are
/// detached newest-first; a mount that cannot be detached (and the root
/// filesystem, which never can be while we run from it) is remounted
/// read-only instead.
fn detach_filesystems() {
    let table = match fs::read_to_string("/proc/self/mounts") {
        Ok(table) => table,
        Err(e) => {
            log::error!("cannot read mount table: {}", e);
            return;
        }
    };

    let mounts: Vec<(&str, &str)> = table
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _source = fields.next()?;
            let target = fields.next()?;
            let fstype = fields.next()?;
            (!NO_BACKING_STORE.contains(&fstype)).then_some((target, fstype))
        })
        .collect();

    // The mount table is in mount order.
    for &(target, fstype) in mounts.iter().rev() {
        if target == "/" {
            match remount_read_only(Path::new("/")) {
                Ok(()) => log::info!("root filesystem remounted read-only"),
                Err(e) => log::warn!("cannot remount root read-only: {}", e),
            }
            continue;
        }
        match umount(Path::new(target)) {
            Ok(()) => log::debug!("detached {} ({})", target, fstype),
            Err(e) => {
                // Something still holds it open; read-only limits the damage.
                log::warn!("cannot detach {}: {}", target, e);
                let _ = remount_read_only(Path::new(target));
            }
        }
    }
}

fn remount_read_only(target: &Path) -> nix::Result<()> {
    mount(
        None::<&str>,
        target,
        None::<&str>,
        MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
        None::<&str>,
    )
}
