// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Port-sharing arbitration.
//!
//! Three mechanisms are layered: UUCP-style `LCK..<basename>` PID files in
//! a lock directory, advisory whole-file `fcntl` locks on the device node,
//! and the driver's exclusive-use ioctl. A [`SharingMode`] decides which
//! are taken at open and how conflicts are treated; release happens in
//! reverse order at close, and a failure to release one resource never
//! stops the others.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::tty::SerialDevice;
use crate::{Error, Result};

/// Default UUCP lock directory.
pub const DEFAULT_LOCK_DIR: &str = "/var/lock";

/// How an open cooperates with other users of the same port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SharingMode {
    /// Take no locks and honor none.
    Oblivious,
    /// Honor existing locks, refuse on conflict, hold a shared advisory
    /// lock and a lockfile while open.
    #[default]
    Polite,
    /// Refuse on conflict, hold every mechanism exclusively.
    Exclusive,
    /// Evict the present holder (best effort) and take everything
    /// exclusively; steps that still fail are skipped, not fatal.
    Stomp,
}

impl FromStr for SharingMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "oblivious" => Ok(SharingMode::Oblivious),
            "polite" => Ok(SharingMode::Polite),
            "exclusive" => Ok(SharingMode::Exclusive),
            "stomp" => Ok(SharingMode::Stomp),
            other => Err(Error::Config(format!("unknown sharing mode {other:?}"))),
        }
    }
}

impl std::fmt::Display for SharingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SharingMode::Oblivious => "oblivious",
            SharingMode::Polite => "polite",
            SharingMode::Exclusive => "exclusive",
            SharingMode::Stomp => "stomp",
        })
    }
}

impl SharingMode {
    /// Whether open asserts the exclusive-use ioctl, and whether its
    /// failure aborts the open.
    pub(crate) fn exclusive_ioctl(self) -> IoctlPolicy {
        match self {
            SharingMode::Oblivious | SharingMode::Polite => IoctlPolicy::Skip,
            SharingMode::Exclusive => IoctlPolicy::Required,
            SharingMode::Stomp => IoctlPolicy::BestEffort,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IoctlPolicy {
    Skip,
    Required,
    BestEffort,
}

/// The OS resources held for one open port.
///
/// Everything here is released exactly once, by [`LockSet::release`] on
/// the close path or by the rollback of a failed open.
#[derive(Debug, Default)]
pub struct LockSet {
    lockfile: Option<PathBuf>,
    advisory: Option<File>,
    /// Set once the exclusive-use ioctl succeeded on the opened handle;
    /// tells close to reverse it.
    pub(crate) exclusive_ioctl: bool,
}

impl LockSet {
    /// Runs the open-time protocol for `mode` against `device`. The
    /// exclusive-use ioctl is not taken here; it needs the opened handle
    /// and is asserted by the connection per [`SharingMode::exclusive_ioctl`].
    pub fn acquire(device: &Path, mode: SharingMode, lock_dir: &Path) -> Result<LockSet> {
        if mode == SharingMode::Oblivious {
            return Ok(LockSet::default());
        }
        let lockfile = lockfile_path(lock_dir, device);
        clear_or_refuse(&lockfile, device, mode)?;

        let advisory = match acquire_advisory(device, mode) {
            Ok(file) => Some(file),
            Err(err) if mode == SharingMode::Stomp => {
                warn!(device = %device.display(), error = %err, "stomp: advisory lock skipped");
                None
            }
            Err(err) => return Err(err),
        };

        let lockfile = match write_lockfile(&lockfile) {
            Ok(()) => Some(lockfile),
            Err(err) if mode == SharingMode::Exclusive => {
                return Err(Error::locking(&lockfile, err));
            }
            Err(err) => {
                warn!(path = %lockfile.display(), error = %err, "lockfile write skipped");
                None
            }
        };

        Ok(LockSet {
            lockfile,
            advisory,
            exclusive_ioctl: false,
        })
    }

    /// Close-time release, in reverse order of acquisition: the
    /// exclusive-use ioctl, the lockfile, the advisory lock. Individual
    /// failures are logged and do not stop the rest.
    pub fn release(&mut self, device: Option<&SerialDevice>) {
        if self.exclusive_ioctl {
            self.exclusive_ioctl = false;
            if let Some(device) = device {
                if let Err(err) = device.set_exclusive(false) {
                    warn!(error = %err, "failed to drop exclusive-use ioctl");
                }
            }
        }
        if let Some(path) = self.lockfile.take() {
            remove_own_lockfile(&path);
        }
        if let Some(file) = self.advisory.take() {
            // closing the holder descriptor releases the fcntl lock
            drop(file);
        }
    }

    /// Rollback for an open that never produced a device handle.
    pub(crate) fn abandon(&mut self) {
        self.release(None);
    }
}

/// `<lock_dir>/LCK..<basename>` per UUCP convention.
pub fn lockfile_path(lock_dir: &Path, device: &Path) -> PathBuf {
    let basename = device
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    lock_dir.join(format!("LCK..{basename}"))
}

/// Handles a pre-existing lockfile: reap it when stale, refuse or evict
/// when active, depending on the mode.
fn clear_or_refuse(lockfile: &Path, device: &Path, mode: SharingMode) -> Result<()> {
    let Some(holder) = read_lockfile(lockfile) else {
        return Ok(());
    };
    match holder {
        Holder::Stale => {
            debug!(path = %lockfile.display(), "removing stale lockfile");
            remove_lockfile(lockfile)
        }
        Holder::Alive(pid) if pid == std::process::id() as i32 => {
            // our own leftover; never signal ourselves, just reclaim it
            match mode {
                SharingMode::Stomp => remove_lockfile(lockfile),
                _ => Err(Error::SharingConflict {
                    device: device.display().to_string(),
                }),
            }
        }
        Holder::Alive(pid) => match mode {
            SharingMode::Stomp => {
                warn!(pid, path = %lockfile.display(), "stomp: evicting lock holder");
                evict(pid);
                remove_lockfile(lockfile)
            }
            _ => Err(Error::SharingConflict {
                device: device.display().to_string(),
            }),
        },
    }
}

enum Holder {
    Alive(i32),
    Stale,
}

/// Reads and PID-tests a lockfile. `None` means no lockfile. Malformed
/// content and dead PIDs are both stale.
fn read_lockfile(path: &Path) -> Option<Holder> {
    let content = std::fs::read_to_string(path).ok()?;
    match content.trim().parse::<i32>() {
        Ok(pid) if pid > 0 && pid_alive(pid) => Some(Holder::Alive(pid)),
        _ => Some(Holder::Stale),
    }
}

/// Signal-0 probe. `EPERM` means the process exists under another user,
/// which counts as alive.
fn pid_alive(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Best-effort eviction: SIGTERM, then a short grace period. The caller
/// proceeds whether or not the holder died.
fn evict(pid: i32) {
    let target = Pid::from_raw(pid);
    if kill(target, Some(Signal::SIGTERM)).is_err() {
        return;
    }
    for _ in 0..5 {
        std::thread::sleep(Duration::from_millis(50));
        if !pid_alive(pid) {
            return;
        }
    }
    warn!(pid, "lock holder survived SIGTERM, proceeding anyway");
}

fn remove_lockfile(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(Error::locking(path, err)),
    }
}

/// Removes the lockfile only while it still names us; a successor who
/// reaped our stale entry and wrote its own must keep its lock.
fn remove_own_lockfile(path: &Path) {
    let ours = std::fs::read_to_string(path)
        .ok()
        .and_then(|c| c.trim().parse::<i32>().ok())
        == Some(std::process::id() as i32);
    if !ours {
        return;
    }
    if let Err(err) = std::fs::remove_file(path) {
        if err.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %err, "failed to remove lockfile");
        }
    }
}

/// ASCII PID, right-justified in a 10-character field, newline-terminated;
/// the format cooperating UUCP tools expect.
fn write_lockfile(path: &Path) -> io::Result<()> {
    let content = format!("{:>10}\n", std::process::id());
    let mut opts = OpenOptions::new();
    opts.write(true).create(true).truncate(true).mode(0o644);
    let mut file = opts.open(path)?;
    io::Write::write_all(&mut file, content.as_bytes())
}

/// Takes the advisory whole-file lock on the device node, shared for
/// `polite`, exclusive otherwise, never blocking. The returned `File`
/// holds the lock for the lifetime of the connection.
fn acquire_advisory(device: &Path, mode: SharingMode) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
        .open(device)
        .map_err(|err| match err.raw_os_error() {
            Some(code) if code == libc::EBUSY => Error::SharingConflict {
                device: device.display().to_string(),
            },
            _ => Error::locking(device, err),
        })?;
    let l_type = match mode {
        SharingMode::Polite => libc::F_RDLCK,
        _ => libc::F_WRLCK,
    };
    let lock = libc::flock {
        l_type: l_type as i16,
        l_whence: libc::SEEK_SET as i16,
        l_start: 0,
        l_len: 0,
        l_pid: 0,
    };
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &lock) };
    if rc == -1 {
        let err = io::Error::last_os_error();
        return Err(match err.raw_os_error() {
            Some(code) if code == libc::EACCES || code == libc::EAGAIN => {
                Error::SharingConflict {
                    device: device.display().to_string(),
                }
            }
            _ => Error::locking(device, err),
        });
    }
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    // larger than any real pid_max, so never a live process
    const DEAD_PID: i32 = 99_999_999;

    fn fake_device(dir: &Path) -> PathBuf {
        let path = dir.join("ttyFAKE0");
        std::fs::write(&path, b"").unwrap();
        path
    }

    #[test]
    fn lockfile_path_uses_uucp_convention() {
        let path = lockfile_path(Path::new("/var/lock"), Path::new("/dev/ttyUSB0"));
        assert_eq!(path, Path::new("/var/lock/LCK..ttyUSB0"));
    }

    #[test]
    fn lockfile_format_is_fixed_width() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("LCK..ttyX");
        write_lockfile(&path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.len(), 11);
        assert!(content.ends_with('\n'));
        assert_eq!(
            content.trim().parse::<u32>().unwrap(),
            std::process::id()
        );
    }

    #[test]
    fn pid_probing() {
        assert!(pid_alive(std::process::id() as i32));
        assert!(!pid_alive(DEAD_PID));
    }

    #[test]
    fn stale_lockfiles_are_reaped() {
        let dir = tempdir().unwrap();
        let device = fake_device(dir.path());
        let lockfile = lockfile_path(dir.path(), &device);
        std::fs::write(&lockfile, format!("{DEAD_PID:>10}\n")).unwrap();

        let mut locks =
            LockSet::acquire(&device, SharingMode::Exclusive, dir.path()).unwrap();
        let content = std::fs::read_to_string(&lockfile).unwrap();
        assert_eq!(
            content.trim().parse::<u32>().unwrap(),
            std::process::id()
        );
        locks.release(None);
        assert!(!lockfile.exists());
    }

    #[test]
    fn malformed_lockfiles_count_as_stale() {
        let dir = tempdir().unwrap();
        let device = fake_device(dir.path());
        let lockfile = lockfile_path(dir.path(), &device);
        std::fs::write(&lockfile, "not a pid\n").unwrap();

        let mut locks = LockSet::acquire(&device, SharingMode::Polite, dir.path()).unwrap();
        locks.release(None);
    }

    #[test]
    fn live_holder_refuses_polite_and_exclusive() {
        let dir = tempdir().unwrap();
        let device = fake_device(dir.path());
        let lockfile = lockfile_path(dir.path(), &device);
        // our own live pid stands in for "some live holder"
        std::fs::write(&lockfile, format!("{:>10}\n", std::process::id())).unwrap();

        for mode in [SharingMode::Polite, SharingMode::Exclusive] {
            assert!(matches!(
                LockSet::acquire(&device, mode, dir.path()),
                Err(Error::SharingConflict { .. })
            ));
        }
        // the refused open must not have reaped the holder's file
        assert!(lockfile.exists());
    }

    #[test]
    fn stomp_reclaims_own_lockfile_without_signalling() {
        let dir = tempdir().unwrap();
        let device = fake_device(dir.path());
        let lockfile = lockfile_path(dir.path(), &device);
        std::fs::write(&lockfile, format!("{:>10}\n", std::process::id())).unwrap();

        let mut locks = LockSet::acquire(&device, SharingMode::Stomp, dir.path()).unwrap();
        assert!(lockfile.exists());
        locks.release(None);
        assert!(!lockfile.exists());
    }

    #[test]
    fn oblivious_takes_nothing() {
        let dir = tempdir().unwrap();
        let device = fake_device(dir.path());
        let mut locks =
            LockSet::acquire(&device, SharingMode::Oblivious, dir.path()).unwrap();
        assert!(!lockfile_path(dir.path(), &device).exists());
        locks.release(None);
    }

    #[test]
    fn release_leaves_a_successors_lockfile_alone() {
        let dir = tempdir().unwrap();
        let device = fake_device(dir.path());
        let lockfile = lockfile_path(dir.path(), &device);

        let mut locks = LockSet::acquire(&device, SharingMode::Polite, dir.path()).unwrap();
        // a successor stomped us and wrote its own pid
        std::fs::write(&lockfile, format!("{DEAD_PID:>10}\n")).unwrap();
        locks.release(None);
        assert!(lockfile.exists());
    }

    #[test]
    fn sharing_mode_parses() {
        assert_eq!("polite".parse::<SharingMode>().unwrap(), SharingMode::Polite);
        assert_eq!("STOMP".parse::<SharingMode>().unwrap(), SharingMode::Stomp);
        assert!(matches!(
            "assertive".parse::<SharingMode>(),
            Err(Error::Config(_))
        ));
    }
}
