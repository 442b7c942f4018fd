//! Process bootstrap: root-directory layout and lockfile arbitration.
//!
//! Daemonization itself (the double-fork dance, log-file rotation) is out of
//! scope — `Daemonize` is left as a trait/hook for whatever process
//! supervisor wraps this binary in production to fill in.

use std::{
    fs::OpenOptions,
    io,
    path::{Path, PathBuf},
};

/// Number of candidate lockfile slots tried under `<ROOTDIR>/status/`.
const MAX_LOCK_SLOTS: u32 = 512;

/// Hook for whatever double-fork/session-detach dance a production
/// deployment wants. The foreground default is a no-op; `-D`/`-debug` always
/// selects it (§6 of the relay spec keeps daemonization itself out of
/// scope).
pub trait Daemonize {
    fn daemonize(&self) -> io::Result<()>;
}

/// Runs everything in the foreground. The only implementation shipped here.
pub struct Foreground;

impl Daemonize for Foreground {
    fn daemonize(&self) -> io::Result<()> {
        Ok(())
    }
}

/// A held lockfile. Dropping it does not remove the file — only ever one
/// live process should hold a given slot, enforced by the OS file lock at
/// acquisition time, not by file presence.
pub struct LockFile {
    path: PathBuf,
    _file: std::fs::File,
}

impl LockFile {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Ensures `<rootdir>/log` and `<rootdir>/status` exist, then claims the
/// first of `<rootdir>/status/<name>.<N>` for `N` in `1..MAX_LOCK_SLOTS`
/// that isn't already exclusively locked by another process.
pub fn acquire(rootdir: &Path, name: &str) -> io::Result<LockFile> {
    let log_dir = rootdir.join("log");
    let status_dir = rootdir.join("status");
    std::fs::create_dir_all(&log_dir)?;
    std::fs::create_dir_all(&status_dir)?;

    for slot in 1..MAX_LOCK_SLOTS {
        let path = status_dir.join(format!("{name}.{slot}"));
        let file = OpenOptions::new().create(true).write(true).open(&path)?;
        if try_lock_exclusive(&file) {
            return Ok(LockFile { path, _file: file });
        }
    }
    Err(io::Error::new(io::ErrorKind::Other, "no free lockfile slot in 1..512"))
}

/// `flock(LOCK_EX | LOCK_NB)`, same raw-syscall fallback used for the
/// `SO_LINGER`/`SO_REUSEADDR` socket options elsewhere in this workspace —
/// there's no `std` API for advisory file locks.
fn try_lock_exclusive(file: &std::fs::File) -> bool {
    use std::os::fd::AsRawFd;
    let fd = file.as_raw_fd();
    unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_creates_log_and_status_dirs_and_claims_slot_one() {
        let dir = tempfile::tempdir().unwrap();
        let lock = acquire(dir.path(), "ndrelay").unwrap();
        assert!(dir.path().join("log").is_dir());
        assert!(dir.path().join("status").is_dir());
        assert_eq!(lock.path(), dir.path().join("status/ndrelay.1"));
    }

    #[test]
    fn second_process_skips_a_slot_already_held() {
        let dir = tempfile::tempdir().unwrap();
        let first = acquire(dir.path(), "ndrelay").unwrap();
        let second = acquire(dir.path(), "ndrelay").unwrap();
        assert_ne!(first.path(), second.path());
        assert_eq!(second.path(), dir.path().join("status/ndrelay.2"));
    }

    #[test]
    fn foreground_daemonize_is_a_no_op() {
        assert!(Foreground.daemonize().is_ok());
    }
}
