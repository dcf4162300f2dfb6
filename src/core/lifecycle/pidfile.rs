// src/core/lifecycle/pidfile.rs

//! Pidfile handling with advisory locks.
//!
//! The running daemon keeps its pidfile open with an exclusive `flock`.
//! A starting daemon signals the previous instance and then takes a
//! *shared* lock on the same file, which blocks until the old holder
//! exits; that is the "wait for the previous daemon" path.

use anyhow::{Context, Result, anyhow};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::path::Path;
use tracing::{info, warn};

/// Holds the pidfile open (and locked) for the life of the daemon.
pub struct PidFile {
    _file: File,
}

/// Signals any previous instance named by `path` and waits for it to exit.
/// With `ignore` set the file is left alone entirely.
pub fn kill_old_instance(path: &str, ignore: bool) -> Result<()> {
    if ignore {
        return Ok(());
    }
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("cannot open pidfile '{path}'")),
    };
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok();
    if let Ok(pid) = contents.trim().parse::<i32>()
        && pid > 0
    {
        info!(pid, "signalling previous instance");
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
    }
    // Block on a shared lock until the previous holder drops its
    // exclusive one.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_SH) };
    if rc != 0 {
        warn!(path, "could not wait on previous instance's pidfile lock");
    }
    Ok(())
}

/// Creates (or truncates) the pidfile, takes the exclusive lock, writes
/// our pid. Fails when another live instance still holds the lock.
pub fn create_pidfile(path: &str) -> Result<PidFile> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("cannot create pidfile '{path}'"))?;
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        return Err(anyhow!(
            "another instance holds the pidfile lock on '{path}'"
        ));
    }
    file.set_len(0)?;
    writeln!(file, "{}", std::process::id())?;
    file.sync_all()?;
    Ok(PidFile { _file: file })
}

/// Best-effort removal at exit; the lock dies with the process either way.
pub fn remove_pidfile(path: &str) {
    if Path::new(path).exists()
        && let Err(e) = std::fs::remove_file(path)
    {
        warn!(path, error = %e, "unable to remove pidfile");
    }
}
