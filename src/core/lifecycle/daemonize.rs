// src/core/lifecycle/daemonize.rs

//! Classic double-fork daemonisation.
//!
//! Must run before the tokio runtime starts: forking a threaded runtime
//! is undefined behaviour territory, so `main` calls this first and only
//! then builds the runtime.

use anyhow::{Result, anyhow};
use std::ffi::CString;

pub fn daemonize() -> Result<()> {
    unsafe {
        match libc::fork() {
            -1 => return Err(anyhow!("first fork failed")),
            0 => {}
            _ => libc::_exit(0),
        }
        if libc::setsid() == -1 {
            return Err(anyhow!("setsid failed"));
        }
        match libc::fork() {
            -1 => return Err(anyhow!("second fork failed")),
            0 => {}
            _ => libc::_exit(0),
        }
        let devnull = CString::new("/dev/null").expect("static string");
        let fd = libc::open(devnull.as_ptr(), libc::O_RDWR);
        if fd >= 0 {
            libc::dup2(fd, libc::STDIN_FILENO);
            libc::dup2(fd, libc::STDOUT_FILENO);
            libc::dup2(fd, libc::STDERR_FILENO);
            if fd > libc::STDERR_FILENO {
                libc::close(fd);
            }
        }
    }
    Ok(())
}
