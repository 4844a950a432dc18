//! Entry process spawning and signalling.
//!
//! Each entry process leads its own process group, so signals reach
//! everything it forked and nothing outlives the container.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::{ExitStatus, Stdio};

use dockyard_core::error::{EngineError, Result};
use tokio::process::{Child, Command};

use crate::build::runner::DEFAULT_PATH;

/// Everything needed to launch an entry process.
#[derive(Debug, Clone)]
pub struct ProcessSpec<'a> {
    pub argv: &'a [String],
    pub rootfs: &'a Path,
    /// Working directory inside the rootfs, absolute
    pub workdir: &'a str,
    pub env: &'a BTreeMap<String, String>,
}

/// Spawn the entry process with piped output.
///
/// The host `/bin/sh` and binaries are used; the rootfs is the working
/// directory and is exported as `DOCKYARD_ROOTFS`.
pub fn spawn(spec: &ProcessSpec<'_>) -> Result<Child> {
    let (program, args) = spec
        .argv
        .split_first()
        .ok_or_else(|| EngineError::RuntimeError("no command specified".to_string()))?;

    let cwd = spec.rootfs.join(spec.workdir.trim_start_matches('/'));
    std::fs::create_dir_all(&cwd)?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(&cwd)
        .env_clear()
        .env("PATH", DEFAULT_PATH)
        .env("HOME", "/root")
        .env("DOCKYARD_ROOTFS", spec.rootfs)
        .envs(spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    cmd.spawn().map_err(|e| {
        EngineError::RuntimeError(format!("failed to start '{}': {}", program, e))
    })
}

/// Send `signal` to the process group led by `pid`.
///
/// A group that no longer exists is not an error.
pub fn signal_group(pid: u32, signal: libc::c_int) -> Result<()> {
    let ret = unsafe { libc::kill(-(pid as libc::pid_t), signal) };
    if ret == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(EngineError::RuntimeError(format!(
        "failed to send signal {} to process group {}: {}",
        signal, pid, err
    )))
}

/// Exit code of a finished process; death by signal N reports 128 + N.
pub fn exit_code(status: &ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(-1)
}
