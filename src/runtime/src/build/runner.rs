//! Execution of RUN instructions.

use std::collections::BTreeMap;

use async_trait::async_trait;
use dockyard_core::error::{EngineError, Result};

use crate::snapshot::{normalize_path, Snapshot};

/// Default PATH given to build commands.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// A single RUN invocation.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub command: String,
    /// Absolute working directory inside the image
    pub workdir: String,
    /// Image environment at this point of the build
    pub env: BTreeMap<String, String>,
}

/// Executes a shell command against a filesystem snapshot.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `request` on top of `snapshot` and return the resulting tree.
    async fn run(&self, snapshot: &Snapshot, request: &RunRequest) -> Result<Snapshot>;
}

/// Runs commands with the host `/bin/sh` inside a scratch copy of the tree.
///
/// The snapshot is materialized into a temporary directory and the
/// command's working directory is set inside it. The environment is
/// cleared apart from PATH, HOME, `DOCKYARD_ROOTFS` and the image env.
/// No isolation is applied.
#[derive(Debug, Default, Clone)]
pub struct ShellRunner;

impl ShellRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, snapshot: &Snapshot, request: &RunRequest) -> Result<Snapshot> {
        let scratch = tempfile::TempDir::new().map_err(|e| {
            EngineError::RuntimeError(format!("failed to create build directory: {}", e))
        })?;
        let rootfs = scratch.path().join("rootfs");
        snapshot.materialize(&rootfs)?;

        let cwd = rootfs.join(normalize_path("/", &request.workdir)?);
        std::fs::create_dir_all(&cwd)?;

        let mut cmd = tokio::process::Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(&request.command)
            .current_dir(&cwd)
            .env_clear()
            .env("PATH", DEFAULT_PATH)
            .env("HOME", "/root")
            .env("DOCKYARD_ROOTFS", &rootfs)
            .envs(&request.env)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);

        tracing::debug!(command = %request.command, cwd = %cwd.display(), "Running build command");

        let output = cmd.output().await.map_err(|e| {
            EngineError::RuntimeError(format!("failed to execute /bin/sh: {}", e))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
            let tail: Vec<&str> = tail.into_iter().rev().collect();
            let status = match output.status.code() {
                Some(code) => format!("exit code {}", code),
                None => "a signal".to_string(),
            };
            return Err(EngineError::RuntimeError(if tail.is_empty() {
                format!("command '{}' terminated with {}", request.command, status)
            } else {
                format!(
                    "command '{}' terminated with {}: {}",
                    request.command,
                    status,
                    tail.join("\n")
                )
            }));
        }

        Snapshot::capture(&rootfs)
    }
}
