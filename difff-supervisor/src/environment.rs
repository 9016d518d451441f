//! Project environment provisioning through `uv sync`.
//!
//! An existing environment is trusted only if its interpreter runs. Otherwise
//! it is rebuilt offline first, then once more with network access.

use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Output, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::debug;

use crate::error::EnvironmentError;
use crate::startup_log::StartupLog;

/// Characters of captured stdout/stderr kept in sync diagnostics.
const RUN_TAIL_CHARS: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum SyncMode {
    /// `--offline --no-python-downloads`: cache only.
    Offline,
    /// Network resolution allowed.
    Online,
}

impl SyncMode {
    fn args(self, project_dir: &str) -> Vec<String> {
        let mut args = vec![
            "sync".to_string(),
            "--project".to_string(),
            project_dir.to_string(),
        ];
        if self == SyncMode::Offline {
            args.push("--offline".to_string());
            args.push("--no-python-downloads".to_string());
        }
        args
    }
}

/// How a single sync invocation ended.
#[derive(Debug)]
enum SyncRun {
    Succeeded,
    Failed(String),
    /// Carries the output captured before the tool was killed.
    TimedOut(String),
}

/// Inputs for making the project environment usable.
#[derive(Debug, Clone)]
pub struct EnvironmentSync {
    pub uv_cmd: PathBuf,
    pub runtime_root: PathBuf,
    /// Project directory relative to the runtime root.
    pub project_dir: String,
    pub env_dir: String,
    pub timeout: Duration,
}

impl EnvironmentSync {
    pub fn project_env(&self) -> PathBuf {
        self.runtime_root.join(&self.project_dir).join(&self.env_dir)
    }

    /// Return a project environment whose interpreter runs, rebuilding it
    /// when needed.
    pub async fn ensure(&self, log: &StartupLog) -> Result<PathBuf, EnvironmentError> {
        let project_env = self.project_env();
        if validate_project_env(&project_env).await {
            log.info(
                "uv.env.reuse",
                json!({ "project_env": project_env.display().to_string() }),
            );
            return Ok(project_env);
        }

        remove_stale_env(&project_env).await;

        log.info(
            "uv.sync.start",
            json!({
                "uv_cmd": self.uv_cmd.display().to_string(),
                "timeout_ms": self.timeout.as_millis() as u64,
                "mode": "offline-first",
            }),
        );

        match self.run_sync(SyncMode::Offline, &project_env).await {
            SyncRun::Succeeded => {}
            SyncRun::TimedOut(detail) => {
                return Err(EnvironmentError::SyncTimedOut {
                    mode: SyncMode::Offline,
                    timeout: self.timeout,
                    detail,
                });
            }
            SyncRun::Failed(detail) => {
                log.warn("uv.sync.offline.failed", json!({ "detail": detail }));
                match self.run_sync(SyncMode::Online, &project_env).await {
                    SyncRun::Succeeded => {}
                    SyncRun::TimedOut(detail) => {
                        return Err(EnvironmentError::SyncTimedOut {
                            mode: SyncMode::Online,
                            timeout: self.timeout,
                            detail,
                        });
                    }
                    SyncRun::Failed(detail) => {
                        return Err(EnvironmentError::SyncFailed { detail });
                    }
                }
            }
        }

        if !validate_project_env(&project_env).await {
            return Err(EnvironmentError::Unusable(project_env));
        }

        log.info(
            "uv.sync.ok",
            json!({ "project_env": project_env.display().to_string() }),
        );
        Ok(project_env)
    }

    async fn run_sync(&self, mode: SyncMode, project_env: &Path) -> SyncRun {
        let args = mode.args(&self.project_dir);
        debug!("Running {} {}", self.uv_cmd.display(), args.join(" "));

        let mut command = Command::new(&self.uv_cmd);
        command
            .args(&args)
            .current_dir(&self.runtime_root)
            .env("UV_PROJECT_ENVIRONMENT", project_env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => return SyncRun::Failed(format!("error={}", e)),
        };
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let (mut stdout, mut stderr) = (Vec::new(), Vec::new());

        // Output read so far stays in the buffers when the timeout wins.
        let finished = tokio::time::timeout(self.timeout, async {
            let (_, _, status) = tokio::join!(
                drain_into(stdout_pipe, &mut stdout),
                drain_into(stderr_pipe, &mut stderr),
                child.wait(),
            );
            status
        })
        .await;

        match finished {
            Ok(Ok(status)) => {
                let output = Output {
                    status,
                    stdout,
                    stderr,
                };
                if output.status.success() {
                    SyncRun::Succeeded
                } else {
                    SyncRun::Failed(summarize_output(&output))
                }
            }
            Ok(Err(e)) => SyncRun::Failed(format!("error={}", e)),
            Err(_) => {
                if let Err(e) = child.start_kill() {
                    debug!("Failed to kill {}: {}", self.uv_cmd.display(), e);
                }
                let status = child.wait().await.ok();
                SyncRun::TimedOut(summarize(status, &stdout, &stderr))
            }
        }
    }
}

/// Resolve the sync tool: explicit paths must exist, bare names are looked
/// up on `PATH`.
pub fn resolve_uv(uv_cmd: &Path) -> Result<PathBuf, EnvironmentError> {
    if uv_cmd.components().count() > 1 {
        return if uv_cmd.exists() {
            Ok(uv_cmd.to_path_buf())
        } else {
            Err(EnvironmentError::ToolMissing(uv_cmd.to_path_buf()))
        };
    }
    which::which(uv_cmd).map_err(|_| EnvironmentError::ToolMissing(uv_cmd.to_path_buf()))
}

/// An environment is valid when `bin/python3 -V` exits successfully.
///
/// Read-only: never modifies the environment.
pub async fn validate_project_env(project_env: &Path) -> bool {
    let python = project_env.join("bin").join("python3");
    if !python.is_file() {
        return false;
    }
    match Command::new(&python)
        .arg("-V")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
    {
        Ok(status) => status.success(),
        Err(e) => {
            debug!("Failed to run {}: {}", python.display(), e);
            false
        }
    }
}

async fn remove_stale_env(project_env: &Path) {
    if !project_env.exists() {
        return;
    }
    debug!("Removing unusable environment {}", project_env.display());
    // Non-fatal: uv recreates the environment over whatever is left.
    if let Err(e) = tokio::fs::remove_dir_all(project_env).await {
        debug!("Failed to remove {}: {}", project_env.display(), e);
    }
}

fn tail(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let start = text
        .char_indices()
        .nth(count - max_chars)
        .map(|(i, _)| i)
        .unwrap_or(0);
    &text[start..]
}

async fn drain_into<R: AsyncRead + Unpin>(pipe: Option<R>, buf: &mut Vec<u8>) {
    let Some(mut pipe) = pipe else {
        return;
    };
    let mut chunk = [0u8; 4096];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
}

fn summarize_output(output: &Output) -> String {
    summarize(Some(output.status), &output.stdout, &output.stderr)
}

/// `status | signal | stdout | stderr`, each part only when present.
fn summarize(status: Option<ExitStatus>, stdout: &[u8], stderr: &[u8]) -> String {
    use std::os::unix::process::ExitStatusExt;

    let mut chunks = Vec::new();
    if let Some(code) = status.and_then(|s| s.code()) {
        chunks.push(format!("status={}", code));
    }
    if let Some(signal) = status.and_then(|s| s.signal()) {
        chunks.push(format!("signal={}", signal));
    }
    let stdout = String::from_utf8_lossy(stdout);
    let stderr = String::from_utf8_lossy(stderr);
    let (stdout, stderr) = (stdout.trim(), stderr.trim());
    if !stdout.is_empty() {
        chunks.push(format!("stdout={}", tail(stdout, RUN_TAIL_CHARS)));
    }
    if !stderr.is_empty() {
        chunks.push(format!("stderr={}", tail(stderr, RUN_TAIL_CHARS)));
    }
    chunks.join(" | ")
}
