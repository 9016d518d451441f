//! The backend child process: launch, stream capture, exit observation and
//! termination.

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde_json::json;
use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{ChildStderr, Command};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::SupervisorError;
use crate::startup_log::StartupLog;

/// How long the exit task waits for stderr to reach EOF after the child is
/// reaped. Grandchildren holding the pipe open must not stall exit reporting.
const STDERR_DRAIN: Duration = Duration::from_millis(500);

/// How the backend ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn signal_name(&self) -> Option<String> {
        self.signal.map(|raw| match Signal::try_from(raw) {
            Ok(sig) => sig.as_str().to_string(),
            Err(_) => raw.to_string(),
        })
    }
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = self
            .code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "null".to_string());
        let signal = self.signal_name().unwrap_or_else(|| "null".to_string());
        write!(f, "code={}, signal={}", code, signal)
    }
}

/// Fully resolved backend invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
}

impl BackendCommand {
    /// `uv run --project <project> python -m http.server --cgi <port>` in the
    /// runtime root, pointed at the synced environment.
    pub fn cgi_server(
        uv_cmd: &Path,
        runtime_root: &Path,
        project_dir: &str,
        project_env: &Path,
        port: u16,
        base_url: &str,
    ) -> Self {
        let args = [
            "run",
            "--project",
            project_dir,
            "python",
            "-m",
            "http.server",
            "--cgi",
            &port.to_string(),
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        Self {
            program: uv_cmd.to_path_buf(),
            args,
            cwd: runtime_root.to_path_buf(),
            env: vec![
                (
                    "UV_PROJECT_ENVIRONMENT".to_string(),
                    project_env.display().to_string(),
                ),
                ("DIFFF_BASE_URL".to_string(), base_url.to_string()),
            ],
        }
    }

    /// Shell-like rendering for logs and the state record.
    pub fn command_line(&self) -> String {
        format!("{} {}", self.program.display(), self.args.join(" "))
    }
}

/// Bounded buffer keeping the most recent stderr output.
#[derive(Debug, Clone)]
pub struct StderrTail {
    buf: Arc<Mutex<String>>,
    cap: usize,
}

impl StderrTail {
    pub fn new(cap: usize) -> Self {
        Self {
            buf: Arc::new(Mutex::new(String::new())),
            cap,
        }
    }

    pub fn push(&self, chunk: &str) {
        let mut buf = self.buf.lock().unwrap_or_else(|p| p.into_inner());
        buf.push_str(chunk);
        let excess = buf.chars().count().saturating_sub(self.cap);
        if excess > 0 {
            let cut = buf
                .char_indices()
                .nth(excess)
                .map(|(i, _)| i)
                .unwrap_or(buf.len());
            buf.drain(..cut);
        }
    }

    pub fn contents(&self) -> String {
        self.buf.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

/// Handle to a running backend.
///
/// The child is owned by a background task that reaps it and publishes its
/// exit once stderr has been drained; the handle observes that and signals
/// the process group. Dropping the handle while the backend still runs kills
/// the group.
#[derive(Debug)]
pub struct BackendProcess {
    pid: u32,
    exit: watch::Receiver<Option<ExitInfo>>,
    /// Set as soon as the child is reaped; its pid may be reused after that.
    reaped: Arc<AtomicBool>,
    stderr: StderrTail,
}

impl BackendProcess {
    /// Spawn the backend in its own process group.
    ///
    /// stdout is drained and discarded; stderr is kept up to `stderr_cap`
    /// characters. An exit at any point is logged as `child.exit`.
    pub fn spawn(
        command: &BackendCommand,
        stderr_cap: usize,
        log: &StartupLog,
    ) -> Result<Self, SupervisorError> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .current_dir(&command.cwd)
            .envs(command.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            command: command.command_line(),
            source,
        })?;
        let pid = child.id().unwrap_or_default();
        debug!("Spawned backend (PID {}): {}", pid, command.command_line());

        if let Some(mut stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let _ = tokio::io::copy(&mut stdout, &mut tokio::io::sink()).await;
            });
        }

        let stderr = StderrTail::new(stderr_cap);
        let collector = child
            .stderr
            .take()
            .map(|pipe| tokio::spawn(collect_stderr(pipe, stderr.clone())));

        let (exit_tx, exit) = watch::channel(None);
        let reaped = Arc::new(AtomicBool::new(false));
        let log = log.clone();
        tokio::spawn({
            let reaped = Arc::clone(&reaped);
            async move {
                let info = match child.wait().await {
                    Ok(status) => ExitInfo::from(status),
                    Err(e) => {
                        warn!("Failed to wait for backend (PID {}): {}", pid, e);
                        ExitInfo::default()
                    }
                };
                reaped.store(true, Ordering::SeqCst);

                // Observers of the exit expect the final stderr lines.
                if let Some(collector) = collector {
                    if tokio::time::timeout(STDERR_DRAIN, collector).await.is_err() {
                        debug!("stderr of backend (PID {}) still open after exit", pid);
                    }
                }

                log.warn(
                    "child.exit",
                    json!({ "code": info.code, "signal": info.signal_name() }),
                );
                exit_tx.send_replace(Some(info));
            }
        });

        Ok(Self {
            pid,
            exit,
            reaped,
            stderr,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_info().is_some()
    }

    fn is_reaped(&self) -> bool {
        self.reaped.load(Ordering::SeqCst)
    }

    /// Wait for the backend to exit and be reaped.
    pub async fn wait(&self) -> ExitInfo {
        let mut exit = self.exit.clone();
        let info = exit.wait_for(Option::is_some).await.ok().and_then(|info| *info);
        info.unwrap_or_default()
    }

    /// Current stderr tail, trimmed.
    pub fn stderr_tail(&self) -> String {
        self.stderr.contents().trim().to_string()
    }

    /// Send `sig` to the backend's process group. A group that is already gone
    /// is not an error.
    pub fn signal(&self, sig: Signal) -> nix::Result<()> {
        if self.is_reaped() {
            return Ok(());
        }
        match signal::killpg(Pid::from_raw(self.pid as i32), sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Terminate gracefully, escalating to SIGKILL once `grace` has elapsed.
    pub async fn terminate(&self, grace: Duration) -> ExitInfo {
        if let Some(info) = self.exit_info() {
            return info;
        }

        if let Err(e) = self.signal(Signal::SIGTERM) {
            warn!("Failed to send SIGTERM to backend (PID {}): {}", self.pid, e);
        }

        match tokio::time::timeout(grace, self.wait()).await {
            Ok(info) => {
                debug!("Backend (PID {}) exited: {}", self.pid, info);
                info
            }
            Err(_) => {
                warn!(
                    "Backend (PID {}) did not exit within {:.1}s, sending SIGKILL",
                    self.pid,
                    grace.as_secs_f64()
                );
                match self.signal(Signal::SIGKILL) {
                    Ok(()) => info!("Sent SIGKILL to process group {}", self.pid),
                    Err(e) => warn!("Failed to send SIGKILL to process group: {}", e),
                }
                self.wait().await
            }
        }
    }
}

impl Drop for BackendProcess {
    fn drop(&mut self) {
        if self.is_reaped() {
            return;
        }
        debug!("Killing backend process group {} on drop", self.pid);
        if let Err(e) = self.signal(Signal::SIGKILL) {
            warn!("Failed to kill process group {}: {}", self.pid, e);
        }
    }
}

async fn collect_stderr(mut pipe: ChildStderr, tail: StderrTail) {
    let mut buf = [0u8; 4096];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => tail.push(&String::from_utf8_lossy(&buf[..n])),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn sh(script: &str, cwd: &Path) -> BackendCommand {
        BackendCommand {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            cwd: cwd.to_path_buf(),
            env: vec![("DIFFF_TEST_VALUE".to_string(), "42".to_string())],
        }
    }

    #[test]
    fn test_cgi_server_command() {
        let command = BackendCommand::cgi_server(
            Path::new("/usr/bin/uv"),
            Path::new("/rt"),
            "tools",
            Path::new("/rt/tools/.venv"),
            18765,
            "http://127.0.0.1:18765/cgi-bin/",
        );

        assert_eq!(
            command.command_line(),
            "/usr/bin/uv run --project tools python -m http.server --cgi 18765"
        );
        assert_eq!(command.cwd, PathBuf::from("/rt"));
        assert_eq!(
            command.env,
            vec![
                (
                    "UV_PROJECT_ENVIRONMENT".to_string(),
                    "/rt/tools/.venv".to_string()
                ),
                (
                    "DIFFF_BASE_URL".to_string(),
                    "http://127.0.0.1:18765/cgi-bin/".to_string()
                ),
            ]
        );
    }

    #[test]
    fn test_exit_info_display() {
        assert_eq!(
            ExitInfo {
                code: Some(3),
                signal: None
            }
            .to_string(),
            "code=3, signal=null"
        );
        assert_eq!(
            ExitInfo {
                code: None,
                signal: Some(15)
            }
            .to_string(),
            "code=null, signal=SIGTERM"
        );
    }

    #[test]
    fn test_stderr_tail_keeps_last_chars() {
        let tail = StderrTail::new(5);
        tail.push("abc");
        tail.push("défgh");
        assert_eq!(tail.contents(), "défgh");
        tail.push("ij");
        assert_eq!(tail.contents(), "fghij");
    }

    #[tokio::test]
    async fn test_exit_is_observed_with_stderr() {
        let temp = TempDir::new().unwrap();
        let log = StartupLog::new(temp.path().join("startup.log"), "b");
        let command = sh("echo \"boom $DIFFF_TEST_VALUE\" >&2; exit 3", temp.path());

        let backend = BackendProcess::spawn(&command, 8000, &log).unwrap();
        let info = backend.wait().await;

        assert_eq!(info.code, Some(3));
        assert!(backend.has_exited());
        assert_eq!(backend.stderr_tail(), "boom 42");

        let content = std::fs::read_to_string(log.path()).unwrap();
        assert!(content.contains(" WARN child.exit "));
        assert!(content.contains("code=3 signal=null"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stderr_is_complete_when_exit_is_published() {
        let temp = TempDir::new().unwrap();
        let log = StartupLog::new(temp.path().join("startup.log"), "b");
        let command = sh("echo 'Traceback: boom' >&2; exit 3", temp.path());

        for _ in 0..40 {
            let backend = BackendProcess::spawn(&command, 8000, &log).unwrap();
            let info = backend.wait().await;
            assert_eq!(info.code, Some(3));
            assert_eq!(backend.stderr_tail(), "Traceback: boom");
        }
    }

    #[tokio::test]
    async fn test_drop_kills_running_backend() {
        let temp = TempDir::new().unwrap();
        let log = StartupLog::new(temp.path().join("startup.log"), "b");
        let backend = BackendProcess::spawn(&sh("exec sleep 30", temp.path()), 8000, &log).unwrap();
        let pid = Pid::from_raw(backend.pid() as i32);

        drop(backend);

        let mut gone = false;
        for _ in 0..100 {
            if signal::kill(pid, None) == Err(Errno::ESRCH) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(gone, "backend must be killed and reaped");
        let content = std::fs::read_to_string(log.path()).unwrap();
        assert!(content.contains("signal=\"SIGKILL\""));
    }

    #[tokio::test]
    async fn test_terminate_graceful() {
        let temp = TempDir::new().unwrap();
        let log = StartupLog::new(temp.path().join("startup.log"), "b");
        let backend = BackendProcess::spawn(&sh("exec sleep 30", temp.path()), 8000, &log).unwrap();

        let info = backend.terminate(Duration::from_secs(3)).await;

        assert_eq!(info.signal, Some(Signal::SIGTERM as i32));
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_sigkill() {
        let temp = TempDir::new().unwrap();
        let log = StartupLog::new(temp.path().join("startup.log"), "b");
        let script = "trap '' TERM; echo started >&2; while true; do sleep 0.1; done";
        let backend = BackendProcess::spawn(&sh(script, temp.path()), 8000, &log).unwrap();
        for _ in 0..50 {
            if backend.stderr_tail() == "started" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let start = std::time::Instant::now();
        let info = backend.terminate(Duration::from_millis(300)).await;

        assert_eq!(info.signal, Some(Signal::SIGKILL as i32));
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_terminate_after_exit_is_noop() {
        let temp = TempDir::new().unwrap();
        let log = StartupLog::new(temp.path().join("startup.log"), "b");
        let backend = BackendProcess::spawn(&sh("exit 0", temp.path()), 8000, &log).unwrap();
        backend.wait().await;

        let info = backend.terminate(Duration::from_secs(3)).await;
        assert_eq!(info.code, Some(0));
        assert!(backend.signal(Signal::SIGTERM).is_ok());
    }

    #[tokio::test]
    async fn test_spawn_failure_names_command() {
        let temp = TempDir::new().unwrap();
        let log = StartupLog::new(temp.path().join("startup.log"), "b");
        let command = BackendCommand {
            program: temp.path().join("missing-uv"),
            args: vec!["run".to_string()],
            cwd: temp.path().to_path_buf(),
            env: Vec::new(),
        };

        let err = BackendProcess::spawn(&command, 8000, &log).unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { .. }));
        assert!(err.to_string().contains("missing-uv run"));
    }
}
