//! Shared test utilities for difff-supervisor integration tests.

// Each test file compiles separately, so not all helpers are used in each binary
#![allow(dead_code)]

use difff_supervisor::{ReadinessSettings, StartupLog, SupervisorConfig};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;

/// Upper bound for a whole test.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(60);

pub const MARKER_PAGE: &str =
    "<!doctype html><html><body><form id=\"compare-form\" method=\"post\"></form></body></html>";

/// Test context holding a source tree, a runtime root and a startup log in a
/// temp directory.
pub struct TestContext {
    pub temp_dir: TempDir,
    pub source_root: PathBuf,
    pub runtime_root: PathBuf,
    pub log_path: PathBuf,
    /// Every fake `uv` invocation is appended here, one line of arguments each.
    pub calls_file: PathBuf,
    /// Written by the fake `uv run` with the port it was asked to serve on.
    pub port_file: PathBuf,
    /// Written by the fake `uv run` with the environment it received.
    pub env_file: PathBuf,
    /// Written by the fake `uv run` with its own pid, which `exec` keeps.
    pub pid_file: PathBuf,
}

impl TestContext {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let root = temp_dir.path();
        let source_root = root.join("source");
        let ctx = Self {
            source_root: source_root.clone(),
            runtime_root: root.join("runtime"),
            log_path: root.join("logs").join("startup.log"),
            calls_file: root.join("uv-calls"),
            port_file: root.join("uv-port"),
            env_file: root.join("uv-env"),
            pid_file: root.join("uv-pid"),
            temp_dir,
        };

        write_file(&source_root.join("difff.pl"), "#!/usr/bin/perl\nprint \"ok\";\n");
        write_file(&source_root.join("index.cgi"), "#!/bin/sh\necho ok\n");
        write_file(&source_root.join("favicon.ico"), "ico");
        write_file(
            &source_root.join("tools").join("pyproject.toml"),
            "[project]\nname = \"tools\"\n",
        );
        write_file(
            &source_root.join("tools").join(".venv").join("from-source"),
            "must not be copied",
        );
        write_file(&source_root.join("static").join("app.css"), "body {}");
        write_file(&source_root.join("data").join("README.md"), "data");
        ctx
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn project_env(&self) -> PathBuf {
        self.runtime_root.join("tools").join(".venv")
    }

    /// Write an executable fake `uv` with the given behaviors.
    pub fn fake_uv(&self, uv: FakeUv) -> PathBuf {
        let script = format!(
            r#"#!/bin/sh
echo "$*" >> '{calls}'
case "$1" in
  sync)
    case "$*" in
      *--offline*)
        {offline}
        ;;
      *)
        {online}
        ;;
    esac
    ;;
  run)
    port=""
    for arg in "$@"; do port="$arg"; done
    echo "UV_PROJECT_ENVIRONMENT=$UV_PROJECT_ENVIRONMENT" > '{env_file}'
    echo "DIFFF_BASE_URL=$DIFFF_BASE_URL" >> '{env_file}'
    echo "$$" > '{pid_file}'
    echo "$port" > '{port_file}.tmp'
    mv '{port_file}.tmp' '{port_file}'
    {run}
    ;;
esac
"#,
            calls = self.calls_file.display(),
            env_file = self.env_file.display(),
            pid_file = self.pid_file.display(),
            port_file = self.port_file.display(),
            offline = uv.offline.script(),
            online = uv.online.script(),
            run = uv.run.script(),
        );
        let path = self.temp_path().join("bin").join("uv");
        write_file(&path, &script);
        make_executable(&path);
        path
    }

    /// Supervisor configuration with timeouts sized for tests.
    pub fn config(&self, uv_cmd: PathBuf, preferred_port: i64) -> SupervisorConfig {
        SupervisorConfig {
            source_root: self.source_root.clone(),
            runtime_root: self.runtime_root.clone(),
            log_path: self.log_path.clone(),
            uv_cmd,
            preferred_port,
            sync_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(3),
            readiness: ReadinessSettings {
                poll_interval: Duration::from_millis(50),
                timeout: Duration::from_secs(20),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn startup_log(&self) -> StartupLog {
        StartupLog::new(&self.log_path, "test-build")
    }

    pub fn log_content(&self) -> String {
        std::fs::read_to_string(&self.log_path).unwrap_or_default()
    }

    /// Log lines for `event`, matched on the event column.
    pub fn log_events(&self, event: &str) -> Vec<String> {
        let needle = format!(" {} ", event);
        self.log_content()
            .lines()
            .filter(|line| format!("{} ", line).contains(&needle))
            .map(str::to_string)
            .collect()
    }

    /// Pid of the last fake `uv run`, once it has started.
    pub fn backend_pid(&self) -> Option<i32> {
        std::fs::read_to_string(&self.pid_file)
            .ok()
            .and_then(|content| content.trim().parse().ok())
    }

    pub fn uv_calls(&self) -> Vec<String> {
        std::fs::read_to_string(&self.calls_file)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// Install an environment whose interpreter answers `-V` with `exit_code`.
    pub fn install_env(&self, exit_code: i32) {
        let python = self.project_env().join("bin").join("python3");
        write_file(
            &python,
            &format!("#!/bin/sh\necho \"Python 3.12.0\"\nexit {}\n", exit_code),
        );
        make_executable(&python);
    }

    /// Serve the application once the fake backend has reported its port.
    pub fn serve_app(&self, app: AppBehavior) -> AppServer {
        let _ = std::fs::remove_file(&self.port_file);
        AppServer::spawn(self.port_file.clone(), app)
    }
}

/// What a fake `uv sync` invocation does.
#[derive(Debug, Clone, Copy)]
pub enum SyncBehavior {
    /// Create a working environment and succeed.
    Succeed,
    /// Exit non-zero with a diagnostic on stderr.
    Fail,
    /// Report progress on stderr, then never finish.
    Hang,
    /// Exit zero without creating anything.
    SucceedWithoutEnv,
}

impl SyncBehavior {
    fn script(self) -> &'static str {
        match self {
            SyncBehavior::Succeed => {
                r#"mkdir -p "$UV_PROJECT_ENVIRONMENT/bin"
        printf '#!/bin/sh\necho "Python 3.12.0"\n' > "$UV_PROJECT_ENVIRONMENT/bin/python3"
        chmod +x "$UV_PROJECT_ENVIRONMENT/bin/python3"
        echo "Resolved 3 packages"
        exit 0"#
            }
            SyncBehavior::Fail => {
                r#"echo "error: network unavailable" >&2
        exit 2"#
            }
            SyncBehavior::Hang => {
                r#"echo "Resolving dependencies" >&2
        exec sleep 30"#
            }
            SyncBehavior::SucceedWithoutEnv => "exit 0",
        }
    }
}

/// What a fake `uv run` does after reporting its port.
#[derive(Debug, Clone, Copy)]
pub enum RunBehavior {
    /// Stay alive until terminated.
    Serve,
    /// Print a traceback and exit with code 3 after one second.
    Crash,
    /// Print a traceback and exit with code 3 right away.
    CrashImmediately,
    /// Ignore SIGTERM.
    IgnoreTerm,
}

impl RunBehavior {
    fn script(self) -> &'static str {
        match self {
            RunBehavior::Serve => "exec sleep 30",
            RunBehavior::Crash => {
                r#"echo "Traceback: OSError: [Errno 98] Address already in use" >&2
    sleep 1
    exit 3"#
            }
            RunBehavior::CrashImmediately => {
                r#"echo "Traceback: ModuleNotFoundError: No module named 'cgi'" >&2
    exit 3"#
            }
            RunBehavior::IgnoreTerm => {
                r#"trap '' TERM
    while true; do sleep 0.1; done"#
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FakeUv {
    pub offline: SyncBehavior,
    pub online: SyncBehavior,
    pub run: RunBehavior,
}

impl Default for FakeUv {
    fn default() -> Self {
        Self {
            offline: SyncBehavior::Succeed,
            online: SyncBehavior::Succeed,
            run: RunBehavior::Serve,
        }
    }
}

/// How the in-process stand-in for the CGI server answers the entry page.
#[derive(Debug, Clone, Copy)]
pub enum AppBehavior {
    /// HTML with the readiness marker.
    Ready,
    /// HTML without the marker.
    WrongPage,
}

/// HTTP server standing in for the backend, bound to the port the fake
/// `uv run` reported. Aborted on drop.
pub struct AppServer {
    handle: JoinHandle<()>,
}

impl AppServer {
    fn spawn(port_file: PathBuf, app: AppBehavior) -> Self {
        let handle = tokio::spawn(async move {
            let port = loop {
                let content = tokio::fs::read_to_string(&port_file).await;
                if let Some(port) = content.ok().and_then(|c| c.trim().parse::<u16>().ok()) {
                    break port;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            };
            let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
                .await
                .expect("Failed to bind app server");

            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let mut buf = [0u8; 2048];
                let n = stream.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]);
                let (content_type, body) = if request.starts_with("GET /cgi-bin/difff.pl ") {
                    match app {
                        AppBehavior::Ready => ("text/html; charset=utf-8", MARKER_PAGE),
                        AppBehavior::WrongPage => ("text/html", "<html>Index of /cgi-bin</html>"),
                    }
                } else {
                    ("text/html", "<html>Directory listing</html>")
                };
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    content_type,
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });
        Self { handle }
    }
}

impl Drop for AppServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A port nothing is listening on right now.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind(("0.0.0.0", 0)).expect("Failed to bind");
    listener.local_addr().expect("No local addr").port()
}

pub fn write_file(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create parent dir");
    }
    std::fs::write(path, content).expect("Failed to write file");
}

pub fn make_executable(path: &Path) {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .expect("Failed to set permissions");
}

/// Whether a process with `pid` still exists (zombies included).
pub fn process_exists(pid: i32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

/// Wait for a condition with exponential backoff
pub async fn wait_for_condition<F>(mut check: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    let mut delay = Duration::from_millis(10);
    let max_delay = Duration::from_millis(500);

    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(max_delay);
    }
    false
}
