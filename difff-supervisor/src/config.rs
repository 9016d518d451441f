//! Configuration for one supervisor run.
//!
//! Plain values with defaults; the shell maps command line flags and
//! environment variables onto these.

use regex::Regex;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

/// XDG prefix for runtime and log directories.
pub const APP_DIR_NAME: &str = "difff-pdf";

pub const DEFAULT_PORT: i64 = 18765;
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(180);
/// Lower bound applied to user supplied readiness and sync timeouts.
pub const MIN_TIMEOUT: Duration = Duration::from_secs(10);

static READY_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"id=['"]compare-form['"]"#).expect("valid regex"));

/// Clamp a user supplied timeout to [`MIN_TIMEOUT`].
pub fn clamp_timeout(timeout: Duration) -> Duration {
    timeout.max(MIN_TIMEOUT)
}

/// What goes into the runtime root and where.
#[derive(Debug, Clone)]
pub struct RuntimeLayout {
    /// Directories created under the runtime root.
    pub directories: Vec<PathBuf>,
    /// Backend entry scripts, copied from the source root and marked executable.
    pub entry_scripts: Vec<String>,
    /// Fixed top level assets copied verbatim.
    pub assets: Vec<String>,
    /// Subtrees overlay-copied into the runtime root.
    pub overlay_dirs: Vec<String>,
    /// Basenames never copied by an overlay.
    pub denylist: Vec<String>,
    /// Directory the HTTP server executes scripts from.
    pub serving_dir: String,
    /// Files copied when present, skipped otherwise.
    pub optional_files: Vec<PathBuf>,
    /// Project directory handed to `uv --project`.
    pub project_dir: String,
    /// Environment directory name inside the project directory.
    pub env_dir: String,
}

impl Default for RuntimeLayout {
    fn default() -> Self {
        Self {
            directories: vec![
                PathBuf::from("cgi-bin"),
                PathBuf::from("data").join("tmp"),
                PathBuf::from("docs"),
            ],
            entry_scripts: vec!["difff.pl".to_string(), "index.cgi".to_string()],
            assets: vec!["favicon.ico".to_string(), ".htaccess".to_string()],
            overlay_dirs: vec!["tools".to_string(), "static".to_string()],
            denylist: vec![
                ".venv".to_string(),
                "__pycache__".to_string(),
                ".DS_Store".to_string(),
            ],
            serving_dir: "cgi-bin".to_string(),
            optional_files: vec![PathBuf::from("data").join("README.md")],
            project_dir: "tools".to_string(),
            env_dir: ".venv".to_string(),
        }
    }
}

/// Readiness polling parameters.
#[derive(Debug, Clone)]
pub struct ReadinessSettings {
    pub poll_interval: Duration,
    pub timeout: Duration,
    /// Per-request bound for a single probe.
    pub request_timeout: Duration,
    pub root_max_bytes: usize,
    pub app_max_bytes: usize,
    /// Path of the application entry page, relative to the server root.
    pub app_path: String,
    pub marker: Regex,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            timeout: DEFAULT_READY_TIMEOUT,
            request_timeout: Duration::from_millis(1500),
            root_max_bytes: 2048,
            app_max_bytes: 65536,
            app_path: "/cgi-bin/difff.pl".to_string(),
            marker: READY_MARKER.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Read-only installation tree.
    pub source_root: PathBuf,
    /// Writable tree the backend runs from.
    pub runtime_root: PathBuf,
    pub log_path: PathBuf,
    /// `uv` executable: a path, or a bare name looked up on `PATH`.
    pub uv_cmd: PathBuf,
    /// Preferred listen port; values outside 1..=65535 are treated as invalid.
    pub preferred_port: i64,
    /// Host the port negotiator test-binds on.
    pub bind_host: String,
    /// Host used in URLs handed to the probes and the window.
    pub url_host: String,
    pub sync_timeout: Duration,
    pub shutdown_grace: Duration,
    /// Characters of backend stderr retained for diagnostics.
    pub stderr_cap: usize,
    pub layout: RuntimeLayout,
    pub readiness: ReadinessSettings,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            source_root: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            runtime_root: default_runtime_root(),
            log_path: default_log_path(),
            uv_cmd: PathBuf::from("uv"),
            preferred_port: DEFAULT_PORT,
            bind_host: "0.0.0.0".to_string(),
            url_host: "127.0.0.1".to_string(),
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
            shutdown_grace: Duration::from_secs(3),
            stderr_cap: 8000,
            layout: RuntimeLayout::default(),
            readiness: ReadinessSettings::default(),
        }
    }
}

/// Per-user runtime root, or a per-process temporary one when no data home
/// can be determined.
pub fn default_runtime_root() -> PathBuf {
    xdg::BaseDirectories::with_prefix(APP_DIR_NAME)
        .get_data_home()
        .map(|home| home.join("runtime"))
        .unwrap_or_else(|| {
            std::env::temp_dir().join(format!("{}-runtime-{}", APP_DIR_NAME, std::process::id()))
        })
}

pub fn default_log_path() -> PathBuf {
    xdg::BaseDirectories::with_prefix(APP_DIR_NAME)
        .get_state_home()
        .unwrap_or_else(|| std::env::temp_dir().join(APP_DIR_NAME))
        .join("logs")
        .join("startup.log")
}
