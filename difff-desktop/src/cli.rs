use clap::Parser;
use difff_supervisor::config::{DEFAULT_PORT, DEFAULT_READY_TIMEOUT, DEFAULT_SYNC_TIMEOUT};
use difff_supervisor::{SupervisorConfig, clamp_timeout, default_log_path, default_runtime_root};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Older name of `DIFFF_DESKTOP_READY_TIMEOUT_SEC`, still honored.
const LEGACY_READY_TIMEOUT_ENV: &str = "DIFFF_DESKTOP_STARTUP_TIMEOUT_SEC";

#[derive(Parser, Debug)]
#[command(
    name = "difff-desktop",
    version,
    about = "Start the local difff server and keep it running until asked to quit."
)]
pub struct Cli {
    #[arg(short, long, help = "Enable debug log level.")]
    pub verbose: bool,

    #[arg(
        long,
        env = "DIFFF_BUILD_ID",
        default_value = "unknown",
        help = "Build identifier recorded in every log entry."
    )]
    pub build_id: String,

    #[arg(
        long,
        env = "DIFFF_DESKTOP_PORT",
        default_value_t = DEFAULT_PORT,
        allow_negative_numbers = true,
        help = "Preferred listen port. A random port is used if it is busy or invalid."
    )]
    pub port: i64,

    #[arg(
        long,
        env = "DIFFF_DESKTOP_READY_TIMEOUT_SEC",
        value_name = "SECS",
        help = "Seconds to wait for the server to become ready (minimum 10)."
    )]
    pub ready_timeout: Option<u64>,

    #[arg(
        long,
        env = "DIFFF_DESKTOP_UV_SYNC_TIMEOUT_SEC",
        value_name = "SECS",
        help = "Seconds allowed for each `uv sync` attempt (minimum 10)."
    )]
    pub uv_sync_timeout: Option<u64>,

    #[arg(
        long,
        env = "DIFFF_DESKTOP_RUNTIME_ROOT",
        help = "Writable directory the server runs from."
    )]
    pub runtime_root: Option<PathBuf>,

    #[arg(
        long,
        env = "DIFFF_DESKTOP_ROOT",
        help = "Installation tree to copy the application from. Defaults to the current directory."
    )]
    pub root: Option<PathBuf>,

    #[arg(
        long,
        env = "DIFFF_UV_CMD",
        default_value = "uv",
        help = "Path to the uv executable, or a name to look up on PATH."
    )]
    pub uv_cmd: PathBuf,

    #[arg(long, env = "DIFFF_DESKTOP_LOG_FILE", help = "Startup log location.")]
    pub log_file: Option<PathBuf>,
}

impl Cli {
    pub fn into_config(self) -> SupervisorConfig {
        let legacy_ready = std::env::var(LEGACY_READY_TIMEOUT_ENV).ok();
        self.into_config_with(legacy_ready.as_deref())
    }

    fn into_config_with(self, legacy_ready_timeout: Option<&str>) -> SupervisorConfig {
        let ready_timeout = self
            .ready_timeout
            .or_else(|| legacy_ready_timeout.and_then(|v| v.trim().parse().ok()))
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_READY_TIMEOUT);
        let sync_timeout = self
            .uv_sync_timeout
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_SYNC_TIMEOUT);

        let mut config = SupervisorConfig {
            source_root: self
                .root
                .map(|p| absolute(&p))
                .unwrap_or_else(|| absolute(Path::new("."))),
            runtime_root: self
                .runtime_root
                .map(|p| absolute(&p))
                .unwrap_or_else(default_runtime_root),
            log_path: self.log_file.unwrap_or_else(default_log_path),
            uv_cmd: self.uv_cmd,
            preferred_port: self.port,
            sync_timeout: clamp_timeout(sync_timeout),
            ..Default::default()
        };
        config.readiness.timeout = clamp_timeout(ready_timeout);
        config
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
