//! Start and stop of the backend as one unit.

use difff_probes::ReadinessCheck;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backend::{BackendCommand, BackendProcess};
use crate::config::SupervisorConfig;
use crate::environment::{self, EnvironmentSync};
use crate::error::{StartError, SupervisorError};
use crate::ports::{self, PortChoice};
use crate::readiness;
use crate::runtime_root;
use crate::startup_log::StartupLog;

/// Outcome of a successful start, owned by the caller until it is stopped.
#[derive(Debug)]
pub struct ServerState {
    pub backend: BackendProcess,
    pub port: u16,
    /// Whether the preferred port was passed over.
    pub fallback_port: bool,
    pub app_url: String,
    /// Externally visible base URL handed to the backend.
    pub base_url: String,
    pub runtime_root: PathBuf,
    pub source_root: PathBuf,
    pub project_env: PathBuf,
    /// Full backend command line.
    pub command: String,
    log: StartupLog,
    cleanup: OnceCell<()>,
}

impl ServerState {
    pub fn build_id(&self) -> &str {
        self.log.build_id()
    }

    pub fn log_path(&self) -> &Path {
        self.log.path()
    }

    /// Terminate the backend and record `shutdown.complete`.
    ///
    /// Runs at most once; concurrent and later calls wait for the first.
    pub async fn shutdown(&self, grace: Duration) {
        self.cleanup
            .get_or_init(|| async {
                if self.backend.has_exited() {
                    debug!("Backend (PID {}) already exited", self.backend.pid());
                } else {
                    self.backend.terminate(grace).await;
                }
                self.log.info("shutdown.complete", Value::Null);
            })
            .await;
    }

    pub fn is_stopped(&self) -> bool {
        self.cleanup.initialized()
    }
}

/// Brings the backend up for one run and tears it down again.
#[derive(Debug, Clone)]
pub struct Supervisor {
    config: SupervisorConfig,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Provision, sync, launch, and wait until the application answers.
    ///
    /// Every failure is fatal to this attempt and is logged as
    /// `startup.failed` before being returned.
    pub async fn start(&self, build_id: &str) -> Result<ServerState, StartError> {
        self.start_until(build_id, &CancellationToken::new()).await
    }

    /// Like [`start`](Self::start), but abandons the attempt once `cancel`
    /// fires. A sync or backend child already launched is killed when the
    /// attempt is dropped.
    pub async fn start_until(
        &self,
        build_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ServerState, StartError> {
        let log = StartupLog::new(&self.config.log_path, build_id);
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SupervisorError::Cancelled),
            result = self.try_start(&log) => result,
        };
        match result {
            Ok(state) => Ok(state),
            Err(error) => {
                log.error("startup.failed", json!({ "error": error.to_string() }));
                Err(StartError {
                    build_id: build_id.to_string(),
                    log_path: Some(log.path().to_path_buf()),
                    error,
                })
            }
        }
    }

    /// Stop a started backend. `None` is a no-op.
    pub async fn stop(&self, state: Option<&ServerState>) {
        if let Some(state) = state {
            state.shutdown(self.config.shutdown_grace).await;
        }
    }

    async fn try_start(&self, log: &StartupLog) -> Result<ServerState, SupervisorError> {
        let config = &self.config;

        let runtime_root = {
            let source_root = config.source_root.clone();
            let runtime_root = config.runtime_root.clone();
            let layout = config.layout.clone();
            let log = log.clone();
            tokio::task::spawn_blocking(move || {
                runtime_root::provision(&source_root, &runtime_root, &layout, &log)
            })
            .await??
        };

        log.info(
            "startup.begin",
            json!({
                "source_root": config.source_root.display().to_string(),
                "runtime_root": runtime_root.display().to_string(),
                "preferred_port": config.preferred_port,
                "ready_timeout_ms": config.readiness.timeout.as_millis() as u64,
                "uv_sync_timeout_ms": config.sync_timeout.as_millis() as u64,
                "uv_cmd": config.uv_cmd.display().to_string(),
            }),
        );

        let uv_cmd = environment::resolve_uv(&config.uv_cmd)?;
        let sync = EnvironmentSync {
            uv_cmd: uv_cmd.clone(),
            runtime_root: runtime_root.clone(),
            project_dir: config.layout.project_dir.clone(),
            env_dir: config.layout.env_dir.clone(),
            timeout: config.sync_timeout,
        };
        let project_env = sync.ensure(log).await?;

        let PortChoice { port, fallback, .. } =
            ports::negotiate_port(&config.bind_host, config.preferred_port, log)?;

        let origin = format!("http://{}:{}", config.url_host, port);
        let base_url = format!("{}/{}/", origin, config.layout.serving_dir);
        let app_url = format!("{}{}", origin, config.readiness.app_path);

        let command = BackendCommand::cgi_server(
            &uv_cmd,
            &runtime_root,
            &config.layout.project_dir,
            &project_env,
            port,
            &base_url,
        );
        let backend = BackendProcess::spawn(&command, config.stderr_cap, log)?;

        let check = ReadinessCheck {
            root_url: format!("{}/", origin),
            app_url: app_url.clone(),
            marker: config.readiness.marker.clone(),
            root_max_bytes: config.readiness.root_max_bytes,
            app_max_bytes: config.readiness.app_max_bytes,
        };
        if let Err(e) = readiness::wait_until_ready(&backend, check, &config.readiness, log).await
        {
            backend.terminate(config.shutdown_grace).await;
            return Err(e);
        }

        let command_line = command.command_line();
        log.info(
            "startup.ready",
            json!({
                "app_url": app_url,
                "fallback_port": fallback,
                "port": port,
                "command": command_line,
            }),
        );

        Ok(ServerState {
            backend,
            port,
            fallback_port: fallback,
            app_url,
            base_url,
            runtime_root,
            source_root: config.source_root.clone(),
            project_env,
            command: command_line,
            log: log.clone(),
            cleanup: OnceCell::new(),
        })
    }
}
