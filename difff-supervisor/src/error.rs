use miette::Diagnostic;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::backend::ExitInfo;
use crate::environment::SyncMode;

/// Failures while materializing the runtime tree.
#[derive(Error, Diagnostic, Debug)]
pub enum ProvisionError {
    #[error("failed to create directory {}: {source}", .path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to copy {} to {}: {source}", .from.display(), .to.display())]
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to walk {}: {source}", .path.display())]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
    #[error("failed to write launcher shim {}: {source}", .path.display())]
    Shim {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failures while making the project environment usable.
#[derive(Error, Diagnostic, Debug)]
pub enum EnvironmentError {
    #[error("uv command not found: {}", .0.display())]
    #[diagnostic(help("install uv or point DIFFF_UV_CMD at the uv executable"))]
    ToolMissing(PathBuf),

    #[error(
        "uv sync timed out after {}s ({mode} mode){}",
        .timeout.as_secs_f64(),
        sentence_detail(.detail)
    )]
    #[diagnostic(help("raise DIFFF_DESKTOP_UV_SYNC_TIMEOUT_SEC if dependency resolution is slow"))]
    SyncTimedOut {
        mode: SyncMode,
        timeout: Duration,
        /// Whatever the tool printed before it was killed.
        detail: String,
    },

    #[error("uv sync failed. {detail}")]
    SyncFailed { detail: String },

    #[error("python in project environment is not usable: {}", .0.display())]
    Unusable(PathBuf),
}

#[derive(Error, Diagnostic, Debug)]
#[error("no TCP port could be allocated: {source}")]
pub struct PortError {
    #[from]
    pub source: std::io::Error,
}

/// Everything that can abort a single start attempt.
#[derive(Error, Diagnostic, Debug)]
pub enum SupervisorError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Provisioning(#[from] ProvisionError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Environment(#[from] EnvironmentError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Port(#[from] PortError),

    #[error("runtime provisioning task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("CGI server exited early ({exit}). {stderr}")]
    Launch { exit: ExitInfo, stderr: String },

    #[error("CGI server did not become ready: {app_url}{}", prefixed_detail(.detail))]
    ReadinessTimeout { app_url: String, detail: String },

    #[error("startup cancelled by a shutdown request")]
    Cancelled,
}

fn sentence_detail(detail: &str) -> String {
    if detail.is_empty() {
        String::new()
    } else {
        format!(". {}", detail)
    }
}

fn prefixed_detail(detail: &str) -> String {
    if detail.is_empty() {
        String::new()
    } else {
        format!("\n{}", detail)
    }
}

/// A failed start, carrying what the shell needs to tell the user.
#[derive(Error, Diagnostic, Debug)]
#[error("{error}")]
#[diagnostic(forward(error))]
pub struct StartError {
    pub build_id: String,
    /// Startup log that holds the full record of the attempt.
    pub log_path: Option<PathBuf>,
    pub error: SupervisorError,
}

impl StartError {
    /// Consolidated message for the failure dialog.
    pub fn user_message(&self) -> String {
        let mut lines = vec![format!("BUILD_ID: {}", self.build_id), self.error.to_string()];
        if let Some(path) = &self.log_path {
            lines.push(format!("startup.log: {}", path.display()));
        }
        lines.join("\n\n")
    }
}
