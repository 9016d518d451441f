//! Supervisor for the local difff CGI backend.
//!
//! A start provisions a writable runtime tree, makes the Python project
//! environment usable through `uv`, negotiates a listen port, launches the
//! server and waits until it renders the application page. Every step is
//! recorded in a rotating startup log.

pub mod backend;
pub mod config;
pub mod environment;
pub mod error;
pub mod ports;
pub mod readiness;
pub mod runtime_root;
pub mod startup_log;
pub mod supervisor;

pub use backend::{BackendCommand, BackendProcess, ExitInfo};
pub use config::{
    ReadinessSettings, RuntimeLayout, SupervisorConfig, clamp_timeout, default_log_path,
    default_runtime_root,
};
pub use environment::{EnvironmentSync, SyncMode, validate_project_env};
pub use error::{EnvironmentError, PortError, ProvisionError, StartError, SupervisorError};
pub use ports::{FallbackReason, PortChoice, negotiate_port};
pub use startup_log::{LogLevel, StartupLog};
pub use supervisor::{ServerState, Supervisor};
