mod cli;
mod log;

use clap::Parser;
use difff_shutdown::Shutdown;
use difff_supervisor::{Supervisor, SupervisorError};
use miette::{IntoDiagnostic, Result};
use std::process::ExitCode;
use tracing::{info, warn};

use crate::cli::Cli;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    log::init_tracing(cli.verbose);

    let shutdown = Shutdown::new();
    shutdown.install_signals().into_diagnostic()?;

    let build_id = cli.build_id.clone();
    let supervisor = Supervisor::new(cli.into_config());

    let state = match supervisor
        .start_until(&build_id, &shutdown.cancellation_token())
        .await
    {
        Ok(state) => state,
        Err(err) if matches!(err.error, SupervisorError::Cancelled) => {
            info!("Startup abandoned after shutdown request");
            return Ok(exit_code(&shutdown, ExitCode::FAILURE));
        }
        Err(err) => {
            eprintln!("{}", err.user_message());
            return Ok(ExitCode::FAILURE);
        }
    };

    println!("{}", state.app_url);
    info!(
        "Serving {} (PID {}, log {})",
        state.app_url,
        state.backend.pid(),
        state.log_path().display()
    );

    let mut outcome = ExitCode::SUCCESS;
    tokio::select! {
        _ = shutdown.wait_for_shutdown() => {}
        exit = state.backend.wait() => {
            warn!("Backend exited unexpectedly ({})", exit);
            outcome = ExitCode::FAILURE;
        }
    }

    supervisor.stop(Some(&state)).await;

    Ok(exit_code(&shutdown, outcome))
}

/// `128 + signal` after a signal-driven shutdown, `otherwise` if none arrived.
fn exit_code(shutdown: &Shutdown, otherwise: ExitCode) -> ExitCode {
    match shutdown.last_signal() {
        Some(signal) => ExitCode::from(128 + signal as u8),
        None => otherwise,
    }
}
