//! Readiness polling raced against backend exit.

use difff_probes::{HttpProbe, ProbeSnapshot, ReadinessCheck, ReadinessOutcome, ReadinessProbe};
use serde_json::json;

use crate::backend::BackendProcess;
use crate::config::ReadinessSettings;
use crate::error::SupervisorError;
use crate::startup_log::StartupLog;

/// Wait until the backend serves the application page, failing as soon as
/// the backend exits.
///
/// The probe is dropped as soon as either side finishes, so a late result
/// from the losing side is never observed.
pub async fn wait_until_ready(
    backend: &BackendProcess,
    check: ReadinessCheck,
    settings: &ReadinessSettings,
    log: &StartupLog,
) -> Result<ProbeSnapshot, SupervisorError> {
    let http = HttpProbe::new(settings.request_timeout)?;
    let app_url = check.app_url.clone();
    let marker = check.marker.as_str().to_string();
    let mut probe = ReadinessProbe::spawn(check, http, settings.poll_interval, settings.timeout);

    tokio::select! {
        outcome = probe.recv() => match outcome {
            Some(ReadinessOutcome::Ready(snapshot)) => {
                log.info(
                    "ready.ok",
                    json!({
                        "root": snapshot.root,
                        "cgi_status": snapshot.app_status,
                        "marker": marker,
                    }),
                );
                Ok(snapshot)
            }
            Some(ReadinessOutcome::TimedOut(snapshot)) => Err(SupervisorError::ReadinessTimeout {
                app_url,
                detail: timeout_detail(&snapshot, &backend.stderr_tail()),
            }),
            None => Err(SupervisorError::ReadinessTimeout {
                app_url,
                detail: timeout_detail(&probe.snapshot(), &backend.stderr_tail()),
            }),
        },
        exit = backend.wait() => Err(SupervisorError::Launch {
            exit,
            stderr: backend.stderr_tail(),
        }),
    }
}

/// Last probe summaries and the stderr tail, one per line, empty parts
/// omitted.
pub fn timeout_detail(snapshot: &ProbeSnapshot, stderr: &str) -> String {
    let mut lines = Vec::new();
    if let Some(root) = snapshot.root.as_deref().filter(|s| !s.is_empty()) {
        lines.push(format!("root_probe={}", root));
    }
    if let Some(app) = snapshot.app.as_deref().filter(|s| !s.is_empty()) {
        lines.push(format!("cgi_probe={}", app));
    }
    if !stderr.is_empty() {
        lines.push(stderr.to_string());
    }
    lines.join("\n")
}
