//! Listen port negotiation for the backend.
//!
//! The preferred port is probed by binding and immediately releasing it. When
//! it is unusable the OS assigns an ephemeral port instead.

use serde_json::json;
use std::net::TcpListener;

use crate::error::PortError;
use crate::startup_log::StartupLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum FallbackReason {
    PreferredPortBusy,
    PreferredPortInvalid,
}

/// Port selected for the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortChoice {
    pub port: u16,
    /// Whether the preferred port was passed over.
    pub fallback: bool,
    pub reason: Option<FallbackReason>,
}

/// Pick a listen port, preferring `preferred` when it can be bound on `host`.
///
/// The port is released before returning, so another process may still take
/// it before the backend binds.
pub fn negotiate_port(
    host: &str,
    preferred: i64,
    log: &StartupLog,
) -> Result<PortChoice, PortError> {
    let reason = match u16::try_from(preferred) {
        Ok(port) if port != 0 => match TcpListener::bind((host, port)) {
            Ok(listener) => {
                drop(listener);
                return Ok(PortChoice {
                    port,
                    fallback: false,
                    reason: None,
                });
            }
            Err(e) => {
                tracing::debug!("Preferred port {} unavailable: {}", port, e);
                FallbackReason::PreferredPortBusy
            }
        },
        _ => FallbackReason::PreferredPortInvalid,
    };

    let port = {
        let listener = TcpListener::bind((host, 0))?;
        listener.local_addr()?.port()
    };

    log.warn(
        "port.fallback",
        json!({
            "reason": reason.to_string(),
            "preferred_port": preferred,
            "selected_port": port,
        }),
    );

    Ok(PortChoice {
        port,
        fallback: true,
        reason: Some(reason),
    })
}
