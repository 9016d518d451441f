//! Shutdown requests for the desktop shell.
//!
//! OS termination signals and programmatic quit requests are folded into a
//! single cancellation token. Exactly one task is expected to wait on it and
//! run the teardown; repeated requests only record the latest signal.

pub use nix::sys::signal::Signal;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Shutdown request channel shared between signal handlers and the shell.
pub struct Shutdown {
    token: CancellationToken,
    last_signal: AtomicI32,
}

impl std::fmt::Debug for Shutdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shutdown")
            .field("token", &self.token)
            .field("last_signal", &self.last_signal())
            .finish()
    }
}

impl Shutdown {
    /// Create a new Shutdown instance wrapped in Arc
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            token: CancellationToken::new(),
            last_signal: AtomicI32::new(0),
        })
    }

    /// Request shutdown. Calling this more than once has no further effect.
    pub fn shutdown(&self) {
        if !self.token.is_cancelled() {
            debug!("Shutdown requested");
        }
        self.token.cancel();
    }

    /// Install SIGINT, SIGTERM and SIGHUP handlers that request shutdown.
    ///
    /// A signal arriving while shutdown is already in progress is recorded
    /// but does not start anything new: the task consuming
    /// [`wait_for_shutdown`](Self::wait_for_shutdown) owns the teardown.
    pub fn install_signals(self: &Arc<Self>) -> std::io::Result<()> {
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;
        let shutdown = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = sigint.recv() => Signal::SIGINT,
                    _ = sigterm.recv() => Signal::SIGTERM,
                    _ = sighup.recv() => Signal::SIGHUP,
                };

                if shutdown.is_cancelled() {
                    info!(
                        "Received {:?} while shutting down, waiting for cleanup to finish",
                        received
                    );
                } else {
                    info!("Received {:?}, shutting down gracefully...", received);
                }

                shutdown.set_last_signal(received);
                shutdown.shutdown();
            }
        });

        Ok(())
    }

    /// Wait for shutdown to be requested
    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// Check if shutdown has been triggered
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Get a clone of the cancellation token.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Get the last signal that was received, if any.
    pub fn last_signal(&self) -> Option<Signal> {
        match self.last_signal.load(Ordering::Relaxed) {
            0 => None,
            i => Signal::try_from(i).ok(),
        }
    }

    pub fn set_last_signal(&self, signal: Signal) {
        self.last_signal.store(signal as i32, Ordering::Relaxed);
    }
}
