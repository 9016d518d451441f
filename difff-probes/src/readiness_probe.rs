use std::time::Duration;

use regex::Regex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::http_probe::{HttpProbe, ProbeResult};

/// The two-stage check that decides whether the backend serves the intended
/// application.
#[derive(Debug, Clone)]
pub struct ReadinessCheck {
    /// Liveness URL; any completed response counts.
    pub root_url: String,
    /// Application URL that must render the marker.
    pub app_url: String,
    /// Pattern identifying the application's entry page.
    pub marker: Regex,
    pub root_max_bytes: usize,
    pub app_max_bytes: usize,
}

impl ReadinessCheck {
    /// The application is ready when it answers exactly 200 with an HTML
    /// document containing the marker.
    pub fn app_is_ready(&self, app: &ProbeResult) -> bool {
        app.ok && app.status == 200 && app.is_html() && self.marker.is_match(&app.body)
    }
}

/// Last probe summaries, published after every poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeSnapshot {
    pub attempts: u32,
    pub root: Option<String>,
    pub app: Option<String>,
    pub app_status: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessOutcome {
    Ready(ProbeSnapshot),
    TimedOut(ProbeSnapshot),
}

/// Readiness probe that polls the backend until both checks pass or the
/// overall timeout elapses.
///
/// Spawns a background task. Call `recv()` to wait for the outcome and
/// `snapshot()` for the latest summaries at any time. Drop the probe to
/// cancel the background task; a dropped probe never reports again.
pub struct ReadinessProbe {
    rx: mpsc::Receiver<ReadinessOutcome>,
    progress: watch::Receiver<ProbeSnapshot>,
    task: JoinHandle<()>,
}

impl ReadinessProbe {
    /// Spawn a probe polling every `period` until `timeout` has elapsed.
    pub fn spawn(
        check: ReadinessCheck,
        http: HttpProbe,
        period: Duration,
        timeout: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<ReadinessOutcome>(1);
        let (progress_tx, progress) = watch::channel(ProbeSnapshot::default());

        let task = tokio::spawn(async move {
            debug!(
                "Starting readiness probe for {} (root {})",
                check.app_url, check.root_url
            );
            let deadline = Instant::now() + timeout;
            let mut snapshot = ProbeSnapshot::default();

            while Instant::now() < deadline {
                snapshot.attempts += 1;

                let root = http.fetch(&check.root_url, check.root_max_bytes).await;
                snapshot.root = Some(root.summary());

                if root.ok {
                    let app = http.fetch(&check.app_url, check.app_max_bytes).await;
                    snapshot.app = Some(app.summary());
                    snapshot.app_status = Some(app.status);

                    if check.app_is_ready(&app) {
                        info!(
                            "Readiness probe succeeded for {} after {} attempts",
                            check.app_url, snapshot.attempts
                        );
                        progress_tx.send_replace(snapshot.clone());
                        let _ = tx.send(ReadinessOutcome::Ready(snapshot)).await;
                        return;
                    }
                }

                progress_tx.send_replace(snapshot.clone());
                tokio::time::sleep(period).await;
            }

            debug!(
                "Readiness probe for {} timed out after {} attempts",
                check.app_url, snapshot.attempts
            );
            let _ = tx.send(ReadinessOutcome::TimedOut(snapshot)).await;
        });

        Self { rx, progress, task }
    }

    /// Wait for the probe outcome.
    ///
    /// Returns `None` if the probe task was cancelled.
    pub async fn recv(&mut self) -> Option<ReadinessOutcome> {
        self.rx.recv().await
    }

    /// Summaries from the most recent completed poll.
    pub fn snapshot(&self) -> ProbeSnapshot {
        self.progress.borrow().clone()
    }
}

impl Drop for ReadinessProbe {
    fn drop(&mut self) {
        self.task.abort();
    }
}
