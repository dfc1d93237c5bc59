use std::time::{Duration, Instant};

use tokio::process::Child;
use tracing::{debug, warn};

/// Child processes a runner started and has not yet collected
///
/// Dispatchers hand over any child they could not wait for. The runner reaps
/// the table without blocking after every dispatch, and waits for whatever is
/// left, up to a bound, when it stops.
#[derive(Debug, Default)]
pub struct Children {
    children: Vec<Child>,
}

impl Children {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn adopt(&mut self, child: Child) {
        debug!(pid = child.id(), "Tracking child process");
        self.children.push(child);
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Collect every child that has already exited, without waiting.
    /// Returns how many were collected.
    pub fn reap(&mut self) -> usize {
        let before = self.children.len();

        self.children.retain_mut(|child| match child.try_wait() {
            Ok(Some(status)) => {
                debug!(pid = child.id(), %status, "Reaped child process");
                false
            }
            Ok(None) => true,
            Err(err) => {
                warn!(pid = child.id(), "Unable to poll child process: {err}");
                false
            }
        });

        before - self.children.len()
    }

    /// Wait for every remaining child, killing those still running once
    /// `timeout` has passed
    pub async fn reap_all(&mut self, timeout: Duration) {
        let deadline = Instant::now() + timeout;

        for mut child in self.children.drain(..) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, child.wait()).await {
                Ok(Ok(status)) => debug!(pid = child.id(), %status, "Reaped child process"),
                Ok(Err(err)) => warn!("Unable to wait for child process: {err}"),
                Err(_) => {
                    warn!(pid = child.id(), "Killing child process that outlived the runner");
                    if let Err(err) = child.kill().await {
                        warn!("Unable to kill child process: {err}");
                    }
                }
            }
        }
    }
}
