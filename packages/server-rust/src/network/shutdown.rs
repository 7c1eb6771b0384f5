//! Dashboard lifecycle: health reporting, admission of task submissions and
//! draining on shutdown.
//!
//! The health state lives in an `ArcSwap` so every request can read it
//! without locking. Submissions being handled are counted in a watch channel;
//! draining waits for that count to reach zero.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;
use tracing::{info, warn};

/// Where the dashboard is in its life.
///
/// `Starting` until the listener serves, `Ready` while taking submissions,
/// `Draining` once shutdown begins, `Stopped` when no submission is left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Starting,
    Ready,
    Draining,
    Stopped,
}

impl HealthState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            HealthState::Starting => "starting",
            HealthState::Ready => "ready",
            HealthState::Draining => "draining",
            HealthState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared by the router, the admission middleware and the serve loop.
#[derive(Debug)]
pub struct ShutdownController {
    state: ArcSwap<HealthState>,
    draining: watch::Sender<bool>,
    open: Arc<watch::Sender<usize>>,
}

impl ShutdownController {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ArcSwap::from_pointee(HealthState::Starting),
            draining: watch::Sender::new(false),
            open: Arc::new(watch::Sender::new(0)),
        }
    }

    pub fn set_ready(&self) {
        self.state.store(Arc::new(HealthState::Ready));
    }

    /// Flips to `true` when draining begins.
    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.draining.subscribe()
    }

    /// Stops admitting submissions. Only the first call has any effect, and a
    /// stopped controller stays stopped.
    pub fn trigger_shutdown(&self) {
        if self.draining.send_replace(true) {
            return;
        }
        self.state.rcu(|current| match **current {
            HealthState::Stopped => Arc::clone(current),
            _ => Arc::new(HealthState::Draining),
        });
        info!(open = self.open_submissions(), "dashboard draining");
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        **self.state.load()
    }

    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.health_state() == HealthState::Ready
    }

    /// Counts a submission as open until the returned guard drops.
    #[must_use]
    pub fn track_submission(&self) -> SubmissionGuard {
        self.open.send_modify(|n| *n += 1);
        SubmissionGuard {
            open: Arc::clone(&self.open),
        }
    }

    #[must_use]
    pub fn open_submissions(&self) -> usize {
        *self.open.borrow()
    }

    /// Waits up to `limit` for open submissions to finish. On success the
    /// state becomes `Stopped` and `true` is returned.
    pub async fn wait_for_drain(&self, limit: Duration) -> bool {
        let mut open = self.open.subscribe();
        let drained = matches!(
            tokio::time::timeout(limit, open.wait_for(|n| *n == 0)).await,
            Ok(Ok(_))
        );
        if !drained {
            warn!(open = self.open_submissions(), "drain limit reached");
            return false;
        }
        self.state.store(Arc::new(HealthState::Stopped));
        true
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// An admitted submission; dropping it closes the submission.
#[derive(Debug)]
pub struct SubmissionGuard {
    open: Arc<watch::Sender<usize>>,
}

impl Drop for SubmissionGuard {
    fn drop(&mut self) {
        self.open.send_modify(|n| *n = n.saturating_sub(1));
    }
}
