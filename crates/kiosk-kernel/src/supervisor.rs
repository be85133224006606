//! [`ProcessSupervisor`] – lifecycle bookkeeping for the foreground
//! application.

use std::time::Duration;

use chrono::{DateTime, Utc};
use kiosk_hal::AppLauncher;
use kiosk_types::KioskError;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Time a start script gets to bring the application up before a missing
/// process counts as a crash.
pub const DEFAULT_STARTUP_GRACE: Duration = Duration::from_secs(20);

pub struct ProcessSupervisor {
    launcher: Box<dyn AppLauncher>,
    observed_running: bool,
    last_start_at: Option<DateTime<Utc>>,
    started: Option<Instant>,
    startup_grace: Duration,
}

impl ProcessSupervisor {
    /// No startup grace; see [`with_startup_grace`][Self::with_startup_grace].
    pub fn new(launcher: Box<dyn AppLauncher>) -> Self {
        Self {
            launcher,
            observed_running: false,
            last_start_at: None,
            started: None,
            startup_grace: Duration::ZERO,
        }
    }

    pub fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    /// `true` while the last launch is younger than the startup grace.
    pub fn in_startup_grace(&self) -> bool {
        self.started
            .is_some_and(|started| started.elapsed() < self.startup_grace)
    }

    /// Launch the application.
    ///
    /// No-op when already marked running, unless `force` is set.  A failed
    /// launch leaves the application marked not running.
    pub async fn start(&mut self, force: bool) -> Result<(), KioskError> {
        if self.observed_running && !force {
            debug!("application already running; start skipped");
            return Ok(());
        }
        self.last_start_at = Some(Utc::now());
        self.started = Some(Instant::now());
        match self.launcher.launch().await {
            Ok(()) => {
                self.observed_running = true;
                Ok(())
            }
            Err(e) => {
                self.observed_running = false;
                warn!(error = %e, "application launch failed");
                Err(e)
            }
        }
    }

    /// Tear the application down.  Marks it not running before the teardown
    /// command runs, whatever the command's outcome.
    pub async fn stop(&mut self) -> Result<(), KioskError> {
        self.observed_running = false;
        self.launcher.teardown().await.inspect_err(|e| {
            warn!(error = %e, "application teardown failed");
        })
    }

    /// Live liveness probe, `None` when the backend cannot tell.
    ///
    /// A definite answer also refreshes the in-memory flag.
    pub async fn liveness(&mut self) -> Option<bool> {
        let alive = self.launcher.is_alive().await;
        if let Some(alive) = alive {
            self.observed_running = alive;
        }
        alive
    }

    /// Live check, falling back to the in-memory flag when the backend
    /// cannot determine liveness.
    pub async fn is_running(&mut self) -> bool {
        self.liveness().await.unwrap_or(self.observed_running)
    }

    pub fn observed_running(&self) -> bool {
        self.observed_running
    }

    pub fn last_start_at(&self) -> Option<DateTime<Utc>> {
        self.last_start_at
    }
}
