//! [`ReconciliationLoop`] – periodic drift repair.
//!
//! Every tick probes the display and then checks application liveness
//! through the [`DesiredStateStore`], which holds the per-resource locks, so
//! a tick never interleaves with a `set_desired` on the same resource.
//! Repairs are best effort; the loop only ends on cancellation.

use std::sync::Arc;
use std::time::Duration;

use kiosk_types::Resource;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::DesiredStateStore;

/// Default tick period.
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(9);

/// Per-resource outcome of the most recent tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyncState {
    /// Not determinable this tick; nothing was done.
    #[default]
    Unknown,
    InSync,
    /// Drift was detected and a repair was attempted.
    Drifted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub display: SyncState,
    pub process: SyncState,
}

pub struct ReconciliationLoop {
    store: Arc<DesiredStateStore>,
    period: Duration,
    last: ReconcileReport,
}

impl ReconciliationLoop {
    pub fn new(store: Arc<DesiredStateStore>) -> Self {
        Self {
            store,
            period: DEFAULT_PERIOD,
            last: ReconcileReport::default(),
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub fn last_report(&self) -> ReconcileReport {
        self.last
    }

    /// Run one reconciliation pass: display first, then process.
    pub async fn tick(&mut self) -> ReconcileReport {
        let report = ReconcileReport {
            display: self.store.reconcile_display().await,
            process: self.store.reconcile_process().await,
        };
        self.log_transition(Resource::Display, self.last.display, report.display);
        self.log_transition(Resource::Process, self.last.process, report.process);
        self.last = report;
        report
    }

    fn log_transition(&self, resource: Resource, from: SyncState, to: SyncState) {
        match (from, to) {
            (_, SyncState::Drifted) => warn!(?resource, "drift repaired"),
            (SyncState::Drifted, SyncState::InSync) => info!(?resource, "back in sync"),
            (a, b) if a != b => debug!(?resource, from = ?a, to = ?b, "sync state changed"),
            _ => {}
        }
    }

    /// Tick every period until `token` is cancelled.  The first tick happens
    /// one full period after start.
    pub async fn run(mut self, token: CancellationToken) {
        let start = tokio::time::Instant::now() + self.period;
        let mut interval = tokio::time::interval_at(start, self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(period = ?self.period, "reconciliation loop started");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }
        info!("reconciliation loop stopped");
    }
}
