//! [`Supervisor`] – builds the kernel and runs its workers.
//!
//! All long-lived workers and the one-shot boot activation share a single
//! [`CancellationToken`]; [`Supervisor::shutdown`] cancels it and waits for
//! every worker to finish.

use std::sync::Arc;
use std::time::Duration;

use kiosk_hal::{AppLauncher, DisplayPower, LoadProbe, PresenceSource};
use kiosk_kernel::{
    DesiredStateStore, LoadMonitor, PowerActuator, PresenceWatcher, ProcessSupervisor,
    ReconciliationLoop, actuator, load, presence, reconcile, supervisor,
};
use kiosk_middleware::EventBus;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Default delay between start and the first forced activation.
pub const DEFAULT_BOOT_GRACE: Duration = Duration::from_secs(90);

#[derive(Debug, Clone, PartialEq)]
pub struct PresenceSettings {
    pub quiet: Duration,
    pub rediscover: Duration,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            quiet: presence::DEFAULT_QUIET,
            rediscover: presence::DEFAULT_REDISCOVER,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadSettings {
    pub max_cpu_percent: f32,
    pub interval: Duration,
    pub cooldown: Duration,
    pub restart_pause: Duration,
}

impl Default for LoadSettings {
    fn default() -> Self {
        Self {
            max_cpu_percent: load::DEFAULT_THRESHOLD,
            interval: load::DEFAULT_INTERVAL,
            cooldown: load::DEFAULT_COOLDOWN,
            restart_pause: load::DEFAULT_RESTART_PAUSE,
        }
    }
}

/// Timing and policy for the supervised kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorConfig {
    pub boot_grace: Duration,
    pub activate_on_boot: bool,
    pub reconcile_period: Duration,
    /// Delay between a power command and its verification probe.
    pub settle: Duration,
    /// A launched application missing from the process table is not
    /// relaunched until this much time has passed.
    pub startup_grace: Duration,
    pub presence: PresenceSettings,
    pub load: LoadSettings,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            boot_grace: DEFAULT_BOOT_GRACE,
            activate_on_boot: true,
            reconcile_period: reconcile::DEFAULT_PERIOD,
            settle: actuator::DEFAULT_SETTLE,
            startup_grace: supervisor::DEFAULT_STARTUP_GRACE,
            presence: PresenceSettings::default(),
            load: LoadSettings::default(),
        }
    }
}

/// OS backends handed to the kernel.  A `None` presence source or load
/// probe disables that worker.
pub struct Backends {
    pub display: Box<dyn DisplayPower>,
    pub launcher: Box<dyn AppLauncher>,
    pub presence: Option<Box<dyn PresenceSource>>,
    pub load: Option<Box<dyn LoadProbe>>,
}

pub struct Supervisor {
    store: Arc<DesiredStateStore>,
    token: CancellationToken,
    workers: Vec<(&'static str, JoinHandle<()>)>,
}

impl Supervisor {
    /// Build the store and spawn all workers.  Must run inside a Tokio
    /// runtime.
    pub fn start(config: SupervisorConfig, backends: Backends, bus: EventBus) -> Self {
        let store = Arc::new(DesiredStateStore::new(
            PowerActuator::new(backends.display).with_settle(config.settle),
            ProcessSupervisor::new(backends.launcher).with_startup_grace(config.startup_grace),
            bus,
        ));
        let token = CancellationToken::new();
        let mut workers = Vec::new();

        let reconciler =
            ReconciliationLoop::new(Arc::clone(&store)).with_period(config.reconcile_period);
        workers.push(("reconcile", tokio::spawn(reconciler.run(token.clone()))));

        match backends.presence {
            Some(source) => {
                let watcher = PresenceWatcher::new(Arc::clone(&store), source)
                    .with_quiet(config.presence.quiet)
                    .with_rediscover(config.presence.rediscover);
                workers.push(("presence", tokio::spawn(watcher.run(token.clone()))));
            }
            None => info!("presence watcher disabled"),
        }

        match backends.load {
            Some(probe) => {
                let monitor = LoadMonitor::new(Arc::clone(&store), probe)
                    .with_threshold(config.load.max_cpu_percent)
                    .with_interval(config.load.interval)
                    .with_cooldown(config.load.cooldown)
                    .with_restart_pause(config.load.restart_pause);
                workers.push(("load", tokio::spawn(monitor.run(token.clone()))));
            }
            None => info!("load monitor disabled"),
        }

        if config.activate_on_boot {
            workers.push((
                "boot",
                tokio::spawn(activate_after_grace(
                    Arc::clone(&store),
                    config.boot_grace,
                    token.clone(),
                )),
            ));
        } else {
            info!("boot activation disabled");
        }

        info!(workers = workers.len(), "supervisor started");
        Self {
            store,
            token,
            workers,
        }
    }

    pub fn store(&self) -> Arc<DesiredStateStore> {
        Arc::clone(&self.store)
    }

    /// Token cancelled on shutdown, for tasks that should stop with the
    /// workers (e.g. protocol adapters).
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub async fn shutdown(self) {
        info!("supervisor shutting down");
        self.token.cancel();
        for (name, handle) in self.workers {
            if let Err(e) = handle.await {
                error!(worker = name, error = %e, "worker ended abnormally");
            }
        }
        info!("supervisor stopped");
    }
}

async fn activate_after_grace(
    store: Arc<DesiredStateStore>,
    grace: Duration,
    token: CancellationToken,
) {
    tokio::select! {
        _ = token.cancelled() => return,
        _ = tokio::time::sleep(grace) => {}
    }
    info!(grace = ?grace, "boot grace elapsed; activating");
    if let Err(e) = store.set_desired(true, true).await {
        warn!(error = %e, "boot activation incomplete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiosk_hal::sim::{Call, CallLog, SimDisplay, SimLauncher, SimLoad, SimPresence};
    use kiosk_types::PowerState;

    fn backends(log: &CallLog) -> Backends {
        Backends {
            display: Box::new(SimDisplay::new("HDMI-A-2", log.clone())),
            launcher: Box::new(SimLauncher::new(log.clone())),
            presence: Some(Box::new(SimPresence::new(log.clone()))),
            load: Some(Box::new(SimLoad::new(log.clone()))),
        }
    }

    fn config() -> SupervisorConfig {
        SupervisorConfig {
            settle: Duration::ZERO,
            ..SupervisorConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn activates_once_after_boot_grace() {
        let log = CallLog::default();
        let supervisor = Supervisor::start(config(), backends(&log), EventBus::default());

        tokio::time::sleep(DEFAULT_BOOT_GRACE - Duration::from_secs(1)).await;
        assert_eq!(log.count(Call::Launch), 0);
        assert_eq!(log.count(Call::PowerCommand(true)), 0);
        // Reconciliation has probed but not repaired anything yet.
        assert_eq!(supervisor.store().observed_on(), PowerState::Off);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(log.count(Call::Launch), 1);
        assert_eq!(log.count(Call::PowerCommand(true)), 1);
        assert_eq!(supervisor.store().observed_on(), PowerState::On);

        supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn boot_activation_can_be_disabled() {
        let log = CallLog::default();
        let cfg = SupervisorConfig {
            activate_on_boot: false,
            ..config()
        };
        let supervisor = Supervisor::start(cfg, backends(&log), EventBus::default());

        tokio::time::sleep(DEFAULT_BOOT_GRACE * 2).await;
        assert_eq!(log.count(Call::Launch), 0);
        supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_every_worker() {
        let log = CallLog::default();
        let supervisor = Supervisor::start(config(), backends(&log), EventBus::default());
        let token = supervisor.token();

        tokio::time::sleep(Duration::from_secs(1)).await;
        tokio::time::timeout(Duration::from_secs(5), supervisor.shutdown())
            .await
            .expect("shutdown must complete");
        assert!(token.is_cancelled());

        let before = log.calls().len();
        tokio::time::sleep(DEFAULT_BOOT_GRACE * 2).await;
        assert_eq!(log.calls().len(), before, "no activity after shutdown");
    }

    #[tokio::test(start_paused = true)]
    async fn optional_workers_can_be_left_out() {
        let log = CallLog::default();
        let backends = Backends {
            presence: None,
            load: None,
            ..backends(&log)
        };
        let supervisor = Supervisor::start(config(), backends, EventBus::default());
        assert_eq!(supervisor.workers.len(), 2);
        supervisor.shutdown().await;
        assert_eq!(log.count(Call::PresenceOpen), 0);
    }
}
