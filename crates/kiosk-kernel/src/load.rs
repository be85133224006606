//! [`LoadMonitor`] – restart the application under sustained CPU overload.
//!
//! A sample is taken every `interval`; the probe averages over the time since
//! its previous sample, so the interval is also the averaging window.  A
//! sample only counts while the kiosk is active (display desired on and
//! application desired running).  An overload sample triggers a restart
//! when the [`Cooldown`] allows it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kiosk_hal::LoadProbe;
use kiosk_types::{Event, EventPayload};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::store::DesiredStateStore;

pub const DEFAULT_THRESHOLD: f32 = 90.0;
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);
pub const DEFAULT_RESTART_PAUSE: Duration = Duration::from_secs(2);

/// Minimum spacing between forced actions.  Unarmed until the first one.
#[derive(Debug, Clone)]
pub struct Cooldown {
    period: Duration,
    last: Option<Instant>,
}

impl Cooldown {
    pub fn new(period: Duration) -> Self {
        Self { period, last: None }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn ready(&self, now: Instant) -> bool {
        self.remaining(now).is_zero()
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        match self.last {
            Some(last) => self.period.saturating_sub(now.saturating_duration_since(last)),
            None => Duration::ZERO,
        }
    }

    pub fn arm(&mut self, now: Instant) {
        self.last = Some(now);
    }
}

pub struct LoadMonitor {
    store: Arc<DesiredStateStore>,
    probe: Box<dyn LoadProbe>,
    threshold: f32,
    interval: Duration,
    pause: Duration,
    cooldown: Cooldown,
}

impl LoadMonitor {
    pub fn new(store: Arc<DesiredStateStore>, probe: Box<dyn LoadProbe>) -> Self {
        Self {
            store,
            probe,
            threshold: DEFAULT_THRESHOLD,
            interval: DEFAULT_INTERVAL,
            pause: DEFAULT_RESTART_PAUSE,
            cooldown: Cooldown::new(DEFAULT_COOLDOWN),
        }
    }

    pub fn with_threshold(mut self, percent: f32) -> Self {
        self.threshold = percent;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = Cooldown::new(cooldown);
        self
    }

    pub fn with_restart_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    /// Take one sample and act on it.  Returns `true` if a restart was
    /// performed.
    pub async fn sample(&mut self) -> bool {
        let cpu = self.probe.cpu_percent();
        self.evaluate(cpu).await
    }

    async fn evaluate(&mut self, cpu: f32) -> bool {
        if !self.store.is_active() {
            trace!(cpu, "kiosk inactive; load sample ignored");
            return false;
        }
        if cpu <= self.threshold {
            trace!(cpu, "load normal");
            return false;
        }
        let now = Instant::now();
        if !self.cooldown.ready(now) {
            debug!(cpu, remaining = ?self.cooldown.remaining(now), "overload during cooldown");
            return false;
        }

        warn!(cpu, threshold = self.threshold, "CPU overload; restarting application");
        self.cooldown.arm(now);
        self.store.bus().publish(Event::new(
            "kiosk-kernel::load",
            EventPayload::LoadRestart { cpu_percent: cpu },
        ));
        let until = chrono::Duration::from_std(self.cooldown.period())
            .ok()
            .map(|period| Utc::now() + period);
        match self.store.restart_process(self.pause, until).await {
            Ok(restarted) => restarted,
            Err(e) => {
                warn!(error = %e, "load restart failed");
                true
            }
        }
    }

    pub async fn run(mut self, token: CancellationToken) {
        let mut interval = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            threshold = self.threshold,
            interval = ?self.interval,
            cooldown = ?self.cooldown.period(),
            "load monitor started"
        );
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    self.sample().await;
                }
            }
        }
        info!("load monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::PowerActuator;
    use crate::supervisor::ProcessSupervisor;
    use kiosk_hal::sim::{Call, CallLog, SimDisplay, SimLauncher, SimLoad};
    use kiosk_middleware::EventBus;

    fn rig() -> (Arc<DesiredStateStore>, SimLoad, CallLog) {
        let log = CallLog::default();
        let store = Arc::new(DesiredStateStore::new(
            PowerActuator::new(Box::new(SimDisplay::new("HDMI-A-2", log.clone())))
                .with_settle(Duration::ZERO),
            ProcessSupervisor::new(Box::new(SimLauncher::new(log.clone()))),
            EventBus::default(),
        ));
        (store, SimLoad::new(log.clone()), log)
    }

    #[test]
    fn cooldown_is_open_until_armed() {
        let now = Instant::now();
        let mut c = Cooldown::new(Duration::from_secs(60));
        assert!(c.ready(now));
        c.arm(now);
        assert!(!c.ready(now + Duration::from_secs(59)));
        assert_eq!(c.remaining(now + Duration::from_secs(50)), Duration::from_secs(10));
        assert!(c.ready(now + Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn ten_overloaded_samples_restart_once() {
        let (store, load, log) = rig();
        store.set_desired(true, false).await.unwrap();
        load.set(97.0);
        log.clear();

        let token = CancellationToken::new();
        let handle =
            tokio::spawn(LoadMonitor::new(Arc::clone(&store), Box::new(load.clone())).run(token.clone()));

        tokio::time::sleep(DEFAULT_INTERVAL * 10 + Duration::from_millis(500)).await;
        token.cancel();
        handle.await.unwrap();

        assert!(log.count(Call::LoadSample) >= 9);
        assert_eq!(log.count(Call::Teardown), 1);
        assert_eq!(log.actions(), vec![Call::Teardown, Call::Launch]);
    }

    #[tokio::test(start_paused = true)]
    async fn restarts_again_after_cooldown() {
        let (store, load, log) = rig();
        store.set_desired(true, false).await.unwrap();
        load.set(99.0);

        let mut monitor = LoadMonitor::new(Arc::clone(&store), Box::new(load.clone()))
            .with_restart_pause(Duration::ZERO);
        assert!(monitor.sample().await);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!monitor.sample().await);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(monitor.sample().await);
        assert_eq!(log.count(Call::Teardown), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn inactive_kiosk_is_never_restarted() {
        let (store, load, log) = rig();
        load.set(100.0);
        let mut monitor = LoadMonitor::new(Arc::clone(&store), Box::new(load.clone()));
        assert!(!monitor.sample().await);
        assert!(log.actions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn threshold_is_exclusive() {
        let (store, load, log) = rig();
        store.set_desired(true, false).await.unwrap();
        log.clear();
        load.set(90.0);
        let mut monitor = LoadMonitor::new(Arc::clone(&store), Box::new(load.clone()));
        assert!(!monitor.sample().await);
        assert!(log.actions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_pauses_between_stop_and_start() {
        let (store, load, _log) = rig();
        store.set_desired(true, false).await.unwrap();
        load.set(95.0);
        let mut monitor = LoadMonitor::new(Arc::clone(&store), Box::new(load.clone()));

        let began = Instant::now();
        assert!(monitor.sample().await);
        assert!(began.elapsed() >= DEFAULT_RESTART_PAUSE);
        assert!(store.snapshot().process.restart_cooldown_until.is_some());
    }
}
