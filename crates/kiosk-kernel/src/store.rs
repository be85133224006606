//! [`DesiredStateStore`] – single source of truth for desired and observed
//! state of the display and the foreground application.
//!
//! # Locking
//!
//! Each resource has its own async mutex which also owns that resource's
//! actuator (`PowerActuator` / `ProcessSupervisor`), so at most one command
//! per resource is ever in flight.  When both are needed they are taken in
//! the fixed order display → process.
//!
//! # Observed state
//!
//! Observed display power only ever moves to a *verified* value.  A probe or
//! verification that yields `Unknown` leaves the last verified value in
//! place.  Listeners fire exactly once per change of that value, after the
//! snapshot has been updated.  Every change is also published on the
//! [`EventBus`].
//!
//! Before the first call to [`DesiredStateStore::set_desired`] the desired
//! state is only the boot baseline; reconciliation observes but does not
//! repair until something has been declared.

use std::time::Duration;

use chrono::{DateTime, Utc};
use kiosk_middleware::EventBus;
use kiosk_types::{
    DisplayState, Event, EventPayload, KioskError, PowerState, ProcessState, Resource,
    StatusSnapshot,
};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::actuator::PowerActuator;
use crate::listeners::{Listener, ListenerRegistry};
use crate::reconcile::SyncState;
use crate::supervisor::ProcessSupervisor;

const SOURCE: &str = "kiosk-kernel::store";

struct DisplaySlot {
    state: DisplayState,
    actuator: PowerActuator,
    declared: bool,
}

struct ProcessSlot {
    state: ProcessState,
    supervisor: ProcessSupervisor,
}

impl ProcessSlot {
    /// Copy the supervisor's bookkeeping into the public state.  Returns
    /// `true` if the observed running flag changed.
    fn sync(&mut self) -> bool {
        let running = self.supervisor.observed_running();
        let changed = self.state.observed_running != running;
        self.state.observed_running = running;
        self.state.last_start_at = self.supervisor.last_start_at();
        changed
    }
}

pub struct DesiredStateStore {
    display: Mutex<DisplaySlot>,
    process: Mutex<ProcessSlot>,
    snapshot: watch::Sender<StatusSnapshot>,
    listeners: ListenerRegistry,
    bus: EventBus,
}

impl DesiredStateStore {
    /// Both resources start from the off baseline with unverified display
    /// power.
    pub fn new(actuator: PowerActuator, supervisor: ProcessSupervisor, bus: EventBus) -> Self {
        let (snapshot, _) = watch::channel(StatusSnapshot::default());
        Self {
            display: Mutex::new(DisplaySlot {
                state: DisplayState::default(),
                actuator,
                declared: false,
            }),
            process: Mutex::new(ProcessSlot {
                state: ProcessState::default(),
                supervisor,
            }),
            snapshot,
            listeners: ListenerRegistry::new(),
            bus,
        }
    }

    // ── Reads ───────────────────────────────────────────────────────────────

    /// Last verified display power.  Never waits on an in-flight command.
    pub fn observed_on(&self) -> PowerState {
        self.snapshot.borrow().display.observed
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver that is woken on every snapshot update.
    pub fn watch(&self) -> watch::Receiver<StatusSnapshot> {
        self.snapshot.subscribe()
    }

    /// Display desired on and application desired running.
    pub fn is_active(&self) -> bool {
        let snap = self.snapshot.borrow();
        snap.display.desired_on && snap.process.desired_running
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    // ── Listeners ───────────────────────────────────────────────────────────

    /// Register a callback fired whenever observed display power changes.
    /// Returns `false` if this exact listener was already registered.
    pub fn add_listener(&self, listener: Listener) -> bool {
        self.listeners.add(listener)
    }

    // ── Desired state ───────────────────────────────────────────────────────

    /// Declare whether the display should be on.
    ///
    /// On: start the application, then power the display on.  Off: power the
    /// display off, then stop the application.  With `force == false` an
    /// unchanged desired value performs no backend call at all.
    ///
    /// Both steps are always attempted; the first failure is returned after
    /// the observed state has been updated.  `Ok` carries the observed
    /// display power afterwards.
    pub async fn set_desired(&self, on: bool, force: bool) -> Result<PowerState, KioskError> {
        let mut slot = self.display.lock().await;
        if slot.state.desired_on == on && !force {
            debug!(on, "desired state unchanged");
            slot.declared = true;
            return Ok(slot.state.observed);
        }
        let mut process = self.process.lock().await;

        info!(on, force, "desired state set");
        slot.declared = true;
        slot.state.desired_on = on;
        process.state.desired_running = on;
        self.publish_display(&slot.state);
        self.publish_process(&process.state);

        let (process_result, power_result) = if on {
            let p = self.start_process(&mut process, force).await;
            let d = self.apply_power(&mut slot, true).await;
            (p, d)
        } else {
            let d = self.apply_power(&mut slot, false).await;
            let p = self.stop_process(&mut process).await;
            (p, d)
        };

        let observed = slot.state.observed;
        if on {
            process_result.and(power_result).map(|()| observed)
        } else {
            power_result.and(process_result).map(|()| observed)
        }
    }

    // ── Reconciliation ──────────────────────────────────────────────────────

    /// Probe the display and repair drift from the desired value.
    pub async fn reconcile_display(&self) -> SyncState {
        let mut slot = self.display.lock().await;
        let observed = self.probe_display(&slot.actuator).await;
        let Some(actual) = observed.as_bool() else {
            debug!(output = %slot.actuator.output(), "display state unknown; skipping tick");
            return SyncState::Unknown;
        };
        self.record_display(&mut slot, observed);

        if !slot.declared {
            return SyncState::Unknown;
        }
        let desired = slot.state.desired_on;
        if actual == desired {
            return SyncState::InSync;
        }

        warn!(
            output = %slot.actuator.output(),
            desired = %PowerState::from_bool(desired),
            actual = %observed,
            "display drift; re-issuing power command"
        );
        let result = self.apply_power(&mut slot, desired).await;
        self.publish_repair(
            Resource::Display,
            match &result {
                Ok(()) => format!("re-issued power {}", PowerState::from_bool(desired)),
                Err(e) => format!("power repair failed: {e}"),
            },
        );
        SyncState::Drifted
    }

    /// Check application liveness and relaunch it if it should be running
    /// but is not.
    pub async fn reconcile_process(&self) -> SyncState {
        let mut process = self.process.lock().await;
        let liveness = process.supervisor.liveness().await;
        if process.sync() {
            self.publish_process(&process.state);
            self.publish(EventPayload::ProcessObserved {
                running: process.state.observed_running,
            });
        }

        match liveness {
            None => SyncState::Unknown,
            Some(_) if !process.state.desired_running => SyncState::InSync,
            Some(true) => SyncState::InSync,
            Some(false) if process.supervisor.in_startup_grace() => {
                debug!("application not up yet; still within startup grace");
                SyncState::Unknown
            }
            Some(false) => {
                warn!("application not running; relaunching");
                let result = self.start_process(&mut process, true).await;
                self.publish_repair(
                    Resource::Process,
                    match &result {
                        Ok(()) => "relaunched application".to_string(),
                        Err(e) => format!("relaunch failed: {e}"),
                    },
                );
                SyncState::Drifted
            }
        }
    }

    // ── Load recovery ───────────────────────────────────────────────────────

    /// Stop the application, wait `pause`, start it again.
    ///
    /// Skipped (returns `Ok(false)`) when the application is no longer
    /// desired running by the time the lock is acquired.
    pub async fn restart_process(
        &self,
        pause: Duration,
        cooldown_until: Option<DateTime<Utc>>,
    ) -> Result<bool, KioskError> {
        let mut process = self.process.lock().await;
        if !process.state.desired_running {
            debug!("restart skipped; application not desired running");
            return Ok(false);
        }
        process.state.restart_cooldown_until = cooldown_until;

        if let Err(e) = self.stop_process(&mut process).await {
            debug!(error = %e, "teardown failed during restart; starting anyway");
        }
        tokio::time::sleep(pause).await;
        self.start_process(&mut process, false).await?;
        Ok(true)
    }

    // ── Internals ───────────────────────────────────────────────────────────

    async fn probe_display(&self, actuator: &PowerActuator) -> PowerState {
        match actuator.probe().await {
            Ok(state) => state,
            Err(e) => {
                debug!(output = %actuator.output(), error = %e, "display probe failed");
                PowerState::Unknown
            }
        }
    }

    async fn apply_power(&self, slot: &mut DisplaySlot, on: bool) -> Result<(), KioskError> {
        match slot.actuator.set_power(on).await {
            Ok(verified) => {
                self.record_display(slot, verified);
                Ok(())
            }
            Err(e) => {
                warn!(output = %slot.actuator.output(), error = %e, "power command failed");
                let observed = self.probe_display(&slot.actuator).await;
                self.record_display(slot, observed);
                Err(e)
            }
        }
    }

    async fn start_process(&self, process: &mut ProcessSlot, force: bool) -> Result<(), KioskError> {
        let result = process.supervisor.start(force).await;
        self.after_process_change(process);
        result
    }

    async fn stop_process(&self, process: &mut ProcessSlot) -> Result<(), KioskError> {
        let result = process.supervisor.stop().await;
        self.after_process_change(process);
        result
    }

    fn after_process_change(&self, process: &mut ProcessSlot) {
        let changed = process.sync();
        self.publish_process(&process.state);
        if changed {
            self.publish(EventPayload::ProcessObserved {
                running: process.state.observed_running,
            });
        }
    }

    /// Store a probe result.  `Unknown` keeps the last verified value.
    fn record_display(&self, slot: &mut DisplaySlot, observed: PowerState) {
        if !observed.is_known() || slot.state.observed == observed {
            return;
        }
        slot.state.observed = observed;
        slot.state.last_transition_at = Some(Utc::now());
        self.publish_display(&slot.state);
        self.publish(EventPayload::DisplayObserved { observed });
        self.listeners.notify();
    }

    fn publish_display(&self, state: &DisplayState) {
        self.snapshot.send_modify(|snap| snap.display = state.clone());
    }

    fn publish_process(&self, state: &ProcessState) {
        self.snapshot.send_modify(|snap| snap.process = state.clone());
    }

    fn publish_repair(&self, resource: Resource, details: String) {
        self.publish(EventPayload::Repair { resource, details });
    }

    fn publish(&self, payload: EventPayload) {
        self.bus.publish(Event::new(SOURCE, payload));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiosk_hal::sim::{Call, CallLog, SimDisplay, SimLauncher};
    use kiosk_middleware::Topic;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Rig {
        store: Arc<DesiredStateStore>,
        display: SimDisplay,
        launcher: SimLauncher,
        log: CallLog,
    }

    fn rig() -> Rig {
        let log = CallLog::default();
        let display = SimDisplay::new("HDMI-A-2", log.clone());
        let launcher = SimLauncher::new(log.clone());
        let store = DesiredStateStore::new(
            PowerActuator::new(Box::new(display.clone())).with_settle(Duration::ZERO),
            ProcessSupervisor::new(Box::new(launcher.clone())),
            EventBus::default(),
        );
        Rig {
            store: Arc::new(store),
            display,
            launcher,
            log,
        }
    }

    fn counting_listener(store: &DesiredStateStore) -> Arc<AtomicUsize> {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        store.add_listener(Arc::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        hits
    }

    #[tokio::test]
    async fn set_desired_twice_issues_one_invocation_pair() {
        let rig = rig();
        rig.store.set_desired(true, false).await.unwrap();
        rig.store.set_desired(true, false).await.unwrap();
        assert_eq!(rig.log.actions(), vec![Call::Launch, Call::PowerCommand(true)]);
    }

    #[tokio::test]
    async fn power_on_starts_first_power_off_stops_last() {
        let rig = rig();
        rig.store.set_desired(true, false).await.unwrap();
        rig.store.set_desired(false, false).await.unwrap();
        assert_eq!(
            rig.log.actions(),
            vec![
                Call::Launch,
                Call::PowerCommand(true),
                Call::PowerCommand(false),
                Call::Teardown,
            ]
        );
        assert!(!rig.launcher.alive());
    }

    #[tokio::test]
    async fn force_reissues_unchanged_desired_value() {
        let rig = rig();
        rig.store.set_desired(true, false).await.unwrap();
        rig.store.set_desired(true, true).await.unwrap();
        assert_eq!(rig.log.count(Call::PowerCommand(true)), 2);
        assert_eq!(rig.log.count(Call::Launch), 2);
    }

    #[tokio::test]
    async fn baseline_off_declaration_is_a_noop() {
        let rig = rig();
        assert_eq!(rig.store.set_desired(false, false).await, Ok(PowerState::Unknown));
        assert!(rig.log.actions().is_empty());
    }

    #[tokio::test]
    async fn listeners_fire_only_on_observed_change() {
        let rig = rig();
        let counters: Vec<_> = (0..3).map(|_| counting_listener(&rig.store)).collect();

        rig.store.set_desired(true, false).await.unwrap();
        for c in &counters {
            assert_eq!(c.load(Ordering::SeqCst), 1);
        }

        rig.store.set_desired(true, false).await.unwrap();
        rig.store.set_desired(true, true).await.unwrap();
        for c in &counters {
            assert_eq!(c.load(Ordering::SeqCst), 1, "unchanged observed value");
        }

        rig.store.set_desired(false, false).await.unwrap();
        for c in &counters {
            assert_eq!(c.load(Ordering::SeqCst), 2);
        }
    }

    #[tokio::test]
    async fn listener_sees_updated_snapshot() {
        let rig = rig();
        let seen = Arc::new(std::sync::Mutex::new(None));
        let (store, s) = (Arc::clone(&rig.store), Arc::clone(&seen));
        rig.store.add_listener(Arc::new(move || {
            *s.lock().unwrap() = Some(store.observed_on());
        }));

        rig.store.set_desired(true, false).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(PowerState::On));
    }

    #[tokio::test]
    async fn panicking_listener_does_not_corrupt_state() {
        let rig = rig();
        rig.store.add_listener(Arc::new(|| panic!("bad listener")));
        let after = counting_listener(&rig.store);

        rig.store.set_desired(true, false).await.unwrap();
        assert_eq!(after.load(Ordering::SeqCst), 1);
        assert_eq!(rig.store.observed_on(), PowerState::On);
        rig.store.set_desired(false, false).await.unwrap();
        assert_eq!(rig.store.observed_on(), PowerState::Off);
    }

    #[tokio::test]
    async fn failed_launch_still_powers_display_and_reports_error() {
        let rig = rig();
        rig.launcher.fail_launch(true);
        let result = rig.store.set_desired(true, false).await;
        assert!(matches!(result, Err(KioskError::Supervisor(_))));
        assert_eq!(rig.store.observed_on(), PowerState::On);
        assert!(!rig.store.snapshot().process.observed_running);
    }

    #[tokio::test]
    async fn failed_power_command_keeps_best_known_state() {
        let rig = rig();
        rig.store.set_desired(true, false).await.unwrap();
        rig.display.fail_commands(true);

        let result = rig.store.set_desired(false, false).await;
        assert!(matches!(result, Err(KioskError::Actuator { .. })));
        assert_eq!(rig.store.observed_on(), PowerState::On);
        assert_eq!(rig.log.count(Call::Teardown), 1, "stop still attempted");
    }

    #[tokio::test]
    async fn unknown_verification_never_reads_as_off() {
        let rig = rig();
        rig.store.set_desired(true, false).await.unwrap();
        rig.display.fail_status(true);

        let observed = rig.store.set_desired(false, false).await.unwrap();
        assert_eq!(observed, PowerState::On, "last verified value kept");
    }

    #[tokio::test]
    async fn process_restart_respects_desired_state() {
        let rig = rig();
        assert_eq!(rig.store.restart_process(Duration::ZERO, None).await, Ok(false));
        assert!(rig.log.actions().is_empty());

        rig.store.set_desired(true, false).await.unwrap();
        rig.log.clear();
        assert_eq!(rig.store.restart_process(Duration::ZERO, None).await, Ok(true));
        assert_eq!(rig.log.actions(), vec![Call::Teardown, Call::Launch]);
        assert!(rig.launcher.alive());
    }

    #[tokio::test]
    async fn commands_are_serialized_per_output() {
        let log = CallLog::default();
        let display =
            SimDisplay::new("HDMI-A-2", log.clone()).with_command_delay(Duration::from_millis(20));
        let store = Arc::new(DesiredStateStore::new(
            PowerActuator::new(Box::new(display.clone())).with_settle(Duration::ZERO),
            ProcessSupervisor::new(Box::new(SimLauncher::new(log.clone()))),
            EventBus::default(),
        ));

        let mut handles = Vec::new();
        for i in 0..6 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let _ = store.set_desired(i % 2 == 0, true).await;
                let _ = store.reconcile_display().await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(display.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn observed_changes_reach_the_bus() {
        let rig = rig();
        let mut changes = rig.store.bus().subscribe_to(Topic::StateChanges);
        rig.store.set_desired(true, false).await.unwrap();

        let mut saw_display_on = false;
        while let Ok(event) = changes.try_recv() {
            if matches!(
                event.payload,
                EventPayload::DisplayObserved { observed: PowerState::On }
            ) {
                saw_display_on = true;
            }
        }
        assert!(saw_display_on);
        assert!(rig.store.is_active());
    }

    #[tokio::test]
    async fn watch_receiver_is_woken_on_change() {
        let rig = rig();
        let mut rx = rig.store.watch();
        rig.store.set_desired(true, false).await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().display.observed, PowerState::On);
    }
}
