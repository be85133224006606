//! In-process simulation backends for tests and dry runs without a
//! compositor, a browser or input hardware.
//!
//! Every sim is a cheap `Clone` handle over shared state, so a test can keep
//! one handle for steering and assertions while another is boxed into the
//! kernel.  Sims constructed with the same [`CallLog`] record into one
//! ordered log, which is how call ordering across resources is asserted.
//!
//! # Example
//!
//! ```rust
//! use kiosk_hal::sim::{Call, CallLog, SimDisplay};
//! use kiosk_types::PowerState;
//!
//! let log = CallLog::default();
//! let display = SimDisplay::new("HDMI-A-2", log.clone());
//! assert_eq!(display.actual(), PowerState::Off);
//! assert!(log.calls().is_empty());
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use kiosk_types::{KioskError, PowerState};
use tokio::sync::mpsc;

use crate::display::DisplayPower;
use crate::launcher::AppLauncher;
use crate::load::LoadProbe;
use crate::presence::{PresenceFeed, PresenceSource, TouchEvent};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ────────────────────────────────────────────────────────────────────────────
// Call log
// ────────────────────────────────────────────────────────────────────────────

/// A backend invocation as seen by a sim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    PowerCommand(bool),
    PowerStatus,
    Launch,
    Teardown,
    LoadSample,
    PresenceOpen,
}

/// Ordered, shared record of backend invocations.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    pub fn record(&self, call: Call) {
        locked(&self.0).push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        locked(&self.0).clone()
    }

    /// Calls other than status probes, i.e. the ones that act on the world.
    pub fn actions(&self) -> Vec<Call> {
        locked(&self.0)
            .iter()
            .copied()
            .filter(|c| !matches!(c, Call::PowerStatus | Call::LoadSample))
            .collect()
    }

    pub fn count(&self, call: Call) -> usize {
        locked(&self.0).iter().filter(|c| **c == call).count()
    }

    pub fn clear(&self) {
        locked(&self.0).clear();
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Display
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct DisplayInner {
    actual: PowerState,
    status_fails: bool,
    command_fails: bool,
    stuck: bool,
    command_delay: Option<Duration>,
}

/// Simulated display output.  Starts `Off`.
#[derive(Debug, Clone)]
pub struct SimDisplay {
    output: String,
    log: CallLog,
    inner: Arc<Mutex<DisplayInner>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl SimDisplay {
    pub fn new(output: impl Into<String>, log: CallLog) -> Self {
        Self {
            output: output.into(),
            log,
            inner: Arc::new(Mutex::new(DisplayInner {
                actual: PowerState::Off,
                status_fails: false,
                command_fails: false,
                stuck: false,
                command_delay: None,
            })),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Hardware state as the sim sees it.
    pub fn actual(&self) -> PowerState {
        locked(&self.inner).actual
    }

    /// Change the hardware behind the supervisor's back (drift).
    pub fn set_actual(&self, state: PowerState) {
        locked(&self.inner).actual = state;
    }

    /// Make status probes fail.
    pub fn fail_status(&self, fail: bool) {
        locked(&self.inner).status_fails = fail;
    }

    /// Make power commands fail without changing state.
    pub fn fail_commands(&self, fail: bool) {
        locked(&self.inner).command_fails = fail;
    }

    /// Accept power commands but ignore them.
    pub fn stick(&self, stuck: bool) {
        locked(&self.inner).stuck = stuck;
    }

    /// Make every power command take `delay` to complete.
    pub fn with_command_delay(self, delay: Duration) -> Self {
        locked(&self.inner).command_delay = Some(delay);
        self
    }

    /// Highest number of power commands observed running concurrently.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DisplayPower for SimDisplay {
    fn output(&self) -> &str {
        &self.output
    }

    async fn command(&self, on: bool) -> Result<(), KioskError> {
        self.log.record(Call::PowerCommand(on));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = locked(&self.inner).command_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let result = {
            let mut inner = locked(&self.inner);
            if inner.command_fails {
                Err(KioskError::Actuator {
                    output: self.output.clone(),
                    details: "simulated command failure".to_string(),
                })
            } else {
                if !inner.stuck {
                    inner.actual = PowerState::from_bool(on);
                }
                Ok(())
            }
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn status(&self) -> Result<PowerState, KioskError> {
        self.log.record(Call::PowerStatus);
        let inner = locked(&self.inner);
        if inner.status_fails {
            return Err(KioskError::Actuator {
                output: self.output.clone(),
                details: "simulated status failure".to_string(),
            });
        }
        Ok(inner.actual)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Launcher
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct LauncherInner {
    alive: bool,
    launch_fails: bool,
    teardown_fails: bool,
    liveness_unknown: bool,
}

/// Simulated application launcher.  Starts with nothing running.
#[derive(Debug, Clone)]
pub struct SimLauncher {
    log: CallLog,
    inner: Arc<Mutex<LauncherInner>>,
}

impl SimLauncher {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            inner: Arc::new(Mutex::new(LauncherInner::default())),
        }
    }

    pub fn alive(&self) -> bool {
        locked(&self.inner).alive
    }

    /// Simulate a crash of the application.
    pub fn kill(&self) {
        locked(&self.inner).alive = false;
    }

    pub fn fail_launch(&self, fail: bool) {
        locked(&self.inner).launch_fails = fail;
    }

    pub fn fail_teardown(&self, fail: bool) {
        locked(&self.inner).teardown_fails = fail;
    }

    /// Make [`AppLauncher::is_alive`] answer `None`.
    pub fn hide_liveness(&self, hidden: bool) {
        locked(&self.inner).liveness_unknown = hidden;
    }
}

#[async_trait]
impl AppLauncher for SimLauncher {
    async fn launch(&self) -> Result<(), KioskError> {
        self.log.record(Call::Launch);
        let mut inner = locked(&self.inner);
        if inner.launch_fails {
            return Err(KioskError::Supervisor("simulated launch failure".to_string()));
        }
        inner.alive = true;
        Ok(())
    }

    async fn teardown(&self) -> Result<(), KioskError> {
        self.log.record(Call::Teardown);
        let mut inner = locked(&self.inner);
        if inner.teardown_fails {
            return Err(KioskError::Supervisor("simulated teardown failure".to_string()));
        }
        inner.alive = false;
        Ok(())
    }

    async fn is_alive(&self) -> Option<bool> {
        let inner = locked(&self.inner);
        if inner.liveness_unknown {
            None
        } else {
            Some(inner.alive)
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Load
// ────────────────────────────────────────────────────────────────────────────

/// Simulated CPU load returning whatever was last set.
#[derive(Debug, Clone)]
pub struct SimLoad {
    log: CallLog,
    percent: Arc<Mutex<f32>>,
}

impl SimLoad {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            percent: Arc::new(Mutex::new(0.0)),
        }
    }

    pub fn set(&self, percent: f32) {
        *locked(&self.percent) = percent;
    }
}

impl LoadProbe for SimLoad {
    fn cpu_percent(&mut self) -> f32 {
        self.log.record(Call::LoadSample);
        *locked(&self.percent)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Presence
// ────────────────────────────────────────────────────────────────────────────

/// Sender half of a simulated presence feed.
pub type SimFeed = mpsc::Sender<Result<TouchEvent, KioskError>>;

/// Simulated presence source.  Each [`SimPresence::push_feed`] queues one
/// feed for the next `open`; with nothing queued, `open` reports that no
/// devices exist.
#[derive(Debug, Clone)]
pub struct SimPresence {
    log: CallLog,
    feeds: Arc<Mutex<VecDeque<PresenceFeed>>>,
    opens: Arc<AtomicUsize>,
}

impl SimPresence {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            feeds: Arc::new(Mutex::new(VecDeque::new())),
            opens: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn push_feed(&self) -> SimFeed {
        let (tx, rx) = mpsc::channel(64);
        locked(&self.feeds).push_back(rx);
        tx
    }

    /// Number of `open` calls so far, successful or not.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PresenceSource for SimPresence {
    async fn open(&self) -> Result<PresenceFeed, KioskError> {
        self.log.record(Call::PresenceOpen);
        self.opens.fetch_add(1, Ordering::SeqCst);
        locked(&self.feeds)
            .pop_front()
            .ok_or_else(|| KioskError::Device {
                device: "sim".to_string(),
                details: "no simulated devices".to_string(),
            })
    }
}
