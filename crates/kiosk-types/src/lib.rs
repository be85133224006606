use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Power state of the managed display output as last verified.
///
/// `Unknown` is a first-class value: it is what a failed or inconclusive
/// probe yields and must never be read as `Off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    On,
    Off,
    #[default]
    Unknown,
}

impl PowerState {
    pub fn from_bool(on: bool) -> Self {
        if on { PowerState::On } else { PowerState::Off }
    }

    /// `Some(true)` / `Some(false)` for a verified state, `None` for `Unknown`.
    pub fn as_bool(self) -> Option<bool> {
        match self {
            PowerState::On => Some(true),
            PowerState::Off => Some(false),
            PowerState::Unknown => None,
        }
    }

    pub fn is_known(self) -> bool {
        self != PowerState::Unknown
    }
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowerState::On => write!(f, "on"),
            PowerState::Off => write!(f, "off"),
            PowerState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Desired vs. observed state of the display output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DisplayState {
    pub desired_on: bool,
    /// Set only by a hardware probe or a verified actuator call.
    pub observed: PowerState,
    pub last_transition_at: Option<DateTime<Utc>>,
}

/// Desired vs. observed state of the foreground application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProcessState {
    pub desired_running: bool,
    pub observed_running: bool,
    pub last_start_at: Option<DateTime<Utc>>,
    pub restart_cooldown_until: Option<DateTime<Utc>>,
}

/// Point-in-time copy of both managed resources, as served to adapters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StatusSnapshot {
    pub display: DisplayState,
    pub process: ProcessState,
}

/// The two resources kept in sync by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resource {
    Display,
    Process,
}

/// Unified event wrapper for the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g., "kiosk-kernel::store"
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Variants of data that can be routed over the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    /// The verified display power state changed value.
    DisplayObserved { observed: PowerState },
    /// The supervised application's observed running flag changed value.
    ProcessObserved { running: bool },
    /// A corrective action was taken against drift.
    Repair { resource: Resource, details: String },
    /// A debounced presence event requested a wake transition.
    WakeRequested { device: String },
    /// Sustained overload forced an application restart.
    LoadRestart { cpu_percent: f32 },
}

/// Error type spanning display actuation, process supervision, input
/// devices and the glue around them.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KioskError {
    #[error("Actuator error on {output}: {details}")]
    Actuator { output: String, details: String },

    #[error("Supervisor error: {0}")]
    Supervisor(String),

    #[error("Input device error on {device}: {details}")]
    Device { device: String, details: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("I/O error: {0}")]
    Io(String),
}
