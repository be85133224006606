//! Human presence input: discovery and reading of evdev devices.
//!
//! A [`PresenceSource`] opens a [`PresenceFeed`], a channel multiplexing the
//! events of every matching device.  The feed ends (the receiver yields
//! `None`) once all device readers have stopped; a reader that hits an IO
//! error forwards it as `Err` first.  Dropping the receiver stops all readers.
//!
//! Debouncing and rediscovery policy live in the kernel's `PresenceWatcher`.

use std::path::PathBuf;

use async_trait::async_trait;
use evdev::{Device, InputEvent, InputEventKind};
use kiosk_types::KioskError;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Buffered events per feed before readers wait.
const FEED_CAPACITY: usize = 64;

/// What kind of input produced a [`TouchEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchKind {
    Key,
    AbsoluteAxis,
}

/// A single qualifying input event.  Ephemeral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TouchEvent {
    pub device_id: String,
    pub timestamp: Instant,
    pub kind: TouchKind,
}

impl TouchEvent {
    pub fn new(device_id: impl Into<String>, kind: TouchKind) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp: Instant::now(),
            kind,
        }
    }
}

/// Capability bits of a discovered device relevant to presence detection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceCaps {
    pub absolute_axes: bool,
    pub keys: bool,
}

impl DeviceCaps {
    fn of(device: &Device) -> Self {
        Self {
            absolute_axes: device
                .supported_absolute_axes()
                .is_some_and(|axes| axes.iter().next().is_some()),
            keys: device
                .supported_keys()
                .is_some_and(|keys| keys.iter().next().is_some()),
        }
    }
}

/// Predicate selecting which devices count as presence sources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceCapability {
    /// Touch screens and tablets.
    #[default]
    AbsoluteAxes,
    /// Keyboards, buttons and remotes.
    Keys,
    /// Either of the above.
    Any,
}

impl DeviceCapability {
    pub fn matches(self, caps: DeviceCaps) -> bool {
        match self {
            DeviceCapability::AbsoluteAxes => caps.absolute_axes,
            DeviceCapability::Keys => caps.keys,
            DeviceCapability::Any => caps.absolute_axes || caps.keys,
        }
    }
}

/// Multiplexed stream of presence events from all opened devices.
pub type PresenceFeed = mpsc::Receiver<Result<TouchEvent, KioskError>>;

/// Discovers presence devices and opens a feed over them.
#[async_trait]
pub trait PresenceSource: Send + Sync {
    /// Discover matching devices and start reading them.
    ///
    /// # Errors
    ///
    /// Returns [`KioskError::Device`] when no matching device exists or none
    /// could be opened.
    async fn open(&self) -> Result<PresenceFeed, KioskError>;
}

/// Linux evdev backed [`PresenceSource`] scanning `/dev/input/event*`.
#[derive(Debug, Clone, Default)]
pub struct EvdevPresence {
    capability: DeviceCapability,
}

impl EvdevPresence {
    pub fn new(capability: DeviceCapability) -> Self {
        Self { capability }
    }
}

#[async_trait]
impl PresenceSource for EvdevPresence {
    async fn open(&self) -> Result<PresenceFeed, KioskError> {
        let capability = self.capability;
        let devices = tokio::task::spawn_blocking(move || discover(capability))
            .await
            .map_err(|e| KioskError::Device {
                device: "/dev/input".to_string(),
                details: format!("device scan did not finish: {e}"),
            })?;

        let (tx, rx) = mpsc::channel(FEED_CAPACITY);
        let mut opened = 0usize;
        for (path, device) in devices {
            let id = path.display().to_string();
            let name = device.name().unwrap_or("unnamed").to_string();
            match device.into_event_stream() {
                Ok(stream) => {
                    info!(device = %id, %name, "watching input device");
                    tokio::spawn(read_device(id, stream, tx.clone()));
                    opened += 1;
                }
                Err(e) => warn!(device = %id, error = %e, "could not open input device"),
            }
        }

        if opened == 0 {
            return Err(KioskError::Device {
                device: "/dev/input".to_string(),
                details: format!("no {:?} input devices found", self.capability),
            });
        }
        Ok(rx)
    }
}

/// Blocking scan of `/dev/input` for devices matching `capability`.
fn discover(capability: DeviceCapability) -> Vec<(PathBuf, Device)> {
    evdev::enumerate()
        .filter(|(_, device)| capability.matches(DeviceCaps::of(device)))
        .collect()
}

async fn read_device(
    id: String,
    mut stream: evdev::EventStream,
    tx: mpsc::Sender<Result<TouchEvent, KioskError>>,
) {
    loop {
        tokio::select! {
            _ = tx.closed() => break,
            next = stream.next_event() => match next {
                Ok(event) => {
                    let Some(kind) = classify(&event) else { continue };
                    if tx.send(Ok(TouchEvent::new(id.clone(), kind))).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx
                        .send(Err(KioskError::Device {
                            device: id.clone(),
                            details: e.to_string(),
                        }))
                        .await;
                    break;
                }
            },
        }
    }
    debug!(device = %id, "input reader stopped");
}

/// Map a raw input event to a presence kind.  Key releases, sync frames and
/// everything else are ignored.
pub fn classify(event: &InputEvent) -> Option<TouchKind> {
    match event.kind() {
        InputEventKind::Key(_) if event.value() != 0 => Some(TouchKind::Key),
        InputEventKind::AbsAxis(_) => Some(TouchKind::AbsoluteAxis),
        _ => None,
    }
}
