//! `kiosk-hal` – Hardware & OS Abstraction Layer
//!
//! Everything that touches the world outside the process lives here, behind
//! small traits so the kernel can be exercised against in-process stubs.
//!
//! # Modules
//!
//! - [`session`] – [`SessionConfig`][session::SessionConfig] /
//!   [`SessionEnv`][session::SessionEnv]: runtime-directory and Wayland
//!   socket discovery applied to every spawned command.
//! - [`display`] – [`DisplayPower`][display::DisplayPower] trait and the
//!   `wlr-randr` backed [`WlrRandr`][display::WlrRandr] driver.
//! - [`launcher`] – [`AppLauncher`][launcher::AppLauncher] trait and the
//!   script-driven [`ScriptLauncher`][launcher::ScriptLauncher].
//! - [`load`] – [`LoadProbe`][load::LoadProbe] trait and the `sysinfo`
//!   backed [`SysinfoLoad`][load::SysinfoLoad].
//! - [`presence`] – [`PresenceSource`][presence::PresenceSource] trait and
//!   the evdev backed [`EvdevPresence`][presence::EvdevPresence].
//! - [`sim`] – recording stub drivers for tests and dry runs.

pub mod display;
pub mod launcher;
pub mod load;
pub mod presence;
pub mod session;
pub mod sim;

pub use display::{DisplayPower, WlrRandr};
pub use launcher::{AppLauncher, ScriptLauncher};
pub use load::{LoadProbe, SysinfoLoad};
pub use presence::{
    DeviceCapability, DeviceCaps, EvdevPresence, PresenceFeed, PresenceSource, TouchEvent, TouchKind,
};
pub use session::{SessionConfig, SessionEnv};
