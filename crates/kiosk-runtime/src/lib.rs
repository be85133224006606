//! `kiosk-runtime` – process-level wiring
//!
//! # Modules
//!
//! - [`supervisor`] – [`Supervisor`][supervisor::Supervisor]: builds the
//!   [`DesiredStateStore`][kiosk_kernel::DesiredStateStore] from a
//!   [`SupervisorConfig`][supervisor::SupervisorConfig] and a set of
//!   [`Backends`][supervisor::Backends], then runs the reconciliation loop,
//!   presence watcher, load monitor and delayed boot activation under one
//!   cancellation token.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: global
//!   `tracing` subscriber with optional OTLP span export.

pub mod supervisor;
pub mod telemetry;

pub use supervisor::{
    Backends, DEFAULT_BOOT_GRACE, LoadSettings, PresenceSettings, Supervisor, SupervisorConfig,
};
pub use telemetry::{LogFormat, TelemetryGuard, init_tracing};
