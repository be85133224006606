//! `kiosk-kernel` – reconciliation and lifecycle supervision
//!
//! Owns the desired/observed state of the display and the foreground
//! application and every worker that moves one toward the other.
//!
//! # Modules
//!
//! - [`actuator`] – [`PowerActuator`][actuator::PowerActuator]: command,
//!   settle, re-probe; returns the verified power state.
//! - [`supervisor`] – [`ProcessSupervisor`][supervisor::ProcessSupervisor]:
//!   start/stop bookkeeping and live liveness checks.
//! - [`listeners`] – [`ListenerRegistry`][listeners::ListenerRegistry]:
//!   identity-deduplicated change callbacks with panic isolation.
//! - [`store`] – [`DesiredStateStore`][store::DesiredStateStore]: the single
//!   source of truth; serializes commands per resource.
//! - [`reconcile`] – [`ReconciliationLoop`][reconcile::ReconciliationLoop]:
//!   periodic drift repair.
//! - [`presence`] – [`PresenceWatcher`][presence::PresenceWatcher] and
//!   [`Debounce`][presence::Debounce]: wake on touch.
//! - [`load`] – [`LoadMonitor`][load::LoadMonitor] and
//!   [`Cooldown`][load::Cooldown]: restart on sustained overload.

pub mod actuator;
pub mod listeners;
pub mod load;
pub mod presence;
pub mod reconcile;
pub mod store;
pub mod supervisor;

pub use actuator::PowerActuator;
pub use listeners::{Listener, ListenerRegistry};
pub use load::{Cooldown, LoadMonitor};
pub use presence::{Debounce, PresenceWatcher};
pub use reconcile::{ReconcileReport, ReconciliationLoop, SyncState};
pub use store::DesiredStateStore;
pub use supervisor::ProcessSupervisor;
