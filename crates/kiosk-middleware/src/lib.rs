//! `kiosk-middleware` – event routing
//!
//! Carries state-change, repair and presence notifications from the kernel
//! to async observers (protocol adapters, log sinks) without the kernel
//! knowing who is listening.
//!
//! # Modules
//!
//! - [`bus`] – [`EventBus`][bus::EventBus]: three broadcast lanes
//!   ([`Topic`][bus::Topic]) and per-lane [`TopicReceiver`][bus::TopicReceiver]s.

pub mod bus;

pub use bus::{EventBus, Topic, TopicReceiver};
