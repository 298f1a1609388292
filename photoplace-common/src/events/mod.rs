//! Event system for PhotoPlace
//!
//! Provides event naming, call arguments, filters and the notification
//! [`Bus`] shared by every pipeline stage.

// Sub-modules (supporting types)
mod args;
mod bus;
mod filter;
mod names;

pub use args::CallArgs;
pub use bus::{panic_message, Bus, Delivery, DeliveryReport, ObserverRef};
pub use filter::{Binding, EventFilter, SubscribeOutcome};
pub use names::{default_event_name, EventNames, Phase, DEFAULT_SEPARATOR};
