//! # PhotoPlace Common Library
//!
//! Shared code for the PhotoPlace pipeline crates including:
//! - Error types
//! - Configuration loading (TOML bootstrap + resolution order)
//! - Event naming and call arguments
//! - The notification bus every stage publishes its lifecycle through

pub mod config;
pub mod error;
pub mod events;

pub use error::{Error, Result};
pub use events::{Bus, CallArgs, EventFilter, ObserverRef, Phase};
