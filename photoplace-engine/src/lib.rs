//! # PhotoPlace Engine
//!
//! Pipeline core of the PhotoPlace geotagger:
//! - Domain State with counted resource locks
//! - Three-step stages run under lock discipline, reporting on a bus
//! - Plugin registry and dispatcher with per-plugin fault isolation
//! - Concrete stages and the `Session` facade tying them together

pub mod collaborators;
pub mod error;
pub mod model;
pub mod plugins;
pub mod session;
pub mod stage;
pub mod stages;
pub mod state;

pub use error::{Error, PluginError, Result};
pub use session::{ProcessHandle, ProcessReport, Processing, RunMode, Session};
pub use stage::{Emitter, Stage, StageContext, StageHandle, StageRunner, Step};
pub use state::{DomainState, Resource};
