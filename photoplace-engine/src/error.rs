//! Error types for the pipeline engine
//!
//! Only stage-fatal errors abort a run. Observer and plugin handler
//! failures are isolated by the bus and the dispatcher and never show up
//! here.

use thiserror::Error;

use crate::stage::Step;

/// Engine result type
pub type Result<T> = std::result::Result<T, Error>;

/// Engine error type
#[derive(Debug, Error)]
pub enum Error {
    /// A stage phase failed; locks were released before this was returned
    #[error("Stage {stage} failed during {step}: {source:#}")]
    Stage {
        stage: String,
        step: Step,
        source: anyhow::Error,
    },

    /// Plugin management error
    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    /// An output run is still pending
    #[error("Operation rejected: some operations are pending")]
    Busy,

    /// Stage declared an unusable resource list
    #[error("Invalid lock set: {0}")]
    InvalidLockSet(String),

    /// photoplace-common error
    #[error("Common error: {0}")]
    Common(#[from] photoplace_common::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Background worker died before producing a result
    #[error("Worker failed: {0}")]
    Worker(String),
}

impl Error {
    /// Step that failed, for stage errors
    pub fn step(&self) -> Option<Step> {
        match self {
            Error::Stage { step, .. } => Some(*step),
            _ => None,
        }
    }
}

/// Plugin loading, activation and lifecycle errors
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("Plugin '{0}' is not loaded")]
    NotFound(String),

    #[error("Plugin '{0}' is already loaded")]
    AlreadyLoaded(String),

    /// The plugin constructor failed or panicked
    #[error("Cannot activate plugin '{module}': {message}")]
    Activation { module: String, message: String },

    #[error("Plugin '{0}' is not active")]
    NotActive(String),

    #[error("Plugin '{module}' init failed: {message}")]
    Init { module: String, message: String },

    #[error("Plugin '{module}' end failed: {message}")]
    End { module: String, message: String },

    #[error("Plugin '{module}' reset failed: {message}")]
    Reset { module: String, message: String },
}

impl PluginError {
    /// Module name the error refers to
    pub fn module(&self) -> &str {
        match self {
            PluginError::NotFound(module)
            | PluginError::AlreadyLoaded(module)
            | PluginError::NotActive(module) => module,
            PluginError::Activation { module, .. }
            | PluginError::Init { module, .. }
            | PluginError::End { module, .. }
            | PluginError::Reset { module, .. } => module,
        }
    }
}
