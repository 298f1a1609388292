//! Plugin event registry and dispatcher
//!
//! Plugins are compiled-in modules. Loading a module runs its registration
//! function once, which binds handler functions to event names in an
//! append-only table. Stages never call plugins directly: a
//! [`PluginBridge`] observer forwards their lifecycle events to
//! [`PluginManager::trigger`].

mod bridge;
mod manager;
pub mod manifest;

pub use bridge::PluginBridge;
pub use manager::{PluginErrors, PluginManager, Registrar};

use std::any::Any;
use std::fmt;

use photoplace_common::config::MainConfig;
use photoplace_common::events::CallArgs;
use serde::Serialize;
use serde_json::Value;

/// Opaque host UI handle passed to `init`; headless hosts pass `None`
pub type HostWidget = dyn Any + Send + Sync;

/// Plugin handler bound to a concrete plugin type
pub type HandlerFn<P> = fn(&mut P, &CallArgs) -> anyhow::Result<()>;

/// Behaviour every plugin instance provides
pub trait Plugin: Send + 'static {
    /// Prepare for work; success marks the instance ready
    fn init(&mut self, options: &Value, host: Option<&HostWidget>) -> anyhow::Result<()>;

    /// Stop working; the instance is no longer ready afterwards
    fn end(&mut self, options: &Value) -> anyhow::Result<()>;

    /// Drop accumulated per-run data
    fn reset(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Downcast hook for typed handlers
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Instance readiness; only `Ready` instances receive events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(into = "i8")]
pub enum Readiness {
    NeverStarted = -1,
    NotReady = 0,
    Ready = 1,
}

impl From<Readiness> for i8 {
    fn from(readiness: Readiness) -> Self {
        readiness as i8
    }
}

impl Readiness {
    pub(crate) fn from_code(code: i8) -> Self {
        match code {
            1 => Readiness::Ready,
            0 => Readiness::NotReady,
            _ => Readiness::NeverStarted,
        }
    }
}

/// What a plugin needs from its host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    /// GUI toolkit the plugin ships widgets for, if any
    pub gui: Option<String>,
    /// Cannot run without a host widget
    pub needs_gui: bool,
}

/// Selects plugins by capability
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityFilter {
    Any,
    /// Plugins shipping widgets for this toolkit
    Gui(String),
    /// Plugins usable without a host widget
    Headless,
}

impl CapabilityFilter {
    pub fn accepts(&self, caps: &Capabilities) -> bool {
        match self {
            CapabilityFilter::Any => true,
            CapabilityFilter::Gui(kind) => caps.gui.as_deref() == Some(kind.as_str()),
            CapabilityFilter::Headless => !caps.needs_gui,
        }
    }
}

/// Descriptive metadata of a plugin module
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginInfo {
    /// Module name: registry key and error-map key
    pub name: String,
    pub description: String,
    pub version: String,
    pub author: String,
    pub capabilities: Capabilities,
}

/// Data handed to a plugin constructor
#[derive(Debug, Clone, Default)]
pub struct PluginContext {
    pub settings: MainConfig,
}

/// A loadable plugin: metadata, registration and constructor
#[derive(Clone)]
pub struct PluginModule {
    pub info: PluginInfo,
    /// Binds handlers to event names; run once at load time
    pub register: fn(&mut Registrar<'_>),
    /// Builds the single active instance
    pub factory: fn(&PluginContext) -> anyhow::Result<Box<dyn Plugin>>,
}

impl PluginModule {
    pub fn name(&self) -> &str {
        &self.info.name
    }
}

impl fmt::Debug for PluginModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginModule")
            .field("info", &self.info)
            .finish()
    }
}

/// Modules compiled into the binary
pub fn builtin_modules() -> Vec<PluginModule> {
    vec![manifest::module()]
}
