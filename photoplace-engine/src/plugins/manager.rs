//! Plugin manager: module table, handler registry, active instances
//!
//! # Dispatch rules
//! - Handlers of a module with no active instance are skipped silently
//! - Handlers of an instance that is not `Ready` are skipped silently
//! - Handler errors and panics are logged and collected per module
//! - `trigger` itself never fails
//!
//! Each active instance sits behind its own mutex. A handler must not
//! trigger an event its own plugin handles, or it would wait on itself.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicI8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use photoplace_common::events::{panic_message, CallArgs};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::{
    CapabilityFilter, HandlerFn, HostWidget, Plugin, PluginContext, PluginInfo, PluginModule,
    Readiness,
};
use crate::error::PluginError;

/// Module name → error raised by its handler
pub type PluginErrors = BTreeMap<String, anyhow::Error>;

type Handler = Arc<dyn Fn(&mut dyn Plugin, &CallArgs) -> anyhow::Result<()> + Send + Sync>;

#[derive(Clone)]
struct HandlerEntry {
    module: String,
    handler: Handler,
}

struct ActivePlugin {
    plugin: Mutex<Box<dyn Plugin>>,
    readiness: AtomicI8,
}

impl ActivePlugin {
    fn readiness(&self) -> Readiness {
        Readiness::from_code(self.readiness.load(Ordering::SeqCst))
    }

    fn set_readiness(&self, readiness: Readiness) {
        self.readiness.store(readiness.into(), Ordering::SeqCst);
    }

    fn plugin(&self) -> MutexGuard<'_, Box<dyn Plugin>> {
        self.plugin.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Wraps a typed handler so it can run against any plugin instance
fn erase<P: Plugin>(handler: HandlerFn<P>) -> Handler {
    Arc::new(move |plugin: &mut dyn Plugin, args: &CallArgs| {
        let any: &mut dyn Any = plugin.as_any_mut();
        let typed = any
            .downcast_mut::<P>()
            .ok_or_else(|| anyhow::anyhow!("handler bound to a different plugin type"))?;
        handler(typed, args)
    })
}

/// Registration scope of one module, handed to its `register` function
pub struct Registrar<'a> {
    module: &'a str,
    table: &'a mut HashMap<String, Vec<HandlerEntry>>,
}

impl Registrar<'_> {
    /// Bind `handler` to `event` for this module
    pub fn on<P: Plugin>(&mut self, event: &str, handler: HandlerFn<P>) -> &mut Self {
        debug!(module = self.module, event, "Registering plugin handler");
        self.table
            .entry(event.to_string())
            .or_default()
            .push(HandlerEntry {
                module: self.module.to_string(),
                handler: erase(handler),
            });
        self
    }

    pub fn module(&self) -> &str {
        self.module
    }
}

/// Explicitly constructed plugin registry + dispatcher
///
/// Share it with `Arc`; every method takes `&self`.
#[derive(Default)]
pub struct PluginManager {
    modules: RwLock<BTreeMap<String, PluginModule>>,
    handlers: RwLock<HashMap<String, Vec<HandlerEntry>>>,
    instances: RwLock<BTreeMap<String, Arc<ActivePlugin>>>,
}

impl PluginManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a module and run its registration
    pub fn load(&self, module: PluginModule) -> Result<(), PluginError> {
        let name = module.name().to_string();
        let mut modules = self.modules.write().unwrap_or_else(PoisonError::into_inner);
        if modules.contains_key(&name) {
            return Err(PluginError::AlreadyLoaded(name));
        }

        {
            let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
            let mut registrar = Registrar {
                module: &name,
                table: &mut *handlers,
            };
            (module.register)(&mut registrar);
        }

        info!("Plugin '{}' v{} loaded", name, module.info.version);
        modules.insert(name, module);
        Ok(())
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.read_modules().contains_key(name)
    }

    /// Append a typed handler for `event` on behalf of `module`
    pub fn register<P: Plugin>(&self, event: &str, module: &str, handler: HandlerFn<P>) {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        Registrar {
            module,
            table: &mut *handlers,
        }
        .on(event, handler);
    }

    /// Module names with a handler for `event`, in registration order
    pub fn handlers_for(&self, event: &str) -> Vec<String> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event)
            .map(|entries| entries.iter().map(|e| e.module.clone()).collect())
            .unwrap_or_default()
    }

    /// Metadata of loaded modules accepted by `filter`
    pub fn list_plugins(&self, filter: &CapabilityFilter) -> Vec<PluginInfo> {
        self.read_modules()
            .values()
            .filter(|m| filter.accepts(&m.info.capabilities))
            .map(|m| m.info.clone())
            .collect()
    }

    /// Construct the single instance of `name`; no-op when already active
    pub fn activate(&self, name: &str, ctx: &PluginContext) -> Result<(), PluginError> {
        if self.is_active(name) {
            debug!("Plugin '{}' already active", name);
            return Ok(());
        }
        let factory = self
            .read_modules()
            .get(name)
            .map(|m| m.factory)
            .ok_or_else(|| PluginError::NotFound(name.to_string()))?;

        let built = catch_unwind(AssertUnwindSafe(|| factory(ctx)));
        let plugin = match built {
            Ok(Ok(plugin)) => plugin,
            Ok(Err(e)) => return Err(activation_error(name, format!("{:#}", e))),
            Err(panic) => {
                return Err(activation_error(
                    name,
                    format!("constructor panicked: {}", panic_message(&*panic)),
                ))
            }
        };

        let mut instances = self.instances.write().unwrap_or_else(PoisonError::into_inner);
        instances.entry(name.to_string()).or_insert_with(|| {
            Arc::new(ActivePlugin {
                plugin: Mutex::new(plugin),
                readiness: AtomicI8::new(Readiness::NeverStarted.into()),
            })
        });
        info!("Plugin '{}' activated", name);
        Ok(())
    }

    /// Drop the active instance; returns false when none was active
    pub fn deactivate(&self, name: &str) -> bool {
        let removed = self
            .instances
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some();
        if removed {
            info!("Plugin '{}' deactivated", name);
        }
        removed
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.instance(name).is_some()
    }

    /// Readiness of the active instance, `None` when not active
    pub fn readiness(&self, name: &str) -> Option<Readiness> {
        self.instance(name).map(|i| i.readiness())
    }

    /// Force the readiness flag of an active instance
    pub fn set_readiness(&self, name: &str, readiness: Readiness) -> Result<(), PluginError> {
        self.active(name)?.set_readiness(readiness);
        Ok(())
    }

    /// Call `Plugin::init`; success marks the instance `Ready`
    pub fn init(
        &self,
        name: &str,
        options: &Value,
        host: Option<&HostWidget>,
    ) -> Result<(), PluginError> {
        let instance = self.active(name)?;
        instance
            .plugin()
            .init(options, host)
            .map_err(|e| PluginError::Init {
                module: name.to_string(),
                message: format!("{:#}", e),
            })?;
        instance.set_readiness(Readiness::Ready);
        debug!("Plugin '{}' ready", name);
        Ok(())
    }

    /// Call `Plugin::end`; the instance is `NotReady` afterwards either way
    pub fn end(&self, name: &str, options: &Value) -> Result<(), PluginError> {
        let instance = self.active(name)?;
        let result = instance.plugin().end(options);
        instance.set_readiness(Readiness::NotReady);
        result.map_err(|e| PluginError::End {
            module: name.to_string(),
            message: format!("{:#}", e),
        })
    }

    pub fn reset(&self, name: &str) -> Result<(), PluginError> {
        self.active(name)?
            .plugin()
            .reset()
            .map_err(|e| PluginError::Reset {
                module: name.to_string(),
                message: format!("{:#}", e),
            })
    }

    /// Run `f` on the active instance of `name`, seen as a `P`
    ///
    /// `None` when the module is not active or is not a `P`.
    pub fn with_instance<P: Plugin, R>(&self, name: &str, f: impl FnOnce(&mut P) -> R) -> Option<R> {
        let instance = self.instance(name)?;
        let mut plugin = instance.plugin();
        let typed = plugin.as_any_mut().downcast_mut::<P>()?;
        Some(f(typed))
    }

    /// Run every handler registered for `event` on ready instances
    ///
    /// Returns the errors keyed by module name; empty means full success.
    pub fn trigger(&self, event: &str, args: &CallArgs) -> PluginErrors {
        let entries = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event)
            .cloned()
            .unwrap_or_default();

        let mut errors = PluginErrors::new();
        for entry in entries {
            let Some(instance) = self.instance(&entry.module) else {
                continue;
            };
            if instance.readiness() != Readiness::Ready {
                continue;
            }

            let outcome = {
                let mut plugin = instance.plugin();
                catch_unwind(AssertUnwindSafe(|| (entry.handler)(&mut **plugin, args)))
            };
            let result = match outcome {
                Ok(result) => result,
                Err(panic) => Err(anyhow::anyhow!(
                    "handler panicked: {}",
                    panic_message(&*panic)
                )),
            };

            if let Err(e) = result {
                error!("Plugin '{}' failed on '{}': {:#}", entry.module, event, e);
                errors.insert(entry.module, e);
            }
        }

        if !errors.is_empty() {
            warn!("Event '{}' finished with {} plugin error(s)", event, errors.len());
        }
        errors
    }

    fn read_modules(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, PluginModule>> {
        self.modules.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn instance(&self, name: &str) -> Option<Arc<ActivePlugin>> {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn active(&self, name: &str) -> Result<Arc<ActivePlugin>, PluginError> {
        self.instance(name)
            .ok_or_else(|| PluginError::NotActive(name.to_string()))
    }
}

fn activation_error(module: &str, message: String) -> PluginError {
    error!("Cannot activate plugin '{}': {}", module, message);
    PluginError::Activation {
        module: module.to_string(),
        message,
    }
}
