//! Bus observer forwarding stage lifecycle events to the plugin dispatcher

use std::sync::Arc;

use photoplace_common::events::{Bus, CallArgs, EventNames, ObserverRef, SubscribeOutcome};
use tracing::warn;

use super::PluginManager;

/// Forwards every event it is subscribed to into [`PluginManager::trigger`]
///
/// Plugin failures are logged here and never reach the bus, so a broken
/// plugin never counts as a failed delivery.
#[derive(Clone)]
pub struct PluginBridge {
    observer: ObserverRef,
}

impl PluginBridge {
    pub fn new(manager: Arc<PluginManager>) -> Self {
        let observer = ObserverRef::new("plugin-bridge", move |delivery| {
            let errors = manager.trigger(delivery.event, &delivery.args);
            for (module, error) in &errors {
                warn!(
                    "Plugin '{}' reported an error on '{}': {:#}",
                    module, delivery.event, error
                );
            }
            Ok(())
        });
        Self { observer }
    }

    pub fn observer(&self) -> &ObserverRef {
        &self.observer
    }

    /// Subscribe to every lifecycle event of one stage type
    pub fn attach(&self, bus: &Bus, names: &EventNames) -> SubscribeOutcome {
        bus.subscribe(&self.observer, names.all(), CallArgs::new())
    }

    pub fn detach(&self, bus: &Bus) -> bool {
        bus.unsubscribe(&self.observer)
    }
}
