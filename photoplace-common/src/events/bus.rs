//! Notification bus: observer registry + best-effort fan-out
//!
//! Producers call [`Bus::notify`] with an event name; every observer binding
//! whose filter matches is invoked with its bound arguments merged in front
//! of the call-time ones.
//!
//! # Failure isolation
//! - An observer returning `Err` or panicking is logged and counted
//! - Remaining observers and bindings still run
//! - `notify` itself never fails
//!
//! # Re-entrancy
//! Observers may call `notify` from inside their callback. The registry is
//! snapshotted before dispatch and each observer keeps one stack of replay
//! states per thread, so a nested delivery never clobbers the outer one and
//! concurrent deliveries on other threads never see each other's state.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, ThreadId};

use tracing::{debug, warn};

use super::args::CallArgs;
use super::filter::{merge_binding, Binding, EventFilter, SubscribeOutcome};

type Callback = dyn Fn(&Delivery<'_>) -> anyhow::Result<()> + Send + Sync;

static NEXT_OBSERVER_ID: AtomicU64 = AtomicU64::new(1);

/// One invocation handed to an observer callback
pub struct Delivery<'a> {
    /// Event being delivered
    pub event: &'a str,
    /// Bound arguments followed by call-time arguments
    pub args: CallArgs,
    /// The observer being invoked
    pub observer: &'a ObserverRef,
}

/// Replay state of one in-flight delivery
#[derive(Debug, Clone)]
struct Replay {
    event: String,
    binding: Binding,
}

struct ObserverInner {
    id: u64,
    name: String,
    callback: Box<Callback>,
    replay: Mutex<HashMap<ThreadId, Vec<Replay>>>,
    calls: AtomicUsize,
}

/// Shared handle to an observer callback
///
/// Identity is the handle itself: clones refer to the same observer, two
/// separately created observers never compare equal even with equal names.
#[derive(Clone)]
pub struct ObserverRef {
    inner: Arc<ObserverInner>,
}

impl ObserverRef {
    /// Wrap a callback as an observer
    pub fn new<F>(name: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&Delivery<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(ObserverInner {
                id: NEXT_OBSERVER_ID.fetch_add(1, Ordering::Relaxed),
                name: name.into(),
                callback: Box::new(callback),
                replay: Mutex::new(HashMap::new()),
                calls: AtomicUsize::new(0),
            }),
        }
    }

    /// Process-unique observer id
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Name used in logs
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of times the callback has been invoked
    pub fn calls(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }

    /// Binding of the innermost delivery running on this thread, if any
    pub fn current(&self) -> Option<Binding> {
        self.innermost(|r| r.binding.clone())
    }

    /// Event of the innermost delivery running on this thread, if any
    pub fn current_event(&self) -> Option<String> {
        self.innermost(|r| r.event.clone())
    }

    /// True when both handles refer to the same observer
    pub fn same(&self, other: &ObserverRef) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn replay(&self) -> MutexGuard<'_, HashMap<ThreadId, Vec<Replay>>> {
        self.inner.replay.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn innermost<T>(&self, f: impl FnOnce(&Replay) -> T) -> Option<T> {
        self.replay()
            .get(&thread::current().id())
            .and_then(|stack| stack.last())
            .map(f)
    }

    /// Deliver one event under one binding
    ///
    /// Returns `None` when the filter did not match.
    fn deliver(&self, event: &str, binding: &Binding, call: &CallArgs) -> Option<anyhow::Result<()>> {
        if !binding.filter.matches(event) {
            return None;
        }

        self.replay().entry(thread::current().id()).or_default().push(Replay {
            event: event.to_string(),
            binding: binding.clone(),
        });
        let _restore = ReplayRestore { observer: self };

        self.inner.calls.fetch_add(1, Ordering::SeqCst);
        let delivery = Delivery {
            event,
            args: binding.args.merged_with(call),
            observer: self,
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| (self.inner.callback)(&delivery)));
        Some(match outcome {
            Ok(result) => result,
            Err(panic) => Err(anyhow::anyhow!("observer panicked: {}", panic_message(&*panic))),
        })
    }
}

impl PartialEq for ObserverRef {
    fn eq(&self, other: &Self) -> bool {
        self.same(other)
    }
}

impl Eq for ObserverRef {}

impl fmt::Debug for ObserverRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverRef")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("calls", &self.calls())
            .finish()
    }
}

/// Pops the replay state pushed by `deliver`, also when the callback panics
struct ReplayRestore<'a> {
    observer: &'a ObserverRef,
}

impl Drop for ReplayRestore<'_> {
    fn drop(&mut self) {
        let id = thread::current().id();
        let mut replay = self.observer.replay();
        if let Some(stack) = replay.get_mut(&id) {
            stack.pop();
            if stack.is_empty() {
                replay.remove(&id);
            }
        }
    }
}

/// Best-effort text of a caught panic payload
pub fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

struct Subscription {
    observer: ObserverRef,
    bindings: Vec<Binding>,
}

/// Counts of one `notify` fan-out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Bindings whose filter matched and whose observer was invoked
    pub invoked: usize,
    /// Invocations that returned an error or panicked
    pub failed: usize,
}

/// Observer registry with filtered, failure-isolated dispatch
///
/// Cloning is cheap and clones share the registry.
#[derive(Clone, Default)]
pub struct Bus {
    subscriptions: Arc<RwLock<Vec<Subscription>>>,
}

impl Bus {
    /// Creates an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a binding for `observer`
    ///
    /// See [`SubscribeOutcome`] for how a new binding is merged with the
    /// observer's existing ones.
    pub fn subscribe(
        &self,
        observer: &ObserverRef,
        filter: impl Into<EventFilter>,
        args: CallArgs,
    ) -> SubscribeOutcome {
        let binding = Binding::new(filter.into(), args);
        let mut subs = self.write();

        let outcome = match subs.iter_mut().find(|s| s.observer.same(observer)) {
            Some(sub) => merge_binding(&mut sub.bindings, binding),
            None => {
                let mut bindings = Vec::new();
                let outcome = merge_binding(&mut bindings, binding);
                subs.push(Subscription {
                    observer: observer.clone(),
                    bindings,
                });
                outcome
            }
        };

        debug!(observer = observer.name(), ?outcome, "Observer subscribed");
        outcome
    }

    /// Remove `observer` and all of its bindings
    ///
    /// Returns false when the observer was not registered.
    pub fn unsubscribe(&self, observer: &ObserverRef) -> bool {
        let mut subs = self.write();
        let before = subs.len();
        subs.retain(|s| !s.observer.same(observer));
        before != subs.len()
    }

    /// True when `observer` has at least one binding
    pub fn is_subscribed(&self, observer: &ObserverRef) -> bool {
        self.read().iter().any(|s| s.observer.same(observer))
    }

    /// Bindings of `observer`, in insertion order
    pub fn bindings(&self, observer: &ObserverRef) -> Option<Vec<Binding>> {
        self.read()
            .iter()
            .find(|s| s.observer.same(observer))
            .map(|s| s.bindings.clone())
    }

    /// Number of registered observers
    pub fn observer_count(&self) -> usize {
        self.read().len()
    }

    /// Deliver `event` to every matching binding
    ///
    /// Never fails. Observer errors and panics are logged with the
    /// observer's name and counted in the report.
    pub fn notify(&self, event: &str, args: &CallArgs) -> DeliveryReport {
        let snapshot: Vec<(ObserverRef, Vec<Binding>)> = self
            .read()
            .iter()
            .map(|s| (s.observer.clone(), s.bindings.clone()))
            .collect();

        let mut report = DeliveryReport::default();
        for (observer, bindings) in &snapshot {
            for binding in bindings {
                let Some(result) = observer.deliver(event, binding, args) else {
                    continue;
                };
                report.invoked += 1;
                if let Err(e) = result {
                    report.failed += 1;
                    warn!(
                        "Notification exception with observer '{}' on '{}': {}",
                        observer.name(),
                        event,
                        e
                    );
                }
            }
        }

        debug!(event, invoked = report.invoked, failed = report.failed, "Notified");
        report
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Subscription>> {
        self.subscriptions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Subscription>> {
        self.subscriptions.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("observers", &self.observer_count())
            .finish()
    }
}
