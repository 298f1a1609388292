//! Stage runner: lock discipline and lifecycle events around one stage run

use std::sync::Arc;

use photoplace_common::events::{Bus, CallArgs, EventNames, Phase};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{payload, Stage, StageContext, Step};
use crate::error::{Error, Result};
use crate::state::{DomainState, Resource};

/// Single-use executor of one stage
///
/// Run sequence:
/// 1. Take the coarse state lock, then every declared resource lock in
///    declared order, then release the state lock
/// 2. Emit `start` with a snapshot of the held state and the call args
/// 3. `setup`, emit `startgo` with its result
/// 4. `execute`, emit `finishgo` with its result
/// 5. `finalize`, emit `finish` with its result
/// 6. Release every resource lock exactly once, on every exit path
/// 7. Return the execute result, or the step error wrapped in
///    [`Error::Stage`]
pub struct StageRunner<S: Stage> {
    stage: S,
    state: Arc<DomainState>,
    bus: Bus,
    locks: Vec<Resource>,
    names: EventNames,
}

impl<S: Stage> StageRunner<S> {
    /// Prepare a run of `stage` over `locks`
    ///
    /// Rejects a lock list naming the same resource twice.
    pub fn new(stage: S, state: Arc<DomainState>, locks: Vec<Resource>) -> Result<Self> {
        for (i, resource) in locks.iter().enumerate() {
            if locks[..i].contains(resource) {
                return Err(Error::InvalidLockSet(format!(
                    "{} declares '{}' twice",
                    S::NAME,
                    resource
                )));
            }
        }

        Ok(Self {
            stage,
            state,
            bus: Bus::new(),
            locks,
            names: EventNames::new(S::NAME),
        })
    }

    /// Publish lifecycle events on `bus` instead of a private one
    pub fn with_bus(mut self, bus: Bus) -> Self {
        self.bus = bus;
        self
    }

    /// Separator between stage name and phase tag
    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        self.names = self.names.separated_by(separator);
        self
    }

    /// Publish `phase` under an explicit event name
    pub fn with_event_override(mut self, phase: Phase, name: impl Into<String>) -> Self {
        self.names = self.names.with_override(phase, name);
        self
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn names(&self) -> &EventNames {
        &self.names
    }

    pub fn locks(&self) -> &[Resource] {
        &self.locks
    }

    pub fn stage(&self) -> &S {
        &self.stage
    }

    /// Run synchronously on the calling thread
    pub fn run(mut self, args: CallArgs) -> Result<S::Output> {
        let state = Arc::clone(&self.state);
        let run_id = Uuid::new_v4();

        debug!(stage = S::NAME, %run_id, locks = ?self.locks, "Acquiring stage locks");
        let resources = state.acquire(&self.locks);

        let mut ctx = StageContext::new(&self.bus, &self.names, &state, resources, run_id);
        let result = Self::steps(&mut self.stage, &mut ctx, args);
        drop(ctx);
        debug!(stage = S::NAME, %run_id, "Stage locks released");

        match &result {
            Ok(_) => info!(stage = S::NAME, %run_id, "Stage completed"),
            Err(e) => warn!(stage = S::NAME, %run_id, "Stage aborted: {}", e),
        }
        result
    }

    /// Run on a tokio blocking worker
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(self, args: CallArgs) -> StageHandle<S::Output> {
        StageHandle {
            stage: S::NAME,
            handle: tokio::task::spawn_blocking(move || self.run(args)),
        }
    }

    fn steps(stage: &mut S, ctx: &mut StageContext<'_>, args: CallArgs) -> Result<S::Output> {
        ctx.emit(Phase::Start, args.clone().prepend(ctx.state_snapshot()));

        let setup = stage
            .setup(ctx, &args)
            .map_err(|source| stage_error::<S>(Step::Setup, source))?;
        ctx.emit(Phase::StartGo, CallArgs::new().arg(payload(&setup)));

        let output = stage
            .execute(ctx, setup)
            .map_err(|source| stage_error::<S>(Step::Execute, source))?;
        ctx.emit(Phase::FinishGo, CallArgs::new().arg(payload(&output)));

        let finished = stage
            .finalize(ctx, &output)
            .map_err(|source| stage_error::<S>(Step::Finalize, source))?;
        ctx.emit(Phase::Finish, CallArgs::new().arg(finished));

        Ok(output)
    }
}

fn stage_error<S: Stage>(step: Step, source: anyhow::Error) -> Error {
    Error::Stage {
        stage: S::NAME.to_string(),
        step,
        source,
    }
}

/// Pending stage run on a worker
pub struct StageHandle<T> {
    stage: &'static str,
    handle: JoinHandle<Result<T>>,
}

impl<T> StageHandle<T> {
    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the run; a panicking worker becomes [`Error::Worker`]
    pub async fn join(self) -> Result<T> {
        self.handle
            .await
            .map_err(|e| Error::Worker(format!("{} worker: {}", self.stage, e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use photoplace_common::config::MainConfig;
    use photoplace_common::events::ObserverRef;
    use std::sync::Mutex;

    struct Defaults;

    impl Stage for Defaults {
        const NAME: &'static str = "Defaults";
        type Setup = ();
        type Output = ();
    }

    fn state() -> Arc<DomainState> {
        Arc::new(DomainState::new(MainConfig::default()))
    }

    fn recording_bus() -> (Bus, Arc<Mutex<Vec<String>>>) {
        let bus = Bus::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let observer = ObserverRef::new("recorder", move |d| {
            sink.lock().unwrap().push(d.event.to_string());
            Ok(())
        });
        bus.subscribe(&observer, None::<&str>, CallArgs::new());
        (bus, events)
    }

    #[test]
    fn test_rejects_duplicate_locks() {
        let result = StageRunner::new(Defaults, state(), vec![Resource::Photos, Resource::Photos]);
        assert!(matches!(result, Err(Error::InvalidLockSet(_))));
    }

    #[test]
    fn test_default_steps_emit_all_phases_in_order() {
        let (bus, events) = recording_bus();
        StageRunner::new(Defaults, state(), vec![])
            .unwrap()
            .with_bus(bus)
            .run(CallArgs::new())
            .unwrap();

        let expected: Vec<String> = EventNames::new("Defaults").all();
        assert_eq!(*events.lock().unwrap(), expected);
    }

    #[test]
    fn test_separator_and_override() {
        let (bus, events) = recording_bus();
        StageRunner::new(Defaults, state(), vec![])
            .unwrap()
            .with_event_override(Phase::Run, "defaults-progress")
            .with_separator(".")
            .with_bus(bus)
            .run(CallArgs::new())
            .unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events[0], "Defaults.start");
        assert!(events.contains(&"defaults-progress".to_string()));
    }
}
