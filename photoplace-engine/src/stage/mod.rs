//! Pipeline stage abstraction
//!
//! A stage is a three-step unit of work (setup → execute → finalize) that
//! runs while holding its declared resource locks and reports its lifecycle
//! on a [`Bus`]. [`StageRunner`] owns the lock discipline and the
//! start/startgo/finishgo/finish events; the step bodies emit
//! ini/run/end themselves.

mod runner;

pub use runner::{StageHandle, StageRunner};

use std::fmt;

use photoplace_common::config::MainConfig;
use photoplace_common::events::{Bus, CallArgs, DeliveryReport, EventNames, Phase};
use serde::Serialize;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::model::{GeoPhoto, KmlDocument, Track};
use crate::state::{DomainState, HeldResources};

/// Step of a stage run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Setup,
    Execute,
    Finalize,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Step::Setup => "setup",
            Step::Execute => "execute",
            Step::Finalize => "finalize",
        })
    }
}

/// One pipeline unit
///
/// The stage value doubles as per-run scratch space: a runner consumes it
/// and it is never reused.
///
/// # Default steps
/// - `setup` emits `ini` and returns `Setup::default()`
/// - `execute` emits `run` and returns `Output::default()`
/// - `finalize` emits `end` and returns the output unchanged
pub trait Stage: Send + 'static {
    /// Stage type tag, used to derive event names
    const NAME: &'static str;

    /// Result of `setup`, handed to `execute`
    type Setup: Serialize + Default + Send + 'static;

    /// Result of `execute`, returned to the caller of `run`
    type Output: Serialize + Default + Send + 'static;

    /// Validate preconditions and prepare; fail fast when the stage cannot run
    fn setup(&mut self, ctx: &mut StageContext<'_>, _args: &CallArgs) -> anyhow::Result<Self::Setup> {
        ctx.emit(Phase::Ini, CallArgs::new());
        Ok(Self::Setup::default())
    }

    fn execute(&mut self, ctx: &mut StageContext<'_>, _setup: Self::Setup) -> anyhow::Result<Self::Output> {
        ctx.emit(Phase::Run, CallArgs::new());
        Ok(Self::Output::default())
    }

    fn finalize(&mut self, ctx: &mut StageContext<'_>, output: &Self::Output) -> anyhow::Result<Value> {
        ctx.emit(Phase::End, CallArgs::new());
        Ok(serde_json::to_value(output)?)
    }
}

/// Event publisher of one run
///
/// Detached from the context borrow, so a step can keep publishing while
/// it holds `&mut` access to locked data.
#[derive(Clone, Copy)]
pub struct Emitter<'a> {
    bus: &'a Bus,
    names: &'a EventNames,
}

impl Emitter<'_> {
    /// Publish the event of `phase` (override-aware)
    pub fn emit(&self, phase: Phase, args: CallArgs) -> DeliveryReport {
        self.bus.notify(&self.names.name(phase), &args)
    }

    /// Publish under an explicit event name
    pub fn emit_as(&self, event: &str, args: CallArgs) -> DeliveryReport {
        self.bus.notify(event, &args)
    }
}

/// What a step body can reach during a run
pub struct StageContext<'a> {
    bus: &'a Bus,
    names: &'a EventNames,
    state: &'a DomainState,
    resources: HeldResources<'a>,
    run_id: Uuid,
}

impl<'a> StageContext<'a> {
    pub(crate) fn new(
        bus: &'a Bus,
        names: &'a EventNames,
        state: &'a DomainState,
        resources: HeldResources<'a>,
        run_id: Uuid,
    ) -> Self {
        Self {
            bus,
            names,
            state,
            resources,
            run_id,
        }
    }

    /// Publish the event of `phase` (override-aware)
    pub fn emit(&self, phase: Phase, args: CallArgs) -> DeliveryReport {
        self.emitter().emit(phase, args)
    }

    /// Publish under an explicit event name
    pub fn emit_as(&self, event: &str, args: CallArgs) -> DeliveryReport {
        self.emitter().emit_as(event, args)
    }

    pub fn emitter(&self) -> Emitter<'a> {
        Emitter {
            bus: self.bus,
            names: self.names,
        }
    }

    pub fn event_name(&self, phase: Phase) -> String {
        self.names.name(phase)
    }

    /// Unique id of this run, for log correlation
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn settings(&self) -> MainConfig {
        self.state.settings()
    }

    pub fn resources(&mut self) -> &mut HeldResources<'a> {
        &mut self.resources
    }

    pub fn photos(&mut self) -> anyhow::Result<&mut Vec<GeoPhoto>> {
        self.resources.photos()
    }

    pub fn track(&mut self) -> anyhow::Result<&mut Track> {
        self.resources.track()
    }

    pub fn kml(&mut self) -> anyhow::Result<&mut KmlDocument> {
        self.resources.kml()
    }

    /// Domain State summary restricted to the held resources
    pub fn state_snapshot(&self) -> Value {
        self.resources.snapshot()
    }
}

/// JSON payload of a step result; `Null` if it cannot be represented
pub fn payload<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|e| {
        warn!("Cannot serialize event payload: {}", e);
        Value::Null
    })
}
