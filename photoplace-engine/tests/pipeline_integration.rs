//! Integration tests for stage runs: lock discipline, event order, workers

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use photoplace_common::config::MainConfig;
use photoplace_common::events::{Bus, CallArgs, ObserverRef, Phase};
use photoplace_engine::{DomainState, Error, Resource, Stage, StageContext, StageRunner, Step};
use serde_json::{json, Value};

fn state() -> Arc<DomainState> {
    Arc::new(DomainState::new(MainConfig::default()))
}

fn recording_bus() -> (Bus, Arc<Mutex<Vec<(String, Vec<Value>)>>>) {
    let bus = Bus::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let observer = ObserverRef::new("recorder", move |delivery| {
        sink.lock()
            .unwrap()
            .push((delivery.event.to_string(), delivery.args.positional.clone()));
        Ok(())
    });
    bus.subscribe(&observer, None::<&str>, CallArgs::new());
    (bus, log)
}

fn assert_balanced(state: &DomainState, resources: &[Resource], expected: usize) {
    for resource in resources {
        assert_eq!(
            state.lock_counts(*resource),
            (expected, expected),
            "{} lock counters",
            resource
        );
    }
}

/// Fails in the step named by `fail_in`
struct Faulty {
    fail_in: Option<Step>,
    panic: bool,
}

impl Faulty {
    fn check(&self, step: Step) -> anyhow::Result<()> {
        if self.fail_in == Some(step) {
            if self.panic {
                panic!("{} exploded", step);
            }
            anyhow::bail!("{} failed", step);
        }
        Ok(())
    }
}

impl Stage for Faulty {
    const NAME: &'static str = "Faulty";
    type Setup = ();
    type Output = u32;

    fn setup(&mut self, ctx: &mut StageContext<'_>, _args: &CallArgs) -> anyhow::Result<()> {
        ctx.emit(Phase::Ini, CallArgs::new());
        self.check(Step::Setup)
    }

    fn execute(&mut self, ctx: &mut StageContext<'_>, _setup: ()) -> anyhow::Result<u32> {
        ctx.emit(Phase::Run, CallArgs::new());
        self.check(Step::Execute)?;
        Ok(7)
    }

    fn finalize(&mut self, ctx: &mut StageContext<'_>, output: &u32) -> anyhow::Result<Value> {
        ctx.emit(Phase::End, CallArgs::new());
        self.check(Step::Finalize)?;
        Ok(json!(output))
    }
}

#[test]
fn test_successful_run_emits_lifecycle_in_order() {
    let state = state();
    let (bus, log) = recording_bus();

    let output = StageRunner::new(
        Faulty {
            fail_in: None,
            panic: false,
        },
        Arc::clone(&state),
        vec![Resource::Photos],
    )
    .unwrap()
    .with_bus(bus)
    .run(CallArgs::new().arg("go"))
    .unwrap();

    assert_eq!(output, 7);
    let log = log.lock().unwrap();
    let events: Vec<&str> = log.iter().map(|(e, _)| e.as_str()).collect();
    assert_eq!(
        events,
        vec![
            "Faulty:start",
            "Faulty:ini",
            "Faulty:startgo",
            "Faulty:run",
            "Faulty:finishgo",
            "Faulty:end",
            "Faulty:finish",
        ]
    );
    // start carries the state snapshot, then the call args
    assert_eq!(log[0].1[0]["photos"]["total"], json!(0));
    assert_eq!(log[0].1[1], json!("go"));
    assert_eq!(log[4].1, vec![json!(7)]);
    assert_balanced(&state, &[Resource::Photos], 1);
}

#[test]
fn test_setup_failure_releases_every_lock() {
    let state = state();
    let locks = [Resource::Photos, Resource::Track];
    let (bus, log) = recording_bus();

    let result = StageRunner::new(
        Faulty {
            fail_in: Some(Step::Setup),
            panic: false,
        },
        Arc::clone(&state),
        locks.to_vec(),
    )
    .unwrap()
    .with_bus(bus)
    .run(CallArgs::new());

    let err = result.unwrap_err();
    assert_eq!(err.step(), Some(Step::Setup));
    assert!(matches!(err, Error::Stage { ref stage, .. } if stage == "Faulty"));
    assert_balanced(&state, &locks, 1);
    assert_balanced(&state, &[Resource::Kml], 0);

    let log = log.lock().unwrap();
    assert!(
        !log.iter().any(|(e, _)| e == "Faulty:startgo"),
        "no startgo after a failed setup"
    );
}

#[test]
fn test_failures_in_later_steps_release_locks() {
    for step in [Step::Execute, Step::Finalize] {
        let state = state();
        let result = StageRunner::new(
            Faulty {
                fail_in: Some(step),
                panic: false,
            },
            Arc::clone(&state),
            Resource::CANONICAL.to_vec(),
        )
        .unwrap()
        .run(CallArgs::new());

        assert_eq!(result.unwrap_err().step(), Some(step));
        assert_balanced(&state, &Resource::CANONICAL, 1);
    }
}

#[test]
fn test_panicking_step_still_releases_locks() {
    let state = state();
    let runner = StageRunner::new(
        Faulty {
            fail_in: Some(Step::Execute),
            panic: true,
        },
        Arc::clone(&state),
        vec![Resource::Photos, Resource::Kml],
    )
    .unwrap();

    let joined = thread::spawn(move || runner.run(CallArgs::new())).join();
    assert!(joined.is_err());
    assert_balanced(&state, &[Resource::Photos, Resource::Kml], 1);

    // The next run recovers the poisoned locks
    StageRunner::new(
        Faulty {
            fail_in: None,
            panic: false,
        },
        Arc::clone(&state),
        vec![Resource::Photos, Resource::Kml],
    )
    .unwrap()
    .run(CallArgs::new())
    .unwrap();
    assert_balanced(&state, &[Resource::Photos, Resource::Kml], 2);
}

/// Holds its locks for a while and records overlap with other runs
struct Slow {
    active: Arc<Mutex<usize>>,
    overlap: Arc<Mutex<bool>>,
}

impl Stage for Slow {
    const NAME: &'static str = "Slow";
    type Setup = ();
    type Output = ();

    fn execute(&mut self, _ctx: &mut StageContext<'_>, _setup: ()) -> anyhow::Result<()> {
        {
            let mut active = self.active.lock().unwrap();
            *active += 1;
            if *active > 1 {
                *self.overlap.lock().unwrap() = true;
            }
        }
        thread::sleep(Duration::from_millis(20));
        *self.active.lock().unwrap() -= 1;
        Ok(())
    }
}

#[test]
fn test_runs_sharing_a_resource_never_overlap() {
    let state = state();
    let active = Arc::new(Mutex::new(0));
    let overlap = Arc::new(Mutex::new(false));

    let workers: Vec<_> = (0..4)
        .map(|i| {
            // Both lock orders follow the canonical order
            let locks = if i % 2 == 0 {
                vec![Resource::Photos, Resource::Track]
            } else {
                vec![Resource::Photos, Resource::Kml]
            };
            let runner = StageRunner::new(
                Slow {
                    active: Arc::clone(&active),
                    overlap: Arc::clone(&overlap),
                },
                Arc::clone(&state),
                locks,
            )
            .unwrap();
            thread::spawn(move || runner.run(CallArgs::new()))
        })
        .collect();

    for worker in workers {
        worker.join().unwrap().unwrap();
    }

    assert!(!*overlap.lock().unwrap());
    assert_eq!(state.lock_counts(Resource::Photos), (4, 4));
    assert_eq!(state.lock_counts(Resource::Track), (2, 2));
    assert_eq!(state.lock_counts(Resource::Kml), (2, 2));
}

#[test]
fn test_event_override_renames_one_phase() {
    let (bus, log) = recording_bus();
    StageRunner::new(
        Faulty {
            fail_in: None,
            panic: false,
        },
        state(),
        vec![],
    )
    .unwrap()
    .with_separator(".")
    .with_event_override(Phase::Run, "custom-run")
    .with_bus(bus)
    .run(CallArgs::new())
    .unwrap();

    let log = log.lock().unwrap();
    assert!(log.iter().any(|(e, _)| e == "custom-run"));
    assert!(log.iter().any(|(e, _)| e == "Faulty.start"));
    assert!(!log.iter().any(|(e, _)| e == "Faulty.run"));
}

#[tokio::test]
async fn test_spawned_run_reports_result() {
    let state = state();
    let handle = StageRunner::new(
        Faulty {
            fail_in: None,
            panic: false,
        },
        Arc::clone(&state),
        vec![Resource::Track],
    )
    .unwrap()
    .spawn(CallArgs::new());

    assert_eq!(handle.stage(), "Faulty");
    assert_eq!(handle.join().await.unwrap(), 7);
    assert_balanced(&state, &[Resource::Track], 1);
}

#[tokio::test]
async fn test_spawned_panic_becomes_worker_error() {
    let state = state();
    let handle = StageRunner::new(
        Faulty {
            fail_in: Some(Step::Finalize),
            panic: true,
        },
        Arc::clone(&state),
        vec![Resource::Kml],
    )
    .unwrap()
    .spawn(CallArgs::new());

    assert!(matches!(handle.join().await, Err(Error::Worker(_))));
    assert_balanced(&state, &[Resource::Kml], 1);
}
