//! Session facade: one photo set, its plugins and its observers
//!
//! The session owns the Domain State and the plugin manager. Every stage it
//! builds gets a fresh bus wired with:
//! - the registered notifiers whose pattern matches a lifecycle event
//! - the plugin bridge, for all seven lifecycle events
//!
//! While an output run (`process`) is pending the session is busy: clearing,
//! plugin lifecycle calls, stage builders and another `process` are rejected
//! with [`Error::Busy`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use photoplace_common::config::{AppConfig, MainConfig};
use photoplace_common::events::{CallArgs, ObserverRef};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::collaborators::{CsvTrackSource, FsPhotoSource, PhotoSource, TrackSource};
use crate::error::{Error, PluginError, Result};
use crate::plugins::{
    CapabilityFilter, HostWidget, PluginBridge, PluginContext, PluginManager, PluginModule,
};
use crate::stage::{payload, Stage, StageRunner};
use crate::stages::{
    Geolocate, KmlSummary, LoadPhotos, MakeKml, ReadTrack, SaveFiles, SaveSummary, StageLocks,
};
use crate::state::DomainState;

/// Pattern used when a notifier names none
pub const MATCH_ALL: &str = ".*";

/// KML document name when no output file is configured
const DEFAULT_DOCUMENT_NAME: &str = "PhotoPlace";

/// Observer registered against an event-name pattern
#[derive(Clone)]
struct Notifier {
    pattern: String,
    regex: Regex,
    observer: ObserverRef,
    args: CallArgs,
}

/// How `process` runs the output stages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// On the calling thread, returning when both stages are done
    Wait,
    /// On blocking workers of the current tokio runtime
    Worker,
}

/// Results of one output run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessReport {
    pub kml: KmlSummary,
    pub saved: SaveSummary,
}

/// Outcome of [`Session::process`]
pub enum Processing {
    Done(ProcessReport),
    Pending(ProcessHandle),
}

/// Output run in progress on a worker; the session stays busy until it ends
pub struct ProcessHandle {
    handle: JoinHandle<Result<ProcessReport>>,
}

impl ProcessHandle {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn join(self) -> Result<ProcessReport> {
        self.handle
            .await
            .map_err(|e| Error::Worker(format!("process worker: {}", e)))?
    }
}

/// Clears the busy flag when dropped, panics included
struct BusyGuard {
    flag: Arc<AtomicBool>,
}

impl BusyGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| Error::Busy)?;
        Ok(Self {
            flag: Arc::clone(flag),
        })
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

pub struct Session {
    config: AppConfig,
    state: Arc<DomainState>,
    plugins: Arc<PluginManager>,
    bridge: PluginBridge,
    notifiers: RwLock<Vec<Notifier>>,
    busy: Arc<AtomicBool>,
    photo_source: Arc<dyn PhotoSource>,
    track_source: Arc<dyn TrackSource>,
}

impl Session {
    /// New session reading photos from disk and tracks from CSV files
    pub fn new(config: AppConfig) -> Result<Self> {
        config.validate()?;
        let photo_source = Arc::new(FsPhotoSource::new(&config.main.photo_pattern)?);
        let plugins = Arc::new(PluginManager::new());

        Ok(Self {
            state: Arc::new(DomainState::new(config.main.clone())),
            bridge: PluginBridge::new(Arc::clone(&plugins)),
            plugins,
            config,
            notifiers: RwLock::new(Vec::new()),
            busy: Arc::new(AtomicBool::new(false)),
            photo_source,
            track_source: Arc::new(CsvTrackSource),
        })
    }

    /// Replace the photo and track readers
    pub fn with_sources(mut self, photos: Arc<dyn PhotoSource>, tracks: Arc<dyn TrackSource>) -> Self {
        self.photo_source = photos;
        self.track_source = tracks;
        self
    }

    pub fn state(&self) -> &Arc<DomainState> {
        &self.state
    }

    pub fn plugins(&self) -> &Arc<PluginManager> {
        &self.plugins
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Current processing settings
    pub fn settings(&self) -> MainConfig {
        self.state.settings()
    }

    pub fn update_settings(&self, update: impl FnOnce(&mut MainConfig)) {
        self.state.update_settings(update);
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Notifiers
    // ========================================================================

    /// Register `observer` for every lifecycle event matching one of
    /// `patterns` (anchored at the start of the event name)
    ///
    /// An empty pattern list means every event. Applies to stages built
    /// after this call.
    pub fn add_notifier(&self, observer: &ObserverRef, patterns: &[&str], args: CallArgs) -> Result<()> {
        let patterns = if patterns.is_empty() {
            &[MATCH_ALL][..]
        } else {
            patterns
        };

        let mut compiled = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let regex = Regex::new(&format!("^(?:{})", pattern)).map_err(|e| {
                photoplace_common::Error::InvalidInput(format!("Invalid event pattern '{}': {}", pattern, e))
            })?;
            compiled.push(Notifier {
                pattern: pattern.to_string(),
                regex,
                observer: observer.clone(),
                args: args.clone(),
            });
        }

        debug!(observer = observer.name(), ?patterns, "Notifier added");
        self.write_notifiers().extend(compiled);
        Ok(())
    }

    /// Remove `observer` from one pattern, or from all of them
    ///
    /// Returns how many registrations were removed.
    pub fn del_notifier(&self, observer: &ObserverRef, pattern: Option<&str>) -> usize {
        let mut notifiers = self.write_notifiers();
        let before = notifiers.len();
        notifiers.retain(|n| !(n.observer.same(observer) && pattern.map_or(true, |p| n.pattern == p)));
        before - notifiers.len()
    }

    /// Drop every registration under `pattern`
    pub fn del_event(&self, pattern: &str) -> bool {
        let mut notifiers = self.write_notifiers();
        let before = notifiers.len();
        notifiers.retain(|n| n.pattern != pattern);
        before != notifiers.len()
    }

    /// Registered patterns, in registration order, without duplicates
    pub fn notifier_patterns(&self) -> Vec<String> {
        let mut patterns: Vec<String> = Vec::new();
        for notifier in self.read_notifiers().iter() {
            if !patterns.contains(&notifier.pattern) {
                patterns.push(notifier.pattern.clone());
            }
        }
        patterns
    }

    // ========================================================================
    // Plugins
    // ========================================================================

    /// Load the modules enabled in the `[addons]` table
    ///
    /// Returns the load errors keyed by module name.
    pub fn load_plugins(&self, modules: Vec<PluginModule>) -> BTreeMap<String, PluginError> {
        let mut errors = BTreeMap::new();
        for module in modules {
            let name = module.name().to_string();
            if !self.config.addon_enabled(&name) {
                debug!("Plugin '{}' not enabled, skipping", name);
                continue;
            }
            if let Err(e) = self.plugins.load(module) {
                error!("{}", e);
                errors.insert(name, e);
            }
        }
        errors
    }

    /// Build an instance of every loaded module accepted by `filter`
    pub fn activate_plugins(&self, filter: &CapabilityFilter) -> BTreeMap<String, PluginError> {
        let ctx = PluginContext {
            settings: self.settings(),
        };
        let mut errors = BTreeMap::new();
        for info in self.plugins.list_plugins(filter) {
            if let Err(e) = self.plugins.activate(&info.name, &ctx) {
                error!("{}", e);
                errors.insert(info.name, e);
            }
        }
        errors
    }

    /// Initialise the active plugins accepted by `filter`; stops at the first failure
    pub fn init_plugins(&self, filter: &CapabilityFilter, host: Option<&HostWidget>) -> Result<()> {
        self.ensure_idle("initiate addons")?;
        let options = self.plugin_options();
        for name in self.active_plugins(filter) {
            self.plugins.init(&name, &options, host)?;
        }
        Ok(())
    }

    pub fn reset_plugins(&self, filter: &CapabilityFilter) -> Result<()> {
        self.ensure_idle("reset addons")?;
        for name in self.active_plugins(filter) {
            self.plugins.reset(&name)?;
        }
        Ok(())
    }

    pub fn end_plugins(&self, filter: &CapabilityFilter) -> Result<()> {
        self.ensure_idle("finish addons")?;
        let options = self.plugin_options();
        for name in self.active_plugins(filter) {
            self.plugins.end(&name, &options)?;
        }
        Ok(())
    }

    /// End, then drop the active plugins accepted by `filter`
    pub fn unload_plugins(&self, filter: &CapabilityFilter) -> Result<()> {
        self.end_plugins(filter)?;
        for name in self.active_plugins(filter) {
            self.plugins.deactivate(&name);
        }
        Ok(())
    }

    fn active_plugins(&self, filter: &CapabilityFilter) -> Vec<String> {
        self.plugins
            .list_plugins(filter)
            .into_iter()
            .map(|info| info.name)
            .filter(|name| self.plugins.is_active(name))
            .collect()
    }

    fn plugin_options(&self) -> Value {
        payload(&self.settings())
    }

    // ========================================================================
    // Stages
    // ========================================================================

    /// Stage adding the photos of `dir` (default: configured input dir)
    pub fn load_photos(&self, dir: Option<&Path>) -> Result<StageRunner<LoadPhotos>> {
        self.ensure_idle("load photos")?;
        let dir = match dir {
            Some(dir) => dir.to_path_buf(),
            None => required(self.settings().photo_input_dir, "photo input directory")?,
        };
        let stored = dir.clone();
        self.update_settings(|s| s.photo_input_dir = Some(stored));
        self.wire(LoadPhotos::new(dir, Arc::clone(&self.photo_source)))
    }

    /// Stage replacing the track with `file` (default: configured track file)
    pub fn read_track(&self, file: Option<&Path>) -> Result<StageRunner<ReadTrack>> {
        let file = match file {
            Some(file) => file.to_path_buf(),
            None => required(self.settings().track_file, "track file")?,
        };
        let stored = file.clone();
        self.update_settings(|s| s.track_file = Some(stored));
        self.wire(ReadTrack::new(file, Arc::clone(&self.track_source)))
    }

    pub fn geolocate(&self) -> Result<StageRunner<Geolocate>> {
        self.ensure_idle("geolocate")?;
        self.wire(Geolocate::new())
    }

    pub fn make_kml(&self) -> Result<StageRunner<MakeKml>> {
        self.ensure_idle("make KML")?;
        self.make_kml_runner()
    }

    pub fn save_files(&self) -> Result<StageRunner<SaveFiles>> {
        self.ensure_idle("save files")?;
        self.save_files_runner()
    }

    fn make_kml_runner(&self) -> Result<StageRunner<MakeKml>> {
        let settings = self.settings();
        let name = settings
            .output_file
            .as_deref()
            .and_then(Path::file_stem)
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_else(|| DEFAULT_DOCUMENT_NAME.to_string());
        self.wire(MakeKml::new(name, settings.photo_uri))
    }

    fn save_files_runner(&self) -> Result<StageRunner<SaveFiles>> {
        let settings = self.settings();
        let output = required(settings.output_file, "output file")?;
        self.wire(SaveFiles::new(output, settings.copy_mode, settings.photo_uri))
    }

    /// Runner for `stage` on a fresh bus carrying notifiers and the plugin bridge
    fn wire<S: Stage + StageLocks>(&self, stage: S) -> Result<StageRunner<S>> {
        let separator = self.settings().event_separator;
        let runner = StageRunner::new(stage, Arc::clone(&self.state), S::LOCKS.to_vec())?
            .with_separator(separator);

        let bus = runner.bus();
        let events = runner.names().all();
        for notifier in self.read_notifiers().iter() {
            for event in events.iter().filter(|e| notifier.regex.is_match(e)) {
                if bus.is_subscribed(&notifier.observer) {
                    bus.subscribe(&notifier.observer, event.as_str(), notifier.args.clone());
                } else {
                    bus.subscribe(&notifier.observer, vec![event.clone()], notifier.args.clone());
                }
            }
        }
        self.bridge.attach(bus, runner.names());

        debug!(stage = S::NAME, observers = bus.observer_count(), "Stage wired");
        Ok(runner)
    }

    // ========================================================================
    // Processing
    // ========================================================================

    /// Build the KML, then write it and copy photos
    ///
    /// `RunMode::Worker` must be called from within a tokio runtime. The
    /// session is busy until the run ends, success or not.
    pub fn process(&self, mode: RunMode) -> Result<Processing> {
        let guard = BusyGuard::acquire(&self.busy)?;
        let make_kml = self.make_kml_runner()?;
        let save_files = self.save_files_runner()?;
        info!(?mode, "Processing outputs");

        match mode {
            RunMode::Wait => {
                let kml = make_kml.run(CallArgs::new())?;
                let saved = save_files.run(CallArgs::new())?;
                drop(guard);
                Ok(Processing::Done(ProcessReport { kml, saved }))
            }
            RunMode::Worker => {
                let handle = tokio::spawn(async move {
                    let _guard = guard;
                    let kml = make_kml.spawn(CallArgs::new()).join().await?;
                    let saved = save_files.spawn(CallArgs::new()).join().await?;
                    Ok::<_, Error>(ProcessReport { kml, saved })
                });
                Ok(Processing::Pending(ProcessHandle { handle }))
            }
        }
    }

    /// Drop photos, track and KML
    pub fn clear(&self) -> Result<()> {
        self.ensure_idle("clear state")?;
        self.state.clear();
        Ok(())
    }

    fn ensure_idle(&self, operation: &str) -> Result<()> {
        if self.is_busy() {
            error!("Cannot {} while some operations are pending", operation);
            return Err(Error::Busy);
        }
        Ok(())
    }

    fn read_notifiers(&self) -> std::sync::RwLockReadGuard<'_, Vec<Notifier>> {
        self.notifiers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_notifiers(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Notifier>> {
        self.notifiers.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn required(value: Option<PathBuf>, what: &str) -> Result<PathBuf> {
    value.ok_or_else(|| photoplace_common::Error::InvalidInput(format!("No {} configured", what)).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use photoplace_common::events::{EventFilter, Phase};

    fn session() -> Session {
        Session::new(AppConfig::default()).unwrap()
    }

    #[test]
    fn test_notifier_wiring_merges_into_one_set() {
        let session = session();
        let observer = ObserverRef::new("watcher", |_| Ok(()));
        session
            .add_notifier(&observer, &["Geolocate:(ini|end)"], CallArgs::new())
            .unwrap();

        let runner = session.geolocate().unwrap();
        let bindings = runner.bus().bindings(&observer).unwrap();
        assert_eq!(bindings.len(), 1);
        assert_eq!(
            bindings[0].filter,
            EventFilter::OneOf(vec!["Geolocate:ini".to_string(), "Geolocate:end".to_string()])
        );
    }

    #[test]
    fn test_patterns_anchor_at_start() {
        let session = session();
        let observer = ObserverRef::new("watcher", |_| Ok(()));
        session.add_notifier(&observer, &["ini"], CallArgs::new()).unwrap();

        let runner = session.geolocate().unwrap();
        assert!(!runner.bus().is_subscribed(&observer));
    }

    #[test]
    fn test_bridge_attached_to_every_stage() {
        let session = session();
        let runner = session.geolocate().unwrap();
        let bindings = runner.bus().bindings(session.bridge.observer()).unwrap();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].filter.names().len(), Phase::ALL.len());
    }

    #[test]
    fn test_del_notifier_and_event() {
        let session = session();
        let a = ObserverRef::new("a", |_| Ok(()));
        let b = ObserverRef::new("b", |_| Ok(()));
        session.add_notifier(&a, &["Load.*", "Save.*"], CallArgs::new()).unwrap();
        session.add_notifier(&b, &["Save.*"], CallArgs::new()).unwrap();

        assert_eq!(session.del_notifier(&a, Some("Save.*")), 1);
        assert_eq!(session.notifier_patterns(), vec!["Load.*", "Save.*"]);
        assert!(session.del_event("Save.*"));
        assert!(!session.del_event("Save.*"));
        assert_eq!(session.del_notifier(&a, None), 1);
        assert!(session.notifier_patterns().is_empty());
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let session = session();
        let observer = ObserverRef::new("watcher", |_| Ok(()));
        assert!(session.add_notifier(&observer, &["("], CallArgs::new()).is_err());
    }

    #[test]
    fn test_busy_rejects_operations() {
        let session = session();
        let guard = BusyGuard::acquire(&session.busy).unwrap();

        assert!(matches!(session.clear(), Err(Error::Busy)));
        assert!(matches!(session.geolocate(), Err(Error::Busy)));
        assert!(matches!(session.end_plugins(&CapabilityFilter::Any), Err(Error::Busy)));
        assert!(matches!(session.process(RunMode::Wait), Err(Error::Busy)));

        drop(guard);
        assert!(session.clear().is_ok());
    }

    #[test]
    fn test_save_files_requires_output() {
        let session = session();
        assert!(matches!(session.save_files(), Err(Error::Common(_))));
    }
}
