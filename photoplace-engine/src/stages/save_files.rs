//! SaveFiles stage: writes the KML document and copies photos next to it

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use photoplace_common::events::{CallArgs, Phase};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::StageLocks;
use crate::stage::{payload, Stage, StageContext};
use crate::state::Resource;

/// Writes the KML document and optionally copies the photos next to it
///
/// Copy modes: 0 none, 1 geotagged photos only, 2 every loaded photo.
#[derive(Debug, Clone)]
pub struct SaveFiles {
    output: PathBuf,
    copy_mode: u8,
    photo_uri: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SaveSetup {
    pub output: PathBuf,
    /// Where photos get copied; `None` when copying is off or the URI is remote
    pub copy_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SaveSummary {
    /// Files written, the KML included
    pub files: usize,
    pub copies: usize,
}

impl SaveFiles {
    pub fn new(output: impl Into<PathBuf>, copy_mode: u8, photo_uri: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            copy_mode,
            photo_uri: photo_uri.into(),
        }
    }

    /// Local directory the photo URI points at, relative to the output file
    fn copy_dir(&self) -> Option<PathBuf> {
        if self.copy_mode == 0 || self.photo_uri.contains("://") || self.photo_uri.contains('%') {
            return None;
        }
        let base = self.output.parent().unwrap_or_else(|| Path::new(""));
        Some(base.join(&self.photo_uri))
    }
}

impl StageLocks for SaveFiles {
    const LOCKS: &'static [Resource] = &[Resource::Photos, Resource::Kml];
}

impl Stage for SaveFiles {
    const NAME: &'static str = "SaveFiles";
    type Setup = SaveSetup;
    type Output = SaveSummary;

    fn setup(&mut self, ctx: &mut StageContext<'_>, _args: &CallArgs) -> anyhow::Result<SaveSetup> {
        if let Some(parent) = self.output.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("cannot create output directory '{}'", parent.display()))?;
        }
        let copy_dir = self.copy_dir();
        if let Some(dir) = &copy_dir {
            fs::create_dir_all(dir)
                .with_context(|| format!("cannot create photo directory '{}'", dir.display()))?;
        }

        let rendered = ctx.kml()?.render();
        fs::write(&self.output, rendered)
            .with_context(|| format!("cannot write '{}'", self.output.display()))?;

        ctx.emit(
            Phase::Ini,
            CallArgs::new()
                .arg(self.output.to_string_lossy().to_string())
                .arg(Value::Null)
                .arg(self.photo_uri.clone())
                .arg(
                    copy_dir
                        .as_ref()
                        .map(|d| Value::from(d.to_string_lossy().to_string()))
                        .unwrap_or(Value::Null),
                )
                .arg(1),
        );
        info!("Generating outputs in {:?} ...", self.output);

        Ok(SaveSetup {
            output: self.output.clone(),
            copy_dir,
        })
    }

    fn execute(&mut self, ctx: &mut StageContext<'_>, setup: SaveSetup) -> anyhow::Result<SaveSummary> {
        let events = ctx.emitter();
        let photos = ctx.photos()?;

        let mut summary = SaveSummary::default();
        if let Some(dir) = &setup.copy_dir {
            for photo in photos.iter() {
                let path = photo.path.to_string_lossy().to_string();
                events.emit(Phase::Run, CallArgs::new().arg(path.clone()).arg(0));
                if photo.status < 1 {
                    continue;
                }
                if self.copy_mode < 2 && !photo.is_geolocated() {
                    warn!("Ignoring not geolocated photo {:?} ({})", photo.path, photo.time);
                    events.emit(Phase::Run, CallArgs::new().arg(path).arg(-1));
                    continue;
                }

                let target = dir.join(&photo.name);
                match fs::copy(&photo.path, &target) {
                    Ok(_) => {
                        debug!("Photo {:?} copied to {:?}", photo.path, target);
                        events.emit(
                            Phase::Run,
                            CallArgs::new().arg(target.to_string_lossy().to_string()).arg(1),
                        );
                        summary.copies += 1;
                    }
                    Err(e) => error!("Cannot copy photo {:?} to {:?}: {}", photo.path, target, e),
                }
            }
        }

        events.emit(
            Phase::Run,
            CallArgs::new().arg(setup.output.to_string_lossy().to_string()).arg(1),
        );
        summary.files = summary.copies + 1;
        Ok(summary)
    }

    fn finalize(&mut self, ctx: &mut StageContext<'_>, output: &SaveSummary) -> anyhow::Result<Value> {
        ctx.emit(Phase::End, CallArgs::new().arg(output.files));
        info!("{} files written ({} photo copies)", output.files, output.copies);
        Ok(payload(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use chrono::NaiveDate;
    use photoplace_common::config::MainConfig;
    use photoplace_common::events::{Bus, ObserverRef};
    use serde_json::json;
    use tempfile::TempDir;

    use crate::model::GeoPhoto;
    use crate::state::DomainState;
    use crate::StageRunner;

    #[test]
    fn test_copy_dir_is_relative_to_output() {
        let stage = SaveFiles::new("/out/trip.kml", 1, "images/");
        assert_eq!(stage.copy_dir(), Some(PathBuf::from("/out/images/")));
    }

    #[test]
    fn test_no_copy_for_remote_or_pattern_uri() {
        assert_eq!(SaveFiles::new("/out/trip.kml", 2, "http://host/").copy_dir(), None);
        assert_eq!(SaveFiles::new("/out/trip.kml", 2, "img/%s").copy_dir(), None);
        assert_eq!(SaveFiles::new("/out/trip.kml", 0, "images/").copy_dir(), None);
    }

    #[test]
    fn test_run_events_report_each_photo() {
        let dir = TempDir::new().unwrap();
        let state = Arc::new(DomainState::new(MainConfig::default()));
        {
            let mut photos = state.photos().lock();
            for (name, status, located, exists) in [
                ("a.jpg", 2, true, true),
                ("b.jpg", 1, false, true),
                ("c.jpg", 2, true, false),
                ("d.jpg", 0, true, true),
            ] {
                let path = dir.path().join(name);
                if exists {
                    fs::write(&path, name).unwrap();
                }
                let time = NaiveDate::from_ymd_opt(2024, 5, 1)
                    .unwrap()
                    .and_hms_opt(10, 0, 0)
                    .unwrap();
                let mut photo = GeoPhoto::new(name, &path, time);
                photo.status = status;
                if located {
                    photo.lat = Some(40.0);
                    photo.lon = Some(-3.0);
                }
                photos.push(photo);
            }
        }

        let bus = Bus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let observer = ObserverRef::new("runs", move |delivery| {
            sink.lock().unwrap().push(delivery.args.positional.clone());
            Ok(())
        });
        bus.subscribe(&observer, "SaveFiles:run", CallArgs::new());

        let output = dir.path().join("out").join("trip.kml");
        let summary = StageRunner::new(
            SaveFiles::new(&output, 1, "images"),
            Arc::clone(&state),
            SaveFiles::LOCKS.to_vec(),
        )
        .unwrap()
        .with_bus(bus)
        .run(CallArgs::new())
        .unwrap();

        assert_eq!(summary, SaveSummary { files: 2, copies: 1 });
        let at = |name: &str| json!(dir.path().join(name).to_string_lossy());
        let copied = json!(dir.path().join("out").join("images").join("a.jpg").to_string_lossy());
        let expected = vec![
            vec![at("a.jpg"), json!(0)],
            vec![copied, json!(1)],
            vec![at("b.jpg"), json!(0)],
            vec![at("b.jpg"), json!(-1)],
            vec![at("c.jpg"), json!(0)],
            vec![at("d.jpg"), json!(0)],
            vec![json!(output.to_string_lossy()), json!(1)],
        ];
        assert_eq!(*log.lock().unwrap(), expected);
    }
}
