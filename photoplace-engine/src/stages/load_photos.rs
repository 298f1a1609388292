//! LoadPhotos stage: reads a directory of photos into the Domain State

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Duration;
use photoplace_common::events::{CallArgs, Phase};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::StageLocks;
use crate::collaborators::PhotoSource;
use crate::stage::{payload, Stage, StageContext};
use crate::state::Resource;

/// Adds the photos of a directory to the Domain State, kept sorted by time
pub struct LoadPhotos {
    dir: PathBuf,
    append: bool,
    source: Arc<dyn PhotoSource>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    /// Photos read by this run
    pub loaded: usize,
    /// Photos in the Domain State afterwards
    pub total: usize,
}

impl LoadPhotos {
    pub fn new(dir: impl Into<PathBuf>, source: Arc<dyn PhotoSource>) -> Self {
        Self {
            dir: dir.into(),
            append: true,
            source,
        }
    }

    /// Drop previously loaded photos first
    pub fn replacing(mut self) -> Self {
        self.append = false;
        self
    }
}

impl StageLocks for LoadPhotos {
    const LOCKS: &'static [Resource] = &[Resource::Photos];
}

impl Stage for LoadPhotos {
    const NAME: &'static str = "LoadPhotos";
    type Setup = Vec<PathBuf>;
    type Output = LoadSummary;

    fn setup(&mut self, ctx: &mut StageContext<'_>, _args: &CallArgs) -> anyhow::Result<Vec<PathBuf>> {
        let files = self.source.list(&self.dir)?;
        ctx.emit(
            Phase::Ini,
            CallArgs::new()
                .arg(self.append)
                .arg(self.dir.to_string_lossy().to_string())
                .arg(files.len()),
        );
        info!("Processing photos in {:?} ...", self.dir);
        if !self.append {
            ctx.photos()?.clear();
        }
        Ok(files)
    }

    fn execute(&mut self, ctx: &mut StageContext<'_>, files: Vec<PathBuf>) -> anyhow::Result<LoadSummary> {
        let offset_seconds = ctx.settings().time_offset_seconds;
        let offset = Duration::try_seconds(offset_seconds)
            .with_context(|| format!("Time offset of {} seconds is out of range", offset_seconds))?;
        let events = ctx.emitter();
        let photos = ctx.photos()?;

        let mut loaded = 0;
        for path in files {
            let mut photo = match self.source.read(&path) {
                Ok(photo) => photo,
                Err(e) => {
                    warn!("Error processing photo {:?}: {:#}", path, e);
                    continue;
                }
            };
            photo.status = 1;
            photo.time = photo.time.checked_add_signed(offset).with_context(|| {
                format!("Time offset of {} seconds is out of range for {:?}", offset_seconds, path)
            })?;
            events.emit(Phase::Run, CallArgs::new().arg(payload(&photo)));

            let position = photos
                .iter()
                .position(|existing| photo.time <= existing.time)
                .unwrap_or(photos.len());
            photos.insert(position, photo);
            loaded += 1;
            debug!("Photo {:?} was processed properly", path);
        }

        Ok(LoadSummary {
            loaded,
            total: photos.len(),
        })
    }

    fn finalize(&mut self, ctx: &mut StageContext<'_>, output: &LoadSummary) -> anyhow::Result<Value> {
        ctx.emit(Phase::End, CallArgs::new().arg(output.loaded));
        info!("{:?}: {} photos have been processed", self.dir, output.loaded);
        Ok(payload(output))
    }
}
