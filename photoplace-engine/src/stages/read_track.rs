//! ReadTrack stage: loads a GPS track file into the Domain State

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use photoplace_common::events::{CallArgs, Phase};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use super::StageLocks;
use crate::collaborators::TrackSource;
use crate::model::Track;
use crate::stage::{payload, Stage, StageContext};
use crate::state::Resource;

/// Replaces the Domain State track with the points of a track file
pub struct ReadTrack {
    file: PathBuf,
    source: Arc<dyn TrackSource>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrackSummary {
    pub points: usize,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl ReadTrack {
    pub fn new(file: impl Into<PathBuf>, source: Arc<dyn TrackSource>) -> Self {
        Self {
            file: file.into(),
            source,
        }
    }
}

impl StageLocks for ReadTrack {
    const LOCKS: &'static [Resource] = &[Resource::Track];
}

impl Stage for ReadTrack {
    const NAME: &'static str = "ReadTrack";
    type Setup = PathBuf;
    type Output = TrackSummary;

    fn setup(&mut self, ctx: &mut StageContext<'_>, _args: &CallArgs) -> anyhow::Result<PathBuf> {
        if !self.file.is_file() {
            anyhow::bail!("track file '{}' does not exist", self.file.display());
        }
        ctx.emit(
            Phase::Ini,
            CallArgs::new().arg(self.file.to_string_lossy().to_string()),
        );
        info!("Reading track {:?} ...", self.file);
        Ok(self.file.clone())
    }

    fn execute(&mut self, ctx: &mut StageContext<'_>, file: PathBuf) -> anyhow::Result<TrackSummary> {
        let points = self.source.read(&file)?;
        let track = Track::new(Some(file), points);
        let range = track.time_range();
        let summary = TrackSummary {
            points: track.points.len(),
            start: range.map(|(start, _)| start),
            end: range.map(|(_, end)| end),
        };

        ctx.emit(Phase::Run, CallArgs::new().arg(payload(&summary)));
        *ctx.track()? = track;
        Ok(summary)
    }

    fn finalize(&mut self, ctx: &mut StageContext<'_>, output: &TrackSummary) -> anyhow::Result<Value> {
        ctx.emit(Phase::End, CallArgs::new().arg(output.points));
        info!("{:?}: {} track points loaded", self.file, output.points);
        Ok(payload(output))
    }
}
