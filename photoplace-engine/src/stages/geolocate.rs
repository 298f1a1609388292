//! Geolocate stage: matches photo times against the loaded track

use anyhow::Context;
use chrono::{Duration, TimeZone, Utc};
use photoplace_common::events::{CallArgs, Phase};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::StageLocks;
use crate::model::{GeoPhoto, GeotagStatus, Track, TrackMatch};
use crate::stage::{payload, Stage, StageContext};
use crate::state::Resource;

/// Assigns track positions to the loaded photos
#[derive(Debug, Default)]
pub struct Geolocate;

/// Settings captured when the run starts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GeolocateSetup {
    pub utc_zone_minutes: i64,
    pub max_delta_seconds: u64,
    pub overwrite: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GeolocateSummary {
    pub geotagged: usize,
    pub kept: usize,
    pub uncovered: usize,
    pub too_far: usize,
    /// Photos examined (status of at least 1)
    pub total: usize,
}

impl GeolocateSummary {
    fn count(&mut self, status: GeotagStatus) {
        match status {
            GeotagStatus::Geotagged => self.geotagged += 1,
            GeotagStatus::KeptExisting => self.kept += 1,
            GeotagStatus::NoTrackCoverage => self.uncovered += 1,
            GeotagStatus::TooFar => self.too_far += 1,
        }
    }
}

impl Geolocate {
    pub fn new() -> Self {
        Self
    }
}

impl StageLocks for Geolocate {
    const LOCKS: &'static [Resource] = &[Resource::Photos, Resource::Track];
}

/// Upper bound of the search window (one year)
const MAX_WINDOW_SECONDS: u64 = 365 * 24 * 3600;

/// Match one photo against the track and update it in place
///
/// The camera clock runs at `utc_zone_minutes` from UTC. A nearest point
/// further away than `max_delta_seconds` leaves the photo untouched. Fails
/// when the zone offset moves the time out of the representable range.
pub fn geotag(
    photo: &mut GeoPhoto,
    track: &Track,
    setup: &GeolocateSetup,
) -> anyhow::Result<GeotagStatus> {
    if photo.is_geolocated() && !setup.overwrite {
        return Ok(GeotagStatus::KeptExisting);
    }

    let window = Duration::seconds(setup.max_delta_seconds.min(MAX_WINDOW_SECONDS) as i64);
    let local = Duration::try_minutes(setup.utc_zone_minutes)
        .and_then(|zone| photo.time.checked_sub_signed(zone))
        .with_context(|| {
            format!(
                "UTC zone of {} minutes is out of range for photo {}",
                setup.utc_zone_minutes, photo.name
            )
        })?;
    let utc = Utc.from_utc_datetime(&local);

    Ok(match track.closest(utc, window) {
        TrackMatch::OutOfRange => GeotagStatus::NoTrackCoverage,
        TrackMatch::Nearest(_, delta) if delta > window => GeotagStatus::TooFar,
        TrackMatch::Nearest(point, _) => {
            photo.lat = Some(point.lat);
            photo.lon = Some(point.lon);
            photo.ele = point.ele;
            photo.status += 1;
            GeotagStatus::Geotagged
        }
    })
}

impl Stage for Geolocate {
    const NAME: &'static str = "Geolocate";
    type Setup = GeolocateSetup;
    type Output = GeolocateSummary;

    fn setup(&mut self, ctx: &mut StageContext<'_>, _args: &CallArgs) -> anyhow::Result<GeolocateSetup> {
        let settings = ctx.settings();
        let setup = GeolocateSetup {
            utc_zone_minutes: settings.utc_zone_minutes,
            max_delta_seconds: settings.max_delta_seconds,
            overwrite: settings.overwrite,
        };
        if ctx.track()?.is_empty() {
            warn!("No track points loaded, photos cannot be geotagged");
        }
        ctx.emit(Phase::Ini, CallArgs::new().arg(payload(&setup)));
        Ok(setup)
    }

    fn execute(&mut self, ctx: &mut StageContext<'_>, setup: GeolocateSetup) -> anyhow::Result<GeolocateSummary> {
        let events = ctx.emitter();
        let (photos, track) = ctx.resources().photos_with_track()?;

        let mut summary = GeolocateSummary::default();
        for photo in photos.iter_mut() {
            events.emit(Phase::Run, CallArgs::new().arg(payload(&*photo)).arg(0));
            if photo.status < 1 {
                continue;
            }
            summary.total += 1;

            let status = geotag(photo, track, &setup)?;
            debug!(photo = %photo.name, status = i32::from(status), "Photo matched");
            summary.count(status);
            events.emit(Phase::Run, CallArgs::new().arg(payload(&*photo)).arg(i32::from(status)));
        }
        Ok(summary)
    }

    fn finalize(&mut self, ctx: &mut StageContext<'_>, output: &GeolocateSummary) -> anyhow::Result<Value> {
        ctx.emit(Phase::End, CallArgs::new().arg(output.geotagged).arg(output.total));
        info!(
            "{} of {} photos geotagged ({} kept, {} out of track, {} too far)",
            output.geotagged, output.total, output.kept, output.uncovered, output.too_far
        );
        Ok(payload(output))
    }
}
