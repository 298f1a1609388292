//! MakeKml stage: builds one placemark per geolocated photo

use photoplace_common::events::{CallArgs, Phase};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use super::StageLocks;
use crate::model::{GeoPhoto, Placemark};
use crate::stage::{payload, Stage, StageContext};
use crate::state::Resource;

/// Builds one KML placemark per geolocated photo
#[derive(Debug, Clone)]
pub struct MakeKml {
    name: String,
    photo_uri: String,
}

/// Bounding box of the geolocated photos
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KmlBounds {
    pub photos: usize,
    pub north: Option<f64>,
    pub south: Option<f64>,
    pub east: Option<f64>,
    pub west: Option<f64>,
}

impl KmlBounds {
    fn extend(&mut self, lat: f64, lon: f64) {
        self.photos += 1;
        self.north = Some(self.north.map_or(lat, |n| n.max(lat)));
        self.south = Some(self.south.map_or(lat, |s| s.min(lat)));
        self.east = Some(self.east.map_or(lon, |e| e.max(lon)));
        self.west = Some(self.west.map_or(lon, |w| w.min(lon)));
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KmlSummary {
    pub placemarks: usize,
}

impl MakeKml {
    pub fn new(name: impl Into<String>, photo_uri: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            photo_uri: photo_uri.into(),
        }
    }
}

impl StageLocks for MakeKml {
    const LOCKS: &'static [Resource] = &[Resource::Photos, Resource::Kml];
}

/// Link to a photo as written in the KML
///
/// A `%s` in `pattern` is replaced by the photo name; otherwise the name is
/// appended to it.
pub fn photo_link(pattern: &str, name: &str) -> String {
    if pattern.contains("%s") {
        pattern.replacen("%s", name, 1)
    } else {
        format!("{}{}", pattern, name)
    }
}

fn placeable(photo: &GeoPhoto) -> Option<(f64, f64)> {
    if photo.status < 1 {
        return None;
    }
    Some((photo.lat?, photo.lon?))
}

impl Stage for MakeKml {
    const NAME: &'static str = "MakeKml";
    type Setup = KmlBounds;
    type Output = KmlSummary;

    fn setup(&mut self, ctx: &mut StageContext<'_>, _args: &CallArgs) -> anyhow::Result<KmlBounds> {
        let mut bounds = KmlBounds::default();
        for (lat, lon) in ctx.photos()?.iter().filter_map(placeable) {
            bounds.extend(lat, lon);
        }
        ctx.emit(Phase::Ini, CallArgs::new().arg(payload(&bounds)));
        Ok(bounds)
    }

    fn execute(&mut self, ctx: &mut StageContext<'_>, _bounds: KmlBounds) -> anyhow::Result<KmlSummary> {
        let events = ctx.emitter();
        let (photos, kml) = ctx.resources().photos_with_kml()?;

        kml.name = self.name.clone();
        kml.placemarks.clear();
        for photo in photos.iter() {
            let Some((lat, lon)) = placeable(photo) else {
                continue;
            };
            let placemark = Placemark {
                name: photo.name.clone(),
                uri: photo_link(&self.photo_uri, &photo.name),
                time: photo.time,
                lat,
                lon,
                ele: photo.ele,
            };
            events.emit(Phase::Run, CallArgs::new().arg(payload(&placemark)));
            kml.placemarks.push(placemark);
        }

        Ok(KmlSummary {
            placemarks: kml.placemarks.len(),
        })
    }

    fn finalize(&mut self, ctx: &mut StageContext<'_>, output: &KmlSummary) -> anyhow::Result<Value> {
        ctx.emit(Phase::End, CallArgs::new().arg(output.placemarks));
        info!("KML document '{}' has {} placemarks", self.name, output.placemarks);
        Ok(payload(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_photo_link_substitutes_or_appends() {
        assert_eq!(photo_link("images/", "a.jpg"), "images/a.jpg");
        assert_eq!(
            photo_link("http://host/%s?size=big", "a.jpg"),
            "http://host/a.jpg?size=big"
        );
    }

    #[test]
    fn test_bounds_extend() {
        let mut bounds = KmlBounds::default();
        bounds.extend(40.0, -3.0);
        bounds.extend(41.5, -4.0);
        assert_eq!(bounds.photos, 2);
        assert_eq!(bounds.north, Some(41.5));
        assert_eq!(bounds.south, Some(40.0));
        assert_eq!(bounds.east, Some(-3.0));
        assert_eq!(bounds.west, Some(-4.0));
    }
}
