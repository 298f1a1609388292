//! Data guarded by the Domain State: photos, the GPS track, the KML document

use std::fmt::Write as _;
use std::path::PathBuf;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of geotagging one photo
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(into = "i32")]
pub enum GeotagStatus {
    /// Examined, position assigned
    Geotagged = 1,
    /// Already had coordinates and overwrite is off
    KeptExisting = -1,
    /// No track point within the delta window at all
    NoTrackCoverage = -2,
    /// Track covers the time but the nearest point is too far
    TooFar = -3,
}

impl From<GeotagStatus> for i32 {
    fn from(status: GeotagStatus) -> Self {
        status as i32
    }
}

/// A photo known to the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoPhoto {
    /// Normalised file name (lowercase, whitespace → `_`)
    pub name: String,
    pub path: PathBuf,
    /// Capture time on the camera clock
    pub time: NaiveDateTime,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub ele: Option<f64>,
    /// Processing status: below 1 means excluded from further stages
    pub status: i32,
}

impl GeoPhoto {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, time: NaiveDateTime) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            time,
            lat: None,
            lon: None,
            ele: None,
            status: 0,
        }
    }

    pub fn is_geolocated(&self) -> bool {
        self.lat.is_some() && self.lon.is_some()
    }
}

/// One GPS fix
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackPoint {
    pub time: DateTime<Utc>,
    pub lat: f64,
    pub lon: f64,
    pub ele: Option<f64>,
}

/// A GPS track, points sorted by time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub source: Option<PathBuf>,
    pub points: Vec<TrackPoint>,
}

/// Where a timestamp falls relative to a track
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrackMatch {
    /// Nearest point and its distance in time
    Nearest(TrackPoint, Duration),
    /// Timestamp lies outside the track extended by the search window
    OutOfRange,
}

impl Track {
    pub fn new(source: Option<PathBuf>, mut points: Vec<TrackPoint>) -> Self {
        points.sort_by_key(|p| p.time);
        Self { source, points }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// First and last fix times
    pub fn time_range(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        Some((self.points.first()?.time, self.points.last()?.time))
    }

    /// Nearest point to `time`, searching at most `window` outside the track
    pub fn closest(&self, time: DateTime<Utc>, window: Duration) -> TrackMatch {
        let Some((first, last)) = self.time_range() else {
            return TrackMatch::OutOfRange;
        };
        let before_start = first.checked_sub_signed(window).map_or(false, |lo| time < lo);
        let after_end = last.checked_add_signed(window).map_or(false, |hi| time > hi);
        if before_start || after_end {
            return TrackMatch::OutOfRange;
        }

        let idx = self.points.partition_point(|p| p.time < time);
        let before = idx.checked_sub(1).and_then(|i| self.points.get(i));
        let after = self.points.get(idx);
        let nearest = match (before, after) {
            (Some(b), Some(a)) => {
                if time - b.time <= a.time - time {
                    b
                } else {
                    a
                }
            }
            (Some(b), None) => b,
            (None, Some(a)) => a,
            (None, None) => return TrackMatch::OutOfRange,
        };
        let delta = if nearest.time >= time {
            nearest.time - time
        } else {
            time - nearest.time
        };
        TrackMatch::Nearest(*nearest, delta)
    }
}

/// One KML placemark
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placemark {
    pub name: String,
    pub uri: String,
    pub time: NaiveDateTime,
    pub lat: f64,
    pub lon: f64,
    pub ele: Option<f64>,
}

/// KML document under construction
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KmlDocument {
    pub name: String,
    pub placemarks: Vec<Placemark>,
}

impl KmlDocument {
    /// Minimal KML 2.2 serialisation: one point placemark per photo
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        out.push_str("<kml xmlns=\"http://www.opengis.net/kml/2.2\">\n");
        out.push_str("   <Document>\n");
        let _ = writeln!(out, "      <name>{}</name>", escape(&self.name));
        for mark in &self.placemarks {
            out.push_str("      <Placemark>\n");
            let _ = writeln!(out, "         <name>{}</name>", escape(&mark.name));
            let _ = writeln!(
                out,
                "         <description><![CDATA[<img src=\"{}\"/>]]></description>",
                mark.uri
            );
            let _ = writeln!(
                out,
                "         <TimeStamp><when>{}</when></TimeStamp>",
                mark.time.format("%Y-%m-%dT%H:%M:%S")
            );
            let _ = writeln!(
                out,
                "         <Point><coordinates>{:.8},{:.8},{:.3}</coordinates></Point>",
                mark.lon,
                mark.lat,
                mark.ele.unwrap_or(0.0)
            );
            out.push_str("      </Placemark>\n");
        }
        out.push_str("   </Document>\n");
        out.push_str("</kml>\n");
        out
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn point(secs: i64) -> TrackPoint {
        TrackPoint {
            time: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            lat: secs as f64,
            lon: 0.0,
            ele: None,
        }
    }

    #[test]
    fn test_closest_picks_nearest_neighbour() {
        let track = Track::new(None, vec![point(100), point(0), point(60)]);
        let at = Utc.timestamp_opt(1_700_000_000 + 50, 0).unwrap();
        match track.closest(at, Duration::seconds(30)) {
            TrackMatch::Nearest(p, delta) => {
                assert_eq!(p.lat, 60.0);
                assert_eq!(delta, Duration::seconds(10));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_closest_outside_window() {
        let track = Track::new(None, vec![point(0), point(10)]);
        let late = Utc.timestamp_opt(1_700_000_000 + 100, 0).unwrap();
        assert_eq!(track.closest(late, Duration::seconds(30)), TrackMatch::OutOfRange);
        assert_eq!(Track::default().closest(late, Duration::seconds(30)), TrackMatch::OutOfRange);
    }

    #[test]
    fn test_status_serializes_as_code() {
        assert_eq!(serde_json::to_value(GeotagStatus::TooFar).unwrap(), serde_json::json!(-3));
    }

    #[test]
    fn test_render_escapes_names() {
        let doc = KmlDocument {
            name: "a & b".to_string(),
            placemarks: Vec::new(),
        };
        assert!(doc.render().contains("<name>a &amp; b</name>"));
    }
}
