//! Photo and track readers used by the loading stages
//!
//! EXIF and GPX handling live outside the pipeline. The readers here are
//! deliberately small: file modification time stands in for the capture
//! time, and tracks come from `time,lat,lon[,ele]` CSV lines.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use regex::Regex;

use crate::model::{GeoPhoto, TrackPoint};

/// Lists and reads photos from some store
pub trait PhotoSource: Send + Sync {
    /// Photo files in `dir`, sorted by path
    fn list(&self, dir: &Path) -> anyhow::Result<Vec<PathBuf>>;

    /// Read one photo
    fn read(&self, path: &Path) -> anyhow::Result<GeoPhoto>;
}

/// Reads GPS fixes from a track file
pub trait TrackSource: Send + Sync {
    fn read(&self, path: &Path) -> anyhow::Result<Vec<TrackPoint>>;
}

/// Photos on the local filesystem, selected by a file-name pattern
#[derive(Debug, Clone)]
pub struct FsPhotoSource {
    pattern: Regex,
}

impl FsPhotoSource {
    pub fn new(pattern: &str) -> photoplace_common::Result<Self> {
        let pattern = Regex::new(pattern).map_err(|e| {
            photoplace_common::Error::InvalidInput(format!("Invalid photo pattern '{}': {}", pattern, e))
        })?;
        Ok(Self { pattern })
    }

    pub fn accepts(&self, file_name: &str) -> bool {
        self.pattern.is_match(file_name)
    }
}

impl PhotoSource for FsPhotoSource {
    fn list(&self, dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
        let entries = fs::read_dir(dir)
            .with_context(|| format!("cannot read '{}' directory", dir.display()))?;

        let mut photos = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if self.accepts(&entry.file_name().to_string_lossy()) {
                photos.push(entry.path());
            }
        }
        photos.sort();
        Ok(photos)
    }

    fn read(&self, path: &Path) -> anyhow::Result<GeoPhoto> {
        let modified = fs::metadata(path)
            .and_then(|m| m.modified())
            .with_context(|| format!("cannot read timestamp of '{}'", path.display()))?;
        let time = DateTime::<Utc>::from(modified).naive_utc();

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .with_context(|| format!("'{}' has no file name", path.display()))?;

        Ok(GeoPhoto::new(normalize_name(&file_name), path, time))
    }
}

/// Lowercase, with every whitespace run replaced by `_`
pub fn normalize_name(file_name: &str) -> String {
    let mut name = String::with_capacity(file_name.len());
    let mut in_space = false;
    for c in file_name.chars() {
        if c.is_whitespace() {
            if !in_space {
                name.push('_');
            }
            in_space = true;
        } else {
            name.extend(c.to_lowercase());
            in_space = false;
        }
    }
    name
}

/// Track points from CSV lines: `time,lat,lon[,ele]`
///
/// Time is RFC 3339. Blank lines, `#` comments and a leading `time,...`
/// header are skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct CsvTrackSource;

impl CsvTrackSource {
    pub fn parse(&self, content: &str) -> anyhow::Result<Vec<TrackPoint>> {
        let mut points = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with("time,") {
                continue;
            }
            let point = parse_point(line).with_context(|| format!("line {}", idx + 1))?;
            points.push(point);
        }
        Ok(points)
    }
}

impl TrackSource for CsvTrackSource {
    fn read(&self, path: &Path) -> anyhow::Result<Vec<TrackPoint>> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("cannot read track '{}'", path.display()))?;
        self.parse(&content)
            .with_context(|| format!("malformed track '{}'", path.display()))
    }
}

fn parse_point(line: &str) -> anyhow::Result<TrackPoint> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() < 3 || fields.len() > 4 {
        anyhow::bail!("expected 3 or 4 fields, got {}", fields.len());
    }

    let time = DateTime::parse_from_rfc3339(fields[0])
        .with_context(|| format!("invalid time '{}'", fields[0]))?
        .with_timezone(&Utc);
    let lat: f64 = fields[1].parse().with_context(|| format!("invalid latitude '{}'", fields[1]))?;
    let lon: f64 = fields[2].parse().with_context(|| format!("invalid longitude '{}'", fields[2]))?;
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        anyhow::bail!("coordinates out of range: {}, {}", lat, lon);
    }
    let ele = match fields.get(3) {
        Some(raw) if !raw.is_empty() => {
            Some(raw.parse().with_context(|| format!("invalid elevation '{}'", raw))?)
        }
        _ => None,
    };

    Ok(TrackPoint { time, lat, lon, ele })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("My  Holiday\tPic.JPG"), "my_holiday_pic.jpg");
    }

    #[test]
    fn test_list_filters_by_pattern() {
        let dir = TempDir::new().unwrap();
        for name in ["b.JPG", "a.jpeg", "notes.txt"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }
        fs::create_dir(dir.path().join("sub.jpg")).unwrap();

        let source = FsPhotoSource::new(r"(?i)\.jpe?g$").unwrap();
        let listed = source.list(dir.path()).unwrap();
        let names: Vec<_> = listed
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.jpeg", "b.JPG"]);
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        assert!(FsPhotoSource::new("(unclosed").is_err());
    }

    #[test]
    fn test_csv_track_parsing() {
        let points = CsvTrackSource
            .parse(
                "time,lat,lon,ele\n\
                 # comment\n\
                 2024-05-01T10:00:00Z,43.1,-8.2,12.5\n\
                 \n\
                 2024-05-01T10:01:00+00:00,43.2,-8.3\n",
            )
            .unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].ele, Some(12.5));
        assert_eq!(points[1].ele, None);
    }

    #[test]
    fn test_csv_reports_line_number() {
        let err = CsvTrackSource
            .parse("2024-05-01T10:00:00Z,43.1,-8.2\nbogus,1,2\n")
            .unwrap_err();
        assert!(format!("{:#}", err).contains("line 2"));
    }
}
