//! Concrete pipeline stages
//!
//! | Stage        | Locks         |
//! |--------------|---------------|
//! | `LoadPhotos` | photos        |
//! | `ReadTrack`  | track         |
//! | `Geolocate`  | photos, track |
//! | `MakeKml`    | photos, kml   |
//! | `SaveFiles`  | photos, kml   |
//!
//! Lock lists follow the canonical resource order.

mod geolocate;
mod load_photos;
mod make_kml;
mod read_track;
mod save_files;

pub use geolocate::{geotag, Geolocate, GeolocateSetup, GeolocateSummary};
pub use load_photos::{LoadPhotos, LoadSummary};
pub use make_kml::{photo_link, KmlBounds, KmlSummary, MakeKml};
pub use read_track::{ReadTrack, TrackSummary};
pub use save_files::{SaveFiles, SaveSetup, SaveSummary};

use crate::state::Resource;

/// Resources a stage type must be run with
pub trait StageLocks {
    const LOCKS: &'static [Resource];
}
