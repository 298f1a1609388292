//! Domain State: shared photos/track/KML data behind named resource locks
//!
//! A stage declares the resources it needs; the runner acquires them while
//! holding the coarse state lock, so two runs never interleave their
//! acquisitions. Resource locks then stay held for the whole run.
//!
//! Every [`ResourceLock`] counts acquisitions and releases. A guard dropped
//! during a panic still counts as released, and a poisoned lock is
//! recovered on the next acquisition.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};

use photoplace_common::config::MainConfig;
use serde_json::{json, Value};
use tracing::debug;

use crate::model::{GeoPhoto, KmlDocument, Track};

/// Named mutex with acquire/release accounting
pub struct ResourceLock<T> {
    name: &'static str,
    data: Mutex<T>,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl<T> ResourceLock<T> {
    pub fn new(name: &'static str, value: T) -> Self {
        Self {
            name,
            data: Mutex::new(value),
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Total number of acquisitions so far
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    /// Total number of releases so far
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// True while a guard is alive
    pub fn is_held(&self) -> bool {
        self.acquired() != self.released()
    }

    /// Block until the lock is free, then take it
    pub fn lock(&self) -> ResourceGuard<'_, T> {
        let guard = self.data.lock().unwrap_or_else(|poisoned| {
            debug!(lock = self.name, "Recovering poisoned resource lock");
            PoisonError::into_inner(poisoned)
        });
        self.acquired.fetch_add(1, Ordering::SeqCst);
        debug!(lock = self.name, "Resource lock acquired");
        ResourceGuard { lock: self, guard }
    }
}

impl<T> fmt::Debug for ResourceLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceLock")
            .field("name", &self.name)
            .field("acquired", &self.acquired())
            .field("released", &self.released())
            .finish()
    }
}

/// Access to locked data; counts a release when dropped
pub struct ResourceGuard<'a, T> {
    lock: &'a ResourceLock<T>,
    guard: MutexGuard<'a, T>,
}

impl<T> Deref for ResourceGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for ResourceGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for ResourceGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.released.fetch_add(1, Ordering::SeqCst);
        debug!(lock = self.lock.name, "Resource lock released");
    }
}

/// Lockable pieces of the Domain State
///
/// Declaration order is the canonical global acquisition order. Stages
/// sharing resources must list them in this order to stay deadlock-free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Resource {
    Photos,
    Track,
    Kml,
}

impl Resource {
    /// Every resource, in canonical order
    pub const CANONICAL: [Resource; 3] = [Resource::Photos, Resource::Track, Resource::Kml];

    pub fn name(&self) -> &'static str {
        match self {
            Resource::Photos => "photos",
            Resource::Track => "track",
            Resource::Kml => "kml",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Shared data and locks every stage operates on
pub struct DomainState {
    state_lock: Mutex<()>,
    photos: ResourceLock<Vec<GeoPhoto>>,
    track: ResourceLock<Track>,
    kml: ResourceLock<KmlDocument>,
    settings: RwLock<MainConfig>,
}

impl DomainState {
    pub fn new(settings: MainConfig) -> Self {
        Self {
            state_lock: Mutex::new(()),
            photos: ResourceLock::new("photos", Vec::new()),
            track: ResourceLock::new("track", Track::default()),
            kml: ResourceLock::new("kml", KmlDocument::default()),
            settings: RwLock::new(settings),
        }
    }

    pub fn photos(&self) -> &ResourceLock<Vec<GeoPhoto>> {
        &self.photos
    }

    pub fn track(&self) -> &ResourceLock<Track> {
        &self.track
    }

    pub fn kml(&self) -> &ResourceLock<KmlDocument> {
        &self.kml
    }

    /// Copy of the current processing settings
    pub fn settings(&self) -> MainConfig {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Change processing settings in place
    pub fn update_settings(&self, update: impl FnOnce(&mut MainConfig)) {
        let mut settings = self.settings.write().unwrap_or_else(PoisonError::into_inner);
        update(&mut settings);
    }

    /// (acquired, released) counters of one resource
    pub fn lock_counts(&self, resource: Resource) -> (usize, usize) {
        match resource {
            Resource::Photos => (self.photos.acquired(), self.photos.released()),
            Resource::Track => (self.track.acquired(), self.track.released()),
            Resource::Kml => (self.kml.acquired(), self.kml.released()),
        }
    }

    /// Take the state lock, then each resource in the given order
    ///
    /// The state lock is released before returning; only the resource
    /// locks stay held, inside the returned value.
    pub fn acquire(&self, resources: &[Resource]) -> HeldResources<'_> {
        let _serial = self.state_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut held = HeldResources::default();
        for resource in resources {
            match resource {
                Resource::Photos => held.photos = Some(self.photos.lock()),
                Resource::Track => held.track = Some(self.track.lock()),
                Resource::Kml => held.kml = Some(self.kml.lock()),
            }
            held.order.push(*resource);
        }
        held
    }

    /// Reset photos, track and KML under every lock
    pub fn clear(&self) {
        let mut held = self.acquire(&Resource::CANONICAL);
        if let Some(photos) = held.photos.as_deref_mut() {
            photos.clear();
        }
        if let Some(track) = held.track.as_deref_mut() {
            *track = Track::default();
        }
        if let Some(kml) = held.kml.as_deref_mut() {
            *kml = KmlDocument::default();
        }
        debug!("Domain state cleared");
    }
}

impl fmt::Debug for DomainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainState")
            .field("photos", &self.photos)
            .field("track", &self.track)
            .field("kml", &self.kml)
            .finish()
    }
}

/// Resource guards held by one stage run
#[derive(Default)]
pub struct HeldResources<'a> {
    photos: Option<ResourceGuard<'a, Vec<GeoPhoto>>>,
    track: Option<ResourceGuard<'a, Track>>,
    kml: Option<ResourceGuard<'a, KmlDocument>>,
    order: Vec<Resource>,
}

impl HeldResources<'_> {
    /// Resources in acquisition order
    pub fn order(&self) -> &[Resource] {
        &self.order
    }

    pub fn holds(&self, resource: Resource) -> bool {
        self.order.contains(&resource)
    }

    pub fn photos(&mut self) -> anyhow::Result<&mut Vec<GeoPhoto>> {
        self.photos.as_deref_mut().ok_or_else(|| undeclared(Resource::Photos))
    }

    pub fn track(&mut self) -> anyhow::Result<&mut Track> {
        self.track.as_deref_mut().ok_or_else(|| undeclared(Resource::Track))
    }

    pub fn kml(&mut self) -> anyhow::Result<&mut KmlDocument> {
        self.kml.as_deref_mut().ok_or_else(|| undeclared(Resource::Kml))
    }

    /// Photos and track together, for stages reading one while editing the other
    pub fn photos_with_track(&mut self) -> anyhow::Result<(&mut Vec<GeoPhoto>, &Track)> {
        let photos = self.photos.as_deref_mut().ok_or_else(|| undeclared(Resource::Photos))?;
        let track = self.track.as_deref().ok_or_else(|| undeclared(Resource::Track))?;
        Ok((photos, track))
    }

    /// Photos and KML document together
    pub fn photos_with_kml(&mut self) -> anyhow::Result<(&mut Vec<GeoPhoto>, &mut KmlDocument)> {
        let photos = self.photos.as_deref_mut().ok_or_else(|| undeclared(Resource::Photos))?;
        let kml = self.kml.as_deref_mut().ok_or_else(|| undeclared(Resource::Kml))?;
        Ok((photos, kml))
    }

    /// Summary of the held data, used as the `start` event payload
    pub fn snapshot(&self) -> Value {
        let mut snapshot = serde_json::Map::new();
        if let Some(photos) = self.photos.as_deref() {
            let geotagged = photos.iter().filter(|p| p.is_geolocated()).count();
            snapshot.insert(
                "photos".to_string(),
                json!({ "total": photos.len(), "geotagged": geotagged }),
            );
        }
        if let Some(track) = self.track.as_deref() {
            snapshot.insert("track".to_string(), json!({ "points": track.points.len() }));
        }
        if let Some(kml) = self.kml.as_deref() {
            snapshot.insert("kml".to_string(), json!({ "placemarks": kml.placemarks.len() }));
        }
        Value::Object(snapshot)
    }
}

fn undeclared(resource: Resource) -> anyhow::Error {
    anyhow::anyhow!("resource '{}' was not declared by this stage", resource)
}
