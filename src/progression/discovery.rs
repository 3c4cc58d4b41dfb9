//! Resolving scans and location fixes to map points, and the per-actor discovery ledger.

use std::collections::BTreeMap;

use log::{debug, info};

use crate::progression::clock::Timestamp;
use crate::progression::errors::ProgressionError;
use crate::progression::geo::{distance_meters, Coordinates};
use crate::progression::types::{MapPoint, PointDiscovery};
use crate::validation::{validate_coordinates, validate_identifier, IdentifierKind};

/// Currently loaded map points, keyed by their stable key.
#[derive(Debug, Clone, Default)]
pub struct PointCatalog {
    points: BTreeMap<String, MapPoint>,
    default_radius_meters: f64,
}

impl PointCatalog {
    pub fn new(default_radius_meters: f64) -> Self {
        Self {
            points: BTreeMap::new(),
            default_radius_meters,
        }
    }

    pub fn with_points(mut self, points: impl IntoIterator<Item = MapPoint>) -> Self {
        self.replace_all(points);
        self
    }

    /// Swap in a fresh set of points (e.g. after a visible-points query).
    pub fn replace_all(&mut self, points: impl IntoIterator<Item = MapPoint>) {
        self.points = points.into_iter().map(|p| (p.key.clone(), p)).collect();
    }

    pub fn upsert(&mut self, point: MapPoint) {
        self.points.insert(point.key.clone(), point);
    }

    pub fn get(&self, key: &str) -> Option<&MapPoint> {
        self.points.get(key)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MapPoint> {
        self.points.values()
    }

    pub fn radius_of(&self, point: &MapPoint) -> f64 {
        point.radius_meters.unwrap_or(self.default_radius_meters)
    }

    /// Exact key match among visible points.
    pub fn resolve_scan(&self, key: &str) -> Result<&MapPoint, ProgressionError> {
        self.points
            .get(key)
            .filter(|p| p.is_visible)
            .ok_or_else(|| ProgressionError::NotFound(format!("point: {}", key)))
    }

    /// Nearest visible point unlocked at `phase` whose own radius contains `position`.
    ///
    /// Locked points never shadow an unlocked one; `PhaseLocked` comes back only when
    /// every containing point is locked. When nothing contains the fix, the error names
    /// the closest visible point so the caller can tell the player how far off they are.
    pub fn resolve_location(&self, position: Coordinates, phase: u32) -> Result<&MapPoint, ProgressionError> {
        let mut nearest_unlocked: Option<(&MapPoint, f64)> = None;
        let mut nearest_locked: Option<(&MapPoint, f64)> = None;
        let mut nearest_any: Option<(&MapPoint, f64)> = None;

        for point in self.points.values().filter(|p| p.is_visible) {
            let distance = distance_meters(position, point.coordinates);
            if nearest_any.map_or(true, |(_, d)| distance < d) {
                nearest_any = Some((point, distance));
            }
            if distance > self.radius_of(point) {
                continue;
            }
            let slot = if point.unlocked_for(phase) {
                &mut nearest_unlocked
            } else {
                &mut nearest_locked
            };
            if slot.map_or(true, |(_, d)| distance < d) {
                *slot = Some((point, distance));
            }
        }

        if let Some((point, distance)) = nearest_unlocked {
            debug!("Location fix matched {} at {:.1}m", point.key, distance);
            return Ok(point);
        }
        if let Some((point, _)) = nearest_locked {
            check_phase(point, phase)?;
        }
        match nearest_any {
            Some((point, distance)) => Err(ProgressionError::OutOfRange {
                point_key: point.key.clone(),
                distance_m: distance,
                radius_m: self.radius_of(point),
            }),
            None => Err(ProgressionError::NotFound("no visible points loaded".to_string())),
        }
    }
}

/// Parse a JSON array of map points, rejecting malformed keys and coordinates.
pub fn parse_point_seed(json: &str) -> Result<Vec<MapPoint>, ProgressionError> {
    let points: Vec<MapPoint> = serde_json::from_str(json)?;
    for point in &points {
        validate_identifier(IdentifierKind::Point, &point.key)?;
        validate_coordinates(point.coordinates.lat, point.coordinates.lng)?;
        if let Some(radius) = point.radius_meters {
            if !radius.is_finite() || radius <= 0.0 {
                return Err(ProgressionError::Internal(format!(
                    "point {} has non-positive radius {}",
                    point.key, radius
                )));
            }
        }
    }
    Ok(points)
}

/// Reject `point` if the player's phase is below its requirement.
pub fn check_phase(point: &MapPoint, phase: u32) -> Result<(), ProgressionError> {
    match point.phase_requirement {
        Some(required) if required > phase => Err(ProgressionError::PhaseLocked {
            point_key: point.key.clone(),
            required,
            current: phase,
        }),
        _ => Ok(()),
    }
}

/// Discoveries keyed by (actor, point key).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryLedger {
    entries: BTreeMap<(String, String), PointDiscovery>,
}

impl DiscoveryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = PointDiscovery>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|d| ((d.actor.clone(), d.point_key.clone()), d))
                .collect(),
        }
    }

    pub fn get(&self, actor: &str, point_key: &str) -> Option<&PointDiscovery> {
        self.entries.get(&(actor.to_string(), point_key.to_string()))
    }

    pub fn is_discovered(&self, actor: &str, point_key: &str) -> bool {
        self.get(actor, point_key).is_some()
    }

    /// Record a discovery. Returns false (and changes nothing) if it already exists.
    pub fn record(&mut self, actor: &str, point_key: &str, at: Timestamp) -> bool {
        let key = (actor.to_string(), point_key.to_string());
        if self.entries.contains_key(&key) {
            return false;
        }
        info!("{} discovered {}", actor, point_key);
        self.entries.insert(key, PointDiscovery::new(actor, point_key, at));
        true
    }

    /// Stamp the research time on an existing discovery. Returns false if already researched.
    pub fn mark_researched(
        &mut self,
        actor: &str,
        point_key: &str,
        at: Timestamp,
    ) -> Result<bool, ProgressionError> {
        let entry = self
            .entries
            .get_mut(&(actor.to_string(), point_key.to_string()))
            .ok_or_else(|| {
                ProgressionError::NotFound(format!("discovery: {} by {}", point_key, actor))
            })?;
        if entry.researched_at.is_some() {
            return Ok(false);
        }
        entry.researched_at = Some(at.max(entry.discovered_at));
        Ok(true)
    }

    pub fn for_actor<'a>(&'a self, actor: &'a str) -> impl Iterator<Item = &'a PointDiscovery> + 'a {
        self.entries.values().filter(move |d| d.actor == actor)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PointDiscovery> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn put(&mut self, actor: &str, point_key: &str, entry: Option<PointDiscovery>) {
        let key = (actor.to_string(), point_key.to_string());
        match entry {
            Some(entry) => {
                self.entries.insert(key, entry);
            }
            None => {
                self.entries.remove(&key);
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
