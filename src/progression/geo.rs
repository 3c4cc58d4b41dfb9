//! Great-circle distance and containment checks in decimal degrees.

use log::warn;
use serde::{Deserialize, Serialize};

/// Mean Earth radius used by the haversine formula.
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinates {
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

/// Haversine distance between `a` and `b` in meters. Never negative for finite input.
pub fn distance_meters(a: Coordinates, b: Coordinates) -> f64 {
    let phi1 = a.lat.to_radians();
    let phi2 = b.lat.to_radians();
    let d_phi = (b.lat - a.lat).to_radians();
    let d_lambda = (b.lng - a.lng).to_radians();

    let h = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    // Rounding can push h a hair outside [0, 1] for antipodal points.
    let h = h.clamp(0.0, 1.0);
    2.0 * EARTH_RADIUS_METERS * h.sqrt().atan2((1.0 - h).sqrt())
}

pub fn is_within_radius(point: Coordinates, center: Coordinates, radius_meters: f64) -> bool {
    distance_meters(point, center) <= radius_meters
}

/// Axis-aligned lat/lng box used to filter visible points.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BoundingBox {
    pub south: f64,
    pub west: f64,
    pub north: f64,
    pub east: f64,
}

impl BoundingBox {
    /// Box of roughly `radius_meters` around `center`.
    pub fn around(center: Coordinates, radius_meters: f64) -> Self {
        let d_lat = (radius_meters / EARTH_RADIUS_METERS).to_degrees();
        let cos_lat = center.lat.to_radians().cos().abs().max(1e-6);
        let d_lng = (radius_meters / (EARTH_RADIUS_METERS * cos_lat)).to_degrees();
        Self {
            south: center.lat - d_lat,
            west: center.lng - d_lng,
            north: center.lat + d_lat,
            east: center.lng + d_lng,
        }
    }

    pub fn contains(&self, point: Coordinates) -> bool {
        let lat_ok = point.lat >= self.south && point.lat <= self.north;
        // A box crossing the antimeridian has west > east.
        let lng_ok = if self.west <= self.east {
            point.lng >= self.west && point.lng <= self.east
        } else {
            point.lng >= self.west || point.lng <= self.east
        };
        lat_ok && lng_ok
    }
}

/// Use the device fix when there is one, otherwise degrade to `fallback`.
///
/// Returns the position and whether the fallback was used.
pub fn position_or_fallback(
    fix: Result<Coordinates, String>,
    fallback: Coordinates,
) -> (Coordinates, bool) {
    match fix {
        Ok(coords) if coords.is_valid() => (coords, false),
        Ok(coords) => {
            warn!(
                "Discarding invalid position fix ({}, {}); using fallback",
                coords.lat, coords.lng
            );
            (fallback, true)
        }
        Err(reason) => {
            warn!("Geolocation unavailable ({}); using fallback position", reason);
            (fallback, true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATHEDRAL: Coordinates = Coordinates::new(47.9955, 7.8522);
    const SCHWABENTOR: Coordinates = Coordinates::new(47.9929, 7.8546);

    #[test]
    fn distance_to_self_is_zero() {
        assert_eq!(distance_meters(CATHEDRAL, CATHEDRAL), 0.0);
    }

    #[test]
    fn distance_is_symmetric() {
        let ab = distance_meters(CATHEDRAL, SCHWABENTOR);
        let ba = distance_meters(SCHWABENTOR, CATHEDRAL);
        assert!((ab - ba).abs() < 1e-9);
    }

    #[test]
    fn city_scale_distance_is_accurate() {
        // Roughly 340m between the Freiburg Minster and the Schwabentor.
        let d = distance_meters(CATHEDRAL, SCHWABENTOR);
        assert!(d > 300.0 && d < 380.0, "distance was {}", d);
    }

    #[test]
    fn one_degree_of_latitude() {
        let d = distance_meters(Coordinates::new(0.0, 0.0), Coordinates::new(1.0, 0.0));
        let expected = EARTH_RADIUS_METERS * std::f64::consts::PI / 180.0;
        assert!((d - expected).abs() / expected < 0.005);
    }

    #[test]
    fn antipodal_points_do_not_produce_nan() {
        let d = distance_meters(Coordinates::new(0.0, 0.0), Coordinates::new(0.0, 180.0));
        assert!(d.is_finite());
        assert!((d - EARTH_RADIUS_METERS * std::f64::consts::PI).abs() < 1.0);
    }

    #[test]
    fn radius_boundary_is_inclusive() {
        let d = distance_meters(CATHEDRAL, SCHWABENTOR);
        assert!(is_within_radius(SCHWABENTOR, CATHEDRAL, d));
        assert!(!is_within_radius(SCHWABENTOR, CATHEDRAL, d - 1.0));
    }

    #[test]
    fn bounding_box_around_contains_center_and_neighbors() {
        let bbox = BoundingBox::around(CATHEDRAL, 500.0);
        assert!(bbox.contains(CATHEDRAL));
        assert!(bbox.contains(SCHWABENTOR));
        assert!(!bbox.contains(Coordinates::new(48.1, 7.85)));
    }

    #[test]
    fn bounding_box_across_antimeridian() {
        let bbox = BoundingBox {
            south: -10.0,
            west: 170.0,
            north: 10.0,
            east: -170.0,
        };
        assert!(bbox.contains(Coordinates::new(0.0, 179.5)));
        assert!(bbox.contains(Coordinates::new(0.0, -179.5)));
        assert!(!bbox.contains(Coordinates::new(0.0, 0.0)));
    }

    #[test]
    fn fallback_used_when_fix_missing_or_invalid() {
        let fallback = Coordinates::new(47.99, 7.84);
        let (pos, used) = position_or_fallback(Err("permission denied".into()), fallback);
        assert!(used);
        assert_eq!(pos, fallback);

        let (pos, used) = position_or_fallback(Ok(Coordinates::new(f64::NAN, 0.0)), fallback);
        assert!(used);
        assert_eq!(pos, fallback);

        let (pos, used) = position_or_fallback(Ok(CATHEDRAL), fallback);
        assert!(!used);
        assert_eq!(pos, CATHEDRAL);
    }
}
