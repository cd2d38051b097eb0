//! Great-circle math on WGS84 degrees.
//!
//! Everything here is pure. Distances use the haversine formula on a sphere of
//! radius [`EARTH_RADIUS_M`], which is accurate to well under 1% for the
//! spacings the movement gate cares about.

use serde::{Deserialize, Serialize};

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Anything with a latitude/longitude pair in decimal degrees.
pub trait LatLon {
    fn latitude(&self) -> f64;
    fn longitude(&self) -> f64;
}

/// A bare coordinate, for callers that have no richer type at hand.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    #[must_use]
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

impl LatLon for Coordinate {
    fn latitude(&self) -> f64 {
        self.latitude
    }
    fn longitude(&self) -> f64 {
        self.longitude
    }
}

/// Haversine distance between `a` and `b` in meters.
///
/// Commutative, and exactly zero for identical coordinates. Inputs are
/// assumed to be valid degrees; see [`is_valid_coordinate`].
pub fn distance_meters<A: LatLon + ?Sized, B: LatLon + ?Sized>(a: &A, b: &B) -> f64 {
    let d_lat = (b.latitude() - a.latitude()).to_radians();
    let d_lon = (b.longitude() - a.longitude()).to_radians();

    let h = (d_lat / 2.0).sin().powi(2)
        + a.latitude().to_radians().cos()
            * b.latitude().to_radians().cos()
            * (d_lon / 2.0).sin().powi(2);

    2.0 * EARTH_RADIUS_M * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Path length along consecutive points, in meters.
pub fn path_length_meters<P: LatLon>(points: &[P]) -> f64 {
    points
        .windows(2)
        .map(|w| distance_meters(&w[0], &w[1]))
        .sum()
}

/// Finite latitude in [-90, 90] and finite longitude in [-180, 180].
pub fn is_valid_coordinate(latitude: f64, longitude: f64) -> bool {
    latitude.is_finite()
        && longitude.is_finite()
        && (-90.0..=90.0).contains(&latitude)
        && (-180.0..=180.0).contains(&longitude)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pt(lat: f64, lon: f64) -> Coordinate {
        Coordinate::new(lat, lon)
    }

    #[test]
    fn one_degree_of_longitude_at_equator() {
        let d = distance_meters(&pt(0.0, 0.0), &pt(0.0, 1.0));
        assert!(
            (d - 111_195.0).abs() < 111_195.0 * 0.01,
            "expected ~111195 m, got {d:.0}"
        );
    }

    #[test]
    fn identical_points_are_zero() {
        let p = pt(45.502, -73.567);
        assert!(distance_meters(&p, &p).abs() < f64::EPSILON);
    }

    #[test]
    fn distance_is_commutative() {
        let montreal = pt(45.5017, -73.5673);
        let quebec = pt(46.8139, -71.2080);
        let there = distance_meters(&montreal, &quebec);
        let back = distance_meters(&quebec, &montreal);
        assert!((there - back).abs() < 1e-6);
        // ~233 km
        assert!(there > 225_000.0 && there < 240_000.0, "got {there:.0}");
    }

    #[test]
    fn path_length_sums_segments() {
        let track = [pt(0.0, 0.0), pt(0.0, 1.0), pt(0.0, 2.0)];
        let len = path_length_meters(&track);
        assert!(len > 220_000.0 && len < 225_000.0, "got {len:.0}");
        assert!(path_length_meters::<Coordinate>(&[]).abs() < f64::EPSILON);
        assert!(path_length_meters(&[pt(1.0, 1.0)]).abs() < f64::EPSILON);
    }

    #[test]
    fn coordinate_validation() {
        assert!(is_valid_coordinate(0.0, 0.0));
        assert!(is_valid_coordinate(-90.0, 180.0));
        assert!(!is_valid_coordinate(90.1, 0.0));
        assert!(!is_valid_coordinate(0.0, -180.5));
        assert!(!is_valid_coordinate(f64::NAN, 0.0));
        assert!(!is_valid_coordinate(0.0, f64::INFINITY));
    }
}
