//! Geographic utilities: great-circle distances, unit conversion and a local
//! planar frame for segment geometry.

use geo::Coord;

use crate::GpsPoint;

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

pub const FEET_PER_METER: f64 = 3.280839895;
pub const FEET_PER_MILE: f64 = 5280.0;

pub fn meters_to_feet(meters: f64) -> f64 {
    meters * FEET_PER_METER
}

pub fn feet_to_miles(feet: f64) -> f64 {
    feet / FEET_PER_MILE
}

pub fn miles_to_feet(miles: f64) -> f64 {
    miles * FEET_PER_MILE
}

/// Great-circle distance between two points in meters.
pub fn haversine_distance(p1: &GpsPoint, p2: &GpsPoint) -> f64 {
    let lat1 = p1.latitude.to_radians();
    let lat2 = p2.latitude.to_radians();
    let dlat = lat2 - lat1;
    let dlng = (p2.longitude - p1.longitude).to_radians();

    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

/// Great-circle distance between two points in feet.
pub fn haversine_distance_ft(p1: &GpsPoint, p2: &GpsPoint) -> f64 {
    meters_to_feet(haversine_distance(p1, p2))
}

/// Linear interpolation between two positions (`t` in [0, 1]).
pub fn interpolate(p1: &GpsPoint, p2: &GpsPoint, t: f64) -> GpsPoint {
    GpsPoint::new(
        p1.latitude + t * (p2.latitude - p1.latitude),
        p1.longitude + t * (p2.longitude - p1.longitude),
    )
}

/// Google Maps search URL for a position.
pub fn gmaps_url(point: &GpsPoint) -> String {
    format!(
        "https://www.google.com/maps/search/?api=1&query={},{}",
        point.latitude, point.longitude
    )
}

/// Equirectangular projection centred on a reference latitude, in feet.
///
/// Accurate to well under a foot over the few hundred feet that separate a
/// ping from its candidate route segments.
#[derive(Debug, Clone, Copy)]
pub struct LocalFrame {
    ref_lat: f64,
    ref_lng: f64,
    cos_lat: f64,
}

impl LocalFrame {
    pub fn new(origin: &GpsPoint) -> Self {
        Self {
            ref_lat: origin.latitude,
            ref_lng: origin.longitude,
            cos_lat: origin.latitude.to_radians().cos(),
        }
    }

    pub fn project(&self, point: &GpsPoint) -> Coord<f64> {
        let radius_ft = meters_to_feet(EARTH_RADIUS_M);
        Coord {
            x: (point.longitude - self.ref_lng).to_radians() * self.cos_lat * radius_ft,
            y: (point.latitude - self.ref_lat).to_radians() * radius_ft,
        }
    }
}
