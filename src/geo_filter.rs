//! GPS distance gating.
//!
//! Consecutive fixes are compared on a spherical earth. Deltas that are zero,
//! negative or at least `max_jump_m` apart are treated as GPS noise and do not
//! count towards distance. The caller adopts the new fix as its reference
//! point on both outcomes.

use crate::types::PositionSample;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Deltas at or above this are considered a GPS jump
pub const DEFAULT_MAX_JUMP_M: f64 = 100.0;

/// Latitude/longitude pair used as the reference for the next delta
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl From<&PositionSample> for GeoPoint {
    fn from(sample: &PositionSample) -> Self {
        GeoPoint {
            latitude: sample.latitude,
            longitude: sample.longitude,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DistanceOutcome {
    /// First fix of the session; it only becomes the reference
    NoPriorFix,
    Accepted { delta_km: f64 },
    Rejected { delta_m: f64 },
}

impl DistanceOutcome {
    pub fn accepted_km(&self) -> f64 {
        match self {
            DistanceOutcome::Accepted { delta_km } => *delta_km,
            _ => 0.0,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct GeoDistanceFilter {
    max_jump_m: f64,
}

impl GeoDistanceFilter {
    pub fn new(max_jump_m: f64) -> Self {
        Self { max_jump_m }
    }

    pub fn max_jump_m(&self) -> f64 {
        self.max_jump_m
    }

    pub fn evaluate(&self, previous: Option<&GeoPoint>, next: &GeoPoint) -> DistanceOutcome {
        let Some(prev) = previous else {
            return DistanceOutcome::NoPriorFix;
        };

        let delta_m = haversine_distance(prev.latitude, prev.longitude, next.latitude, next.longitude);

        // Written so that NaN falls through to rejection
        if delta_m > 0.0 && delta_m < self.max_jump_m {
            DistanceOutcome::Accepted {
                delta_km: delta_m / 1000.0,
            }
        } else {
            DistanceOutcome::Rejected { delta_m }
        }
    }
}

impl Default for GeoDistanceFilter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_JUMP_M)
    }
}

/// Great-circle distance in meters
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).max(0.0).sqrt());
    EARTH_RADIUS_M * c
}

pub fn mps_to_kmh(speed_mps: f64) -> f64 {
    speed_mps * 3.6
}

/// Minutes per kilometer; `None` while standing still
pub fn pace_min_per_km(speed_kmh: f64) -> Option<f64> {
    if speed_kmh > 0.0 && speed_kmh.is_finite() {
        Some(60.0 / speed_kmh)
    } else {
        None
    }
}
