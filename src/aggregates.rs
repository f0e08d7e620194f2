use serde::{Deserialize, Serialize};

use crate::geo_filter::{mps_to_kmh, pace_min_per_km, DistanceOutcome, GeoDistanceFilter, GeoPoint};
use crate::step_normalizer::StepBaseline;
use crate::types::{FinalTotals, PositionSample};

/// Immutable copy of the running totals, handed to observers
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    pub elapsed_seconds: u64,
    pub steps: u64,
    pub distance_km: f64,
    pub speed_kmh: f64,
    pub pace_min_per_km: Option<f64>,
    pub average_speed_kmh: f64,
}

impl Default for AggregateSnapshot {
    fn default() -> Self {
        Self {
            elapsed_seconds: 0,
            steps: 0,
            distance_km: 0.0,
            speed_kmh: 0.0,
            pace_min_per_km: None,
            average_speed_kmh: 0.0,
        }
    }
}

/// Running totals for the active session.
///
/// Distance and elapsed time only grow. Steps only grow apart from the
/// clamp-to-zero case when the device counter drops below the baseline.
#[derive(Clone, Debug)]
pub struct SessionAggregates {
    filter: GeoDistanceFilter,
    elapsed_seconds: u64,
    steps: u64,
    distance_km: f64,
    speed_kmh: f64,
    last_fix: Option<GeoPoint>,
    step_baseline: StepBaseline,
}

impl SessionAggregates {
    pub fn new(filter: GeoDistanceFilter) -> Self {
        Self {
            filter,
            elapsed_seconds: 0,
            steps: 0,
            distance_km: 0.0,
            speed_kmh: 0.0,
            last_fix: None,
            step_baseline: StepBaseline::unset(),
        }
    }

    /// Back to zero/unset, keeping the distance filter settings
    pub fn reset(&mut self) {
        *self = Self::new(self.filter);
    }

    /// Feed one fix. The fix becomes the new reference and sets the current
    /// speed whether or not its distance delta is accepted.
    pub fn apply_position_fix(&mut self, sample: &PositionSample) -> DistanceOutcome {
        let point = GeoPoint::from(sample);
        let outcome = self.filter.evaluate(self.last_fix.as_ref(), &point);

        self.distance_km += outcome.accepted_km();
        self.last_fix = Some(point);
        // Providers report a negative speed when none is available; NaN is treated the same
        self.speed_kmh = if sample.speed_mps.is_nan() || sample.speed_mps < 0.0 {
            0.0
        } else {
            mps_to_kmh(sample.speed_mps)
        };

        outcome
    }

    /// Feed one raw cumulative counter value, returns the session step count
    pub fn apply_step_reading(&mut self, raw_count: u64) -> u64 {
        self.steps = self.step_baseline.normalize(raw_count);
        self.steps
    }

    pub fn tick(&mut self) -> u64 {
        self.elapsed_seconds += 1;
        self.elapsed_seconds
    }

    pub fn snapshot(&self) -> AggregateSnapshot {
        AggregateSnapshot {
            elapsed_seconds: self.elapsed_seconds,
            steps: self.steps,
            distance_km: self.distance_km,
            speed_kmh: self.speed_kmh,
            pace_min_per_km: pace_min_per_km(self.speed_kmh),
            average_speed_kmh: average_speed_kmh(self.distance_km, self.elapsed_seconds),
        }
    }

    pub fn finalize(&self) -> FinalTotals {
        FinalTotals {
            steps: self.steps,
            distance_km: self.distance_km,
            duration_seconds: self.elapsed_seconds,
            average_speed_kmh: average_speed_kmh(self.distance_km, self.elapsed_seconds),
        }
    }

    pub fn elapsed_seconds(&self) -> u64 {
        self.elapsed_seconds
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn distance_km(&self) -> f64 {
        self.distance_km
    }

    pub fn speed_kmh(&self) -> f64 {
        self.speed_kmh
    }

    pub fn last_fix(&self) -> Option<GeoPoint> {
        self.last_fix
    }

    pub fn step_baseline(&self) -> StepBaseline {
        self.step_baseline
    }
}

impl Default for SessionAggregates {
    fn default() -> Self {
        Self::new(GeoDistanceFilter::default())
    }
}

/// km/h over the whole session. Zero when either duration or distance is zero.
pub fn average_speed_kmh(distance_km: f64, duration_seconds: u64) -> f64 {
    if duration_seconds == 0 || distance_km.is_nan() || distance_km <= 0.0 {
        return 0.0;
    }
    distance_km / (duration_seconds as f64 / 3600.0)
}
