use chrono::{DateTime, Utc};

use crate::aggregates::SessionAggregates;
use crate::types::{SessionId, SnapshotPoint};

/// Builds the per-tick data points for one session
#[derive(Clone, Debug)]
pub struct SnapshotRecorder {
    session_id: SessionId,
}

impl SnapshotRecorder {
    pub fn new(session_id: SessionId) -> Self {
        Self { session_id }
    }

    pub fn record(&self, aggregates: &SessionAggregates, timestamp: DateTime<Utc>) -> SnapshotPoint {
        SnapshotPoint {
            session_id: self.session_id.clone(),
            timestamp,
            steps: aggregates.steps(),
            speed_kmh: aggregates.speed_kmh(),
            distance_km: aggregates.distance_km(),
        }
    }
}
