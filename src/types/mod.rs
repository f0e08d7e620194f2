use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque session identity: `session_<unix millis>_<pid>_<sequence>`
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
        SessionId(format!(
            "session_{}_{}_{}",
            Utc::now().timestamp_millis(),
            std::process::id(),
            seq
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the id can be used as a file stem without escaping the data dir
    pub fn is_path_safe(&self) -> bool {
        !self.0.is_empty()
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        SessionId(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        SessionId(value)
    }
}

/// Coordinator lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackerState {
    /// No session running, ready to start
    Idle,
    /// Subscribed to sensors and accumulating
    Active,
    /// Session closed; reset before starting another
    Completed,
}

impl fmt::Display for TrackerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrackerState::Idle => "idle",
            TrackerState::Active => "active",
            TrackerState::Completed => "completed",
        };
        f.write_str(name)
    }
}

/// Totals written into a session when it closes
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FinalTotals {
    pub steps: u64,
    pub distance_km: f64,
    pub duration_seconds: u64,
    pub average_speed_kmh: f64,
}

/// A running session. Open while `end_time` is `None`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub steps: u64,
    pub distance_km: f64,
    pub average_speed_kmh: f64,
    pub duration_seconds: u64,
}

impl Session {
    /// New open session with zero totals
    pub fn begin(start_time: DateTime<Utc>) -> Self {
        Session {
            id: SessionId::generate(),
            start_time,
            end_time: None,
            steps: 0,
            distance_km: 0.0,
            average_speed_kmh: 0.0,
            duration_seconds: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }

    pub fn close(&mut self, end_time: DateTime<Utc>, totals: &FinalTotals) {
        self.end_time = Some(end_time);
        self.steps = totals.steps;
        self.distance_km = totals.distance_km;
        self.duration_seconds = totals.duration_seconds;
        self.average_speed_kmh = totals.average_speed_kmh;
    }
}

/// Raw fix as delivered by a position source
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
    /// Reported ground speed in m/s
    pub speed_mps: f64,
}

impl PositionSample {
    pub fn new(latitude: f64, longitude: f64, speed_mps: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            latitude,
            longitude,
            timestamp,
            speed_mps,
        }
    }
}

/// Position fix persisted against a session
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PositionFix {
    pub session_id: SessionId,
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
    pub speed_mps: f64,
}

impl PositionFix {
    pub fn from_sample(session_id: SessionId, sample: &PositionSample) -> Self {
        PositionFix {
            session_id,
            latitude: sample.latitude,
            longitude: sample.longitude,
            timestamp: sample.timestamp,
            speed_mps: sample.speed_mps,
        }
    }
}

/// Raw cumulative step counter value
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReading {
    pub count: u64,
    pub timestamp: DateTime<Utc>,
}

impl StepReading {
    pub fn new(count: u64, timestamp: DateTime<Utc>) -> Self {
        Self { count, timestamp }
    }
}

/// Per-tick data point
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotPoint {
    pub session_id: SessionId,
    pub timestamp: DateTime<Utc>,
    pub steps: u64,
    pub speed_kmh: f64,
    pub distance_km: f64,
}

/// A session with all of its recorded points
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session: Session,
    pub fixes: Vec<PositionFix>,
    pub snapshots: Vec<SnapshotPoint>,
}

impl SessionRecord {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            fixes: Vec::new(),
            snapshots: Vec::new(),
        }
    }

    /// Serialize to JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
