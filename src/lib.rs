// Run Tracker
// Fuses step counter and GPS feeds into one session record with derived
// distance, speed and pace, and persists a per-second time series.

pub mod aggregates;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod geo_filter;
pub mod observer;
pub mod permission;
pub mod sensors;
pub mod snapshot;
pub mod step_normalizer;
pub mod storage;
pub mod types;

pub use aggregates::{AggregateSnapshot, SessionAggregates};
pub use config::TrackerConfig;
pub use coordinator::{SessionCoordinator, StartOutcome, StopReport};
pub use error::{SensorKind, TResult, TrackerError};
pub use geo_filter::{DistanceOutcome, GeoDistanceFilter};
pub use observer::{ChannelObserver, ObserverId, SessionObserver, TrackerSignal};
pub use permission::{PermissionGate, StaticPermissionGate};
pub use sensors::{PositionSource, PushSource, StepSource};
pub use storage::{JsonFileStore, MemoryStore, PersistenceSink, SessionSummary};
pub use types::{
    PositionFix, PositionSample, Session, SessionId, SessionRecord, SnapshotPoint, StepReading,
    TrackerState,
};
