//! Session lifecycle and sensor fan-in.
//!
//! While a session is active four tasks run: one pump per sensor stream, a
//! one-second timer, and a single intake task. The pumps and the timer only
//! forward events into one bounded channel; the intake task is the only code
//! that touches the aggregates while the session runs. Per-source order is the
//! channel order; nothing is promised across sources.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant};

use crate::aggregates::{AggregateSnapshot, SessionAggregates};
use crate::config::TrackerConfig;
use crate::error::{SensorKind, TResult, TrackerError};
use crate::geo_filter::DistanceOutcome;
use crate::observer::{ObserverId, ObserverRegistry, SessionObserver};
use crate::permission::PermissionGate;
use crate::sensors::{PositionSource, SensorStream, StepSource};
use crate::snapshot::SnapshotRecorder;
use crate::storage::PersistenceSink;
use crate::types::{
    PositionFix, PositionSample, Session, SessionId, SnapshotPoint, StepReading, TrackerState,
};

pub const TICK_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug)]
enum TrackerEvent {
    Step(StepReading),
    Position(PositionSample),
    Tick,
    SourceFailed { sensor: SensorKind, message: String },
}

#[derive(Clone, Debug, PartialEq)]
pub enum StartOutcome {
    Started(SessionId),
    /// A session was already running; nothing changed
    AlreadyActive,
}

/// Result of closing a session. The closing write may fail without undoing the stop.
#[derive(Clone, Debug)]
pub struct StopReport {
    pub session: Session,
    pub persist_error: Option<TrackerError>,
}

/// Point to hand to the sink once the session lock is released
#[derive(Debug)]
enum PendingWrite {
    Fix(PositionFix),
    Snapshot(SnapshotPoint),
}

/// What one event changed. Persisted and published after the lock is released.
#[derive(Default)]
struct Applied {
    aggregates: Option<AggregateSnapshot>,
    write: Option<PendingWrite>,
    errors: Vec<TrackerError>,
}

impl Applied {
    fn persist(&mut self, sink: &dyn PersistenceSink) {
        let result = match self.write.take() {
            Some(PendingWrite::Fix(fix)) => sink.append_position_fix(&fix),
            Some(PendingWrite::Snapshot(point)) => sink.append_snapshot(&point),
            None => return,
        };
        if let Err(err) = result {
            log::warn!("[store] failed to append point: {}", err);
            self.errors.push(err);
        }
    }

    fn publish(self, observers: &ObserverRegistry) {
        for err in &self.errors {
            observers.notify_error(err);
        }
        if let Some(aggregates) = &self.aggregates {
            observers.notify_aggregates(aggregates);
        }
    }
}

struct Core {
    state: TrackerState,
    session: Option<Session>,
    aggregates: SessionAggregates,
    recorder: Option<SnapshotRecorder>,
}

impl Core {
    fn apply(&mut self, event: TrackerEvent) -> Applied {
        let mut applied = Applied::default();

        // Events that were queued when stop() ran are dropped here
        if self.state != TrackerState::Active {
            return applied;
        }
        let Some(session_id) = self.session.as_ref().map(|s| s.id.clone()) else {
            return applied;
        };

        match event {
            TrackerEvent::Step(reading) => {
                let steps = self.aggregates.apply_step_reading(reading.count);
                log::trace!("[steps] raw {} -> session {}", reading.count, steps);
            }
            TrackerEvent::Position(sample) => {
                if let DistanceOutcome::Rejected { delta_m } =
                    self.aggregates.apply_position_fix(&sample)
                {
                    log::debug!("[gps] discarded {:.1} m delta", delta_m);
                }
                let fix = PositionFix::from_sample(session_id, &sample);
                applied.write = Some(PendingWrite::Fix(fix));
            }
            TrackerEvent::Tick => {
                self.aggregates.tick();
                applied.write = self.recorder.as_ref().map(|recorder| {
                    PendingWrite::Snapshot(recorder.record(&self.aggregates, Utc::now()))
                });
            }
            TrackerEvent::SourceFailed { sensor, message } => {
                log::warn!("[{}] stream error: {}", sensor, message);
                applied
                    .errors
                    .push(TrackerError::SensorStream { sensor, message });
                return applied;
            }
        }

        applied.aggregates = Some(self.aggregates.snapshot());
        applied
    }
}

/// Tasks feeding one session. Dropping this aborts them.
struct Subscriptions {
    tasks: Vec<JoinHandle<()>>,
}

impl Subscriptions {
    /// Abort every task and wait until each one has been torn down
    async fn cancel(mut self) {
        let tasks = std::mem::take(&mut self.tasks);
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }
    }
}

impl Drop for Subscriptions {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn pump<T: Send + 'static>(
    mut stream: SensorStream<T>,
    tx: mpsc::Sender<TrackerEvent>,
    sensor: SensorKind,
    wrap: fn(T) -> TrackerEvent,
) {
    while let Some(item) = stream.next().await {
        let event = match item {
            Ok(value) => wrap(value),
            Err(err) => TrackerEvent::SourceFailed {
                sensor,
                message: err.0,
            },
        };
        if tx.send(event).await.is_err() {
            return;
        }
    }
    log::info!("[{}] stream ended", sensor);
}

async fn run_timer(tx: mpsc::Sender<TrackerEvent>) {
    let mut ticker = interval_at(Instant::now() + TICK_PERIOD, TICK_PERIOD);
    loop {
        ticker.tick().await;
        if tx.send(TrackerEvent::Tick).await.is_err() {
            return;
        }
    }
}

async fn run_intake(
    mut rx: mpsc::Receiver<TrackerEvent>,
    core: Arc<Mutex<Core>>,
    sink: Arc<dyn PersistenceSink>,
    observers: Arc<ObserverRegistry>,
) {
    while let Some(event) = rx.recv().await {
        let mut applied = match core.lock() {
            Ok(mut core) => core.apply(event),
            Err(_) => {
                let err = TrackerError::Internal("Failed to acquire session lock".to_string());
                log::error!("[session] {}", err);
                observers.notify_error(&err);
                return;
            }
        };
        // Disk I/O happens here, with the lock already dropped
        applied.persist(sink.as_ref());
        applied.publish(&observers);
    }
}

/// Owns the running session and the subscriptions feeding it
pub struct SessionCoordinator {
    gate: Arc<dyn PermissionGate>,
    steps: Arc<dyn StepSource>,
    positions: Arc<dyn PositionSource>,
    sink: Arc<dyn PersistenceSink>,
    observers: Arc<ObserverRegistry>,
    config: TrackerConfig,
    core: Arc<Mutex<Core>>,
    subscriptions: Option<Subscriptions>,
}

impl SessionCoordinator {
    pub fn new(
        gate: Arc<dyn PermissionGate>,
        steps: Arc<dyn StepSource>,
        positions: Arc<dyn PositionSource>,
        sink: Arc<dyn PersistenceSink>,
        config: TrackerConfig,
    ) -> Self {
        let core = Core {
            state: TrackerState::Idle,
            session: None,
            aggregates: SessionAggregates::new(config.distance_filter()),
            recorder: None,
        };

        Self {
            gate,
            steps,
            positions,
            sink,
            observers: Arc::new(ObserverRegistry::new()),
            config,
            core: Arc::new(Mutex::new(core)),
            subscriptions: None,
        }
    }

    fn lock_core(&self) -> TResult<MutexGuard<'_, Core>> {
        self.core
            .lock()
            .map_err(|_| TrackerError::Internal("Failed to acquire session lock".to_string()))
    }

    pub fn state(&self) -> TResult<TrackerState> {
        Ok(self.lock_core()?.state)
    }

    pub fn aggregates(&self) -> TResult<AggregateSnapshot> {
        Ok(self.lock_core()?.aggregates.snapshot())
    }

    /// The open or just-completed session
    pub fn current_session(&self) -> TResult<Option<Session>> {
        Ok(self.lock_core()?.session.clone())
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscriptions.is_some()
    }

    pub fn subscribe(&self, observer: Arc<dyn SessionObserver>) -> ObserverId {
        self.observers.subscribe(observer)
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        self.observers.unsubscribe(id)
    }

    /// Idle -> Active. Nothing is subscribed unless every step before it succeeded.
    pub async fn start(&mut self) -> TResult<StartOutcome> {
        match self.state()? {
            TrackerState::Idle => {}
            TrackerState::Active => {
                log::debug!("[session] start ignored, already active");
                return Ok(StartOutcome::AlreadyActive);
            }
            TrackerState::Completed => {
                return Err(TrackerError::InvalidState(
                    "Session completed; reset before starting again".to_string(),
                ));
            }
        }

        if !self.gate.check_and_request().await {
            log::warn!("[session] start refused: sensor permission denied");
            return Err(TrackerError::PermissionDenied);
        }

        let session = Session::begin(Utc::now());
        if let Err(err) = self.sink.create_session(&session) {
            log::error!("[session] could not persist new session: {}", err);
            return Err(err);
        }

        {
            let mut core = self.lock_core()?;
            core.aggregates.reset();
            core.recorder = Some(SnapshotRecorder::new(session.id.clone()));
            core.session = Some(session.clone());
            core.state = TrackerState::Active;
        }

        log::info!("[session] {} started", session.id);
        self.observers.notify_state(TrackerState::Active);

        self.subscriptions = Some(self.spawn_subscriptions());
        Ok(StartOutcome::Started(session.id))
    }

    fn spawn_subscriptions(&self) -> Subscriptions {
        let (tx, rx) = mpsc::channel(self.config.intake_capacity);

        let step_stream = self.steps.subscribe();
        let position_stream = self.positions.subscribe();

        let intake = tokio::spawn(run_intake(
            rx,
            Arc::clone(&self.core),
            Arc::clone(&self.sink),
            Arc::clone(&self.observers),
        ));
        let steps = tokio::spawn(pump(step_stream, tx.clone(), SensorKind::Steps, TrackerEvent::Step));
        let positions = tokio::spawn(pump(
            position_stream,
            tx.clone(),
            SensorKind::Position,
            TrackerEvent::Position,
        ));
        let timer = tokio::spawn(run_timer(tx));

        Subscriptions {
            tasks: vec![steps, positions, timer, intake],
        }
    }

    /// Active -> Completed. Returns `None` when no session is active.
    pub async fn stop(&mut self) -> TResult<Option<StopReport>> {
        if self.state()? != TrackerState::Active {
            return Ok(None);
        }

        if let Some(subscriptions) = self.subscriptions.take() {
            subscriptions.cancel().await;
        }

        let (session, aggregates) = {
            let mut core = self.lock_core()?;
            let Some(mut session) = core.session.take() else {
                core.state = TrackerState::Idle;
                return Err(TrackerError::Internal(
                    "Active state without a session".to_string(),
                ));
            };
            let totals = core.aggregates.finalize();
            session.close(Utc::now(), &totals);
            core.session = Some(session.clone());
            core.state = TrackerState::Completed;
            (session, core.aggregates.snapshot())
        };

        let persist_error = self.sink.update_session(&session).err();
        if let Some(err) = &persist_error {
            log::error!("[store] failed to write closed session {}: {}", session.id, err);
            self.observers.notify_error(err);
        }

        log::info!(
            "[session] {} stopped: {} s, {:.3} km, {} steps, {:.2} km/h avg",
            session.id,
            session.duration_seconds,
            session.distance_km,
            session.steps,
            session.average_speed_kmh
        );
        self.observers.notify_aggregates(&aggregates);
        self.observers.notify_state(TrackerState::Completed);

        Ok(Some(StopReport {
            session,
            persist_error,
        }))
    }

    /// Completed/Idle -> Idle, forgetting the last session
    pub fn reset(&mut self) -> TResult<()> {
        {
            let mut core = self.lock_core()?;
            if core.state == TrackerState::Active {
                return Err(TrackerError::InvalidState(
                    "Cannot reset while a session is active".to_string(),
                ));
            }
            core.session = None;
            core.recorder = None;
            core.aggregates.reset();
            core.state = TrackerState::Idle;
        }
        self.observers.notify_state(TrackerState::Idle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::{ChannelObserver, TrackerSignal};
    use crate::permission::StaticPermissionGate;
    use crate::sensors::PushSource;
    use crate::storage::MemoryStore;
    use approx::assert_relative_eq;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Rig {
        gate: Arc<StaticPermissionGate>,
        steps: Arc<PushSource<StepReading>>,
        positions: Arc<PushSource<PositionSample>>,
        coordinator: SessionCoordinator,
        signals: UnboundedReceiver<TrackerSignal>,
    }

    fn rig_with_sink(granted: bool, sink: Arc<dyn PersistenceSink>) -> Rig {
        let gate = Arc::new(StaticPermissionGate::new(granted));
        let steps: Arc<PushSource<StepReading>> = Arc::new(PushSource::new());
        let positions: Arc<PushSource<PositionSample>> = Arc::new(PushSource::new());
        let coordinator = SessionCoordinator::new(
            gate.clone(),
            steps.clone(),
            positions.clone(),
            sink,
            TrackerConfig::default(),
        );
        let (observer, signals) = ChannelObserver::channel();
        coordinator.subscribe(Arc::new(observer));

        Rig {
            gate,
            steps,
            positions,
            coordinator,
            signals,
        }
    }

    fn rig(granted: bool) -> (Rig, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (rig_with_sink(granted, store.clone()), store)
    }

    // With the clock paused this returns once every task has gone idle
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    fn drain(rx: &mut UnboundedReceiver<TrackerSignal>) -> Vec<TrackerSignal> {
        let mut out = Vec::new();
        while let Ok(signal) = rx.try_recv() {
            out.push(signal);
        }
        out
    }

    fn fix(latitude: f64, longitude: f64, speed_mps: f64) -> PositionSample {
        PositionSample::new(latitude, longitude, speed_mps, Utc::now())
    }

    fn steps(count: u64) -> StepReading {
        StepReading::new(count, Utc::now())
    }

    /// Delegates to a memory store, failing whichever writes are switched off
    struct FlakySink {
        inner: MemoryStore,
        fail_create: bool,
        fail_writes: AtomicBool,
    }

    impl FlakySink {
        fn new(fail_create: bool, fail_writes: bool) -> Self {
            Self {
                inner: MemoryStore::new(),
                fail_create,
                fail_writes: AtomicBool::new(fail_writes),
            }
        }

        fn check(&self) -> TResult<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                Err(TrackerError::Persistence("disk full".to_string()))
            } else {
                Ok(())
            }
        }
    }

    impl PersistenceSink for FlakySink {
        fn create_session(&self, session: &Session) -> TResult<()> {
            if self.fail_create {
                return Err(TrackerError::Persistence("read-only store".to_string()));
            }
            self.inner.create_session(session)
        }

        fn update_session(&self, session: &Session) -> TResult<()> {
            self.check()?;
            self.inner.update_session(session)
        }

        fn append_position_fix(&self, fix: &PositionFix) -> TResult<()> {
            self.check()?;
            self.inner.append_position_fix(fix)
        }

        fn append_snapshot(&self, point: &SnapshotPoint) -> TResult<()> {
            self.check()?;
            self.inner.append_snapshot(point)
        }

        fn list_sessions(&self) -> TResult<Vec<Session>> {
            self.inner.list_sessions()
        }

        fn load_session(&self, id: &SessionId) -> TResult<Option<crate::types::SessionRecord>> {
            self.inner.load_session(id)
        }

        fn delete_session(&self, id: &SessionId) -> TResult<bool> {
            self.inner.delete_session(id)
        }
    }

    /// Memory store that notes whether the session lock was held during an append
    struct LockCheckingSink {
        inner: MemoryStore,
        core: Mutex<Option<Arc<Mutex<Core>>>>,
        appends: AtomicUsize,
        appends_under_lock: AtomicUsize,
    }

    impl LockCheckingSink {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                core: Mutex::new(None),
                appends: AtomicUsize::new(0),
                appends_under_lock: AtomicUsize::new(0),
            }
        }

        fn note_append(&self) {
            self.appends.fetch_add(1, Ordering::SeqCst);
            let core = self.core.lock().unwrap().clone();
            if let Some(core) = core {
                if core.try_lock().is_err() {
                    self.appends_under_lock.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
    }

    impl PersistenceSink for LockCheckingSink {
        fn create_session(&self, session: &Session) -> TResult<()> {
            self.inner.create_session(session)
        }

        fn update_session(&self, session: &Session) -> TResult<()> {
            self.inner.update_session(session)
        }

        fn append_position_fix(&self, fix: &PositionFix) -> TResult<()> {
            self.note_append();
            self.inner.append_position_fix(fix)
        }

        fn append_snapshot(&self, point: &SnapshotPoint) -> TResult<()> {
            self.note_append();
            self.inner.append_snapshot(point)
        }

        fn list_sessions(&self) -> TResult<Vec<Session>> {
            self.inner.list_sessions()
        }

        fn load_session(&self, id: &SessionId) -> TResult<Option<crate::types::SessionRecord>> {
            self.inner.load_session(id)
        }

        fn delete_session(&self, id: &SessionId) -> TResult<bool> {
            self.inner.delete_session(id)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_writes_happen_outside_session_lock() {
        let sink = Arc::new(LockCheckingSink::new());
        let mut rig = rig_with_sink(true, sink.clone());
        *sink.core.lock().unwrap() = Some(Arc::clone(&rig.coordinator.core));
        rig.coordinator.start().await.unwrap();

        rig.positions.emit(fix(1.0, 1.0, 2.0));
        rig.positions.emit(fix(1.0003, 1.0, 2.0));
        tokio::time::sleep(Duration::from_millis(2500)).await;

        // Two fixes and two snapshots
        assert_eq!(sink.appends.load(Ordering::SeqCst), 4);
        assert_eq!(sink.appends_under_lock.load(Ordering::SeqCst), 0);

        let report = rig.coordinator.stop().await.unwrap().unwrap();
        let stored = sink.load_session(&report.session.id).unwrap().unwrap();
        assert_eq!(stored.fixes.len(), 2);
        assert_eq!(stored.snapshots.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_denied_leaves_idle() {
        let (mut rig, store) = rig(false);

        let result = rig.coordinator.start().await;
        assert_eq!(result, Err(TrackerError::PermissionDenied));
        assert_eq!(rig.coordinator.state().unwrap(), TrackerState::Idle);
        assert!(!rig.coordinator.is_subscribed());
        assert_eq!(rig.steps.active_subscribers(), 0);
        assert_eq!(rig.positions.active_subscribers(), 0);
        assert!(store.list_sessions().unwrap().is_empty());

        // Recoverable: granting and retrying works
        rig.gate.set_granted(true);
        assert!(matches!(
            rig.coordinator.start().await,
            Ok(StartOutcome::Started(_))
        ));
        assert_eq!(rig.gate.requests(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_is_ignored() {
        let (mut rig, store) = rig(true);

        let first = rig.coordinator.start().await.unwrap();
        assert!(matches!(first, StartOutcome::Started(_)));
        assert_eq!(
            rig.coordinator.start().await.unwrap(),
            StartOutcome::AlreadyActive
        );

        assert_eq!(rig.gate.requests(), 1);
        assert_eq!(rig.steps.active_subscribers(), 1);
        assert_eq!(rig.positions.active_subscribers(), 1);
        assert_eq!(store.list_sessions().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_session_flow() {
        let (mut rig, store) = rig(true);
        let StartOutcome::Started(id) = rig.coordinator.start().await.unwrap() else {
            panic!("expected a new session");
        };

        let initial = store.load_session(&id).unwrap().unwrap();
        assert!(initial.session.is_open());
        assert_eq!(initial.session.distance_km, 0.0);

        rig.positions.emit(fix(1.0, 1.0, 2.0));
        rig.positions.emit(fix(1.0005, 1.0, 2.5));
        rig.steps.emit(steps(500));
        rig.steps.emit(steps(515));
        settle().await;

        let agg = rig.coordinator.aggregates().unwrap();
        assert_relative_eq!(agg.distance_km, 0.0556, epsilon = 0.001);
        assert_eq!(agg.steps, 15);
        assert_relative_eq!(agg.speed_kmh, 9.0, epsilon = 1e-9);
        let accepted = agg.distance_km;

        // GPS jump: no distance, but speed and reference move
        rig.positions.emit(fix(2.0, 1.0, 3.0));
        settle().await;
        let agg = rig.coordinator.aggregates().unwrap();
        assert_eq!(agg.distance_km, accepted);
        assert_relative_eq!(agg.speed_kmh, 10.8, epsilon = 1e-9);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(rig.coordinator.aggregates().unwrap().elapsed_seconds, 3);

        let report = rig.coordinator.stop().await.unwrap().unwrap();
        assert!(report.persist_error.is_none());
        assert_eq!(report.session.id, id);
        assert_eq!(report.session.duration_seconds, 3);
        assert_eq!(report.session.steps, 15);
        assert_eq!(report.session.distance_km, accepted);
        assert_relative_eq!(
            report.session.average_speed_kmh,
            accepted / (3.0 / 3600.0),
            epsilon = 1e-9
        );

        assert_eq!(rig.coordinator.state().unwrap(), TrackerState::Completed);
        assert_eq!(rig.steps.active_subscribers(), 0);
        assert_eq!(rig.positions.active_subscribers(), 0);

        let stored = store.load_session(&id).unwrap().unwrap();
        assert_eq!(stored.session, report.session);
        assert!(stored.session.end_time.is_some());
        assert_eq!(stored.fixes.len(), 3);
        assert_eq!(stored.snapshots.len(), 3);
        assert_eq!(stored.snapshots[2].steps, 15);
        assert_eq!(stored.snapshots[2].distance_km, accepted);

        let signals = drain(&mut rig.signals);
        assert_eq!(signals.first(), Some(&TrackerSignal::StateChanged(TrackerState::Active)));
        assert_eq!(signals.last(), Some(&TrackerSignal::StateChanged(TrackerState::Completed)));
        assert!(signals
            .iter()
            .any(|s| matches!(s, TrackerSignal::AggregatesChanged(a) if a.steps == 15)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let (mut rig, store) = rig(true);
        rig.coordinator.start().await.unwrap();
        rig.steps.emit(steps(10));
        rig.steps.emit(steps(30));
        settle().await;

        let report = rig.coordinator.stop().await.unwrap().unwrap();
        let stored = store.list_sessions().unwrap();
        drain(&mut rig.signals);

        assert!(rig.coordinator.stop().await.unwrap().is_none());
        assert_eq!(store.list_sessions().unwrap(), stored);
        assert_eq!(rig.coordinator.current_session().unwrap(), Some(report.session));
        assert!(drain(&mut rig.signals).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_when_idle_is_noop() {
        let (mut rig, _store) = rig(true);
        assert!(rig.coordinator.stop().await.unwrap().is_none());
        assert_eq!(rig.coordinator.state().unwrap(), TrackerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_stop_has_zero_average() {
        let (mut rig, _store) = rig(true);
        rig.coordinator.start().await.unwrap();
        rig.positions.emit(fix(1.0, 1.0, 2.0));
        rig.positions.emit(fix(1.0003, 1.0, 2.0));
        settle().await;

        let report = rig.coordinator.stop().await.unwrap().unwrap();
        assert_eq!(report.session.duration_seconds, 0);
        assert!(report.session.distance_km > 0.0);
        assert_eq!(report.session.average_speed_kmh, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sensor_error_is_not_fatal() {
        let (mut rig, _store) = rig(true);
        rig.coordinator.start().await.unwrap();
        rig.steps.emit(steps(100));

        rig.positions.fail("location provider disabled");
        rig.steps.emit(steps(140));
        settle().await;

        assert_eq!(rig.coordinator.state().unwrap(), TrackerState::Active);
        assert_eq!(rig.coordinator.aggregates().unwrap().steps, 40);
        // Still subscribed to the failing source
        assert_eq!(rig.positions.active_subscribers(), 1);

        let signals = drain(&mut rig.signals);
        assert!(signals.iter().any(|s| matches!(
            s,
            TrackerSignal::Error(TrackerError::SensorStream { sensor: SensorKind::Position, .. })
        )));

        // The failing source may recover
        rig.positions.emit(fix(1.0, 1.0, 1.5));
        settle().await;
        assert_relative_eq!(rig.coordinator.aggregates().unwrap().speed_kmh, 5.4, epsilon = 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistence_failures_are_not_fatal() {
        let sink = Arc::new(FlakySink::new(false, false));
        let mut rig = rig_with_sink(true, sink.clone());
        rig.coordinator.start().await.unwrap();

        sink.fail_writes.store(true, Ordering::SeqCst);
        rig.positions.emit(fix(1.0, 1.0, 2.0));
        rig.steps.emit(steps(7));
        rig.steps.emit(steps(9));
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let agg = rig.coordinator.aggregates().unwrap();
        assert_eq!(agg.steps, 2);
        assert_eq!(agg.elapsed_seconds, 1);

        let errors = drain(&mut rig.signals)
            .into_iter()
            .filter(|s| matches!(s, TrackerSignal::Error(TrackerError::Persistence(_))))
            .count();
        // One failed fix append, one failed snapshot append
        assert_eq!(errors, 2);

        let report = rig.coordinator.stop().await.unwrap().unwrap();
        assert!(matches!(report.persist_error, Some(TrackerError::Persistence(_))));
        assert_eq!(report.session.steps, 2);
        assert_eq!(rig.coordinator.state().unwrap(), TrackerState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_initial_write_aborts_start() {
        let mut rig = rig_with_sink(true, Arc::new(FlakySink::new(true, false)));

        assert!(matches!(
            rig.coordinator.start().await,
            Err(TrackerError::Persistence(_))
        ));
        assert_eq!(rig.coordinator.state().unwrap(), TrackerState::Idle);
        assert_eq!(rig.steps.active_subscribers(), 0);
        assert_eq!(rig.positions.active_subscribers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_after_stop_are_ignored() {
        let (mut rig, _store) = rig(true);
        rig.coordinator.start().await.unwrap();
        rig.steps.emit(steps(0));
        rig.steps.emit(steps(25));
        settle().await;
        rig.coordinator.stop().await.unwrap();

        assert_eq!(rig.steps.emit(steps(90)), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;

        let agg = rig.coordinator.aggregates().unwrap();
        assert_eq!(agg.steps, 25);
        assert_eq!(agg.elapsed_seconds, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_and_restart() {
        let (mut rig, store) = rig(true);
        let StartOutcome::Started(first) = rig.coordinator.start().await.unwrap() else {
            panic!("expected a new session");
        };

        assert!(matches!(
            rig.coordinator.reset(),
            Err(TrackerError::InvalidState(_))
        ));

        rig.steps.emit(steps(1_000));
        rig.steps.emit(steps(1_010));
        settle().await;
        rig.coordinator.stop().await.unwrap();

        assert!(matches!(
            rig.coordinator.start().await,
            Err(TrackerError::InvalidState(_))
        ));

        rig.coordinator.reset().unwrap();
        assert_eq!(rig.coordinator.state().unwrap(), TrackerState::Idle);
        assert_eq!(rig.coordinator.current_session().unwrap(), None);
        assert_eq!(rig.coordinator.aggregates().unwrap(), AggregateSnapshot::default());

        let StartOutcome::Started(second) = rig.coordinator.start().await.unwrap() else {
            panic!("expected a new session");
        };
        assert_ne!(first, second);
        assert_eq!(rig.steps.active_subscribers(), 1);

        // Fresh baseline for the new session
        rig.steps.emit(steps(2_000));
        rig.steps.emit(steps(2_004));
        settle().await;
        assert_eq!(rig.coordinator.aggregates().unwrap().steps, 4);
        assert_eq!(store.list_sessions().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_releases_subscriptions() {
        let (mut rig, _store) = rig(true);
        rig.coordinator.start().await.unwrap();
        assert_eq!(rig.steps.active_subscribers(), 1);

        let Rig {
            steps,
            positions,
            coordinator,
            ..
        } = rig;
        drop(coordinator);
        settle().await;

        assert_eq!(steps.active_subscribers(), 0);
        assert_eq!(positions.active_subscribers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribed_observer_gets_nothing() {
        let (mut rig, _store) = rig(true);
        let (observer, mut rx) = ChannelObserver::channel();
        let id = rig.coordinator.subscribe(Arc::new(observer));
        assert!(rig.coordinator.unsubscribe(id));

        rig.coordinator.start().await.unwrap();
        rig.steps.emit(steps(3));
        settle().await;

        assert!(drain(&mut rx).is_empty());
        assert!(!drain(&mut rig.signals).is_empty());
    }
}
