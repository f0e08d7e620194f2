use std::sync::Mutex;

use chrono::Utc;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::stream::{self, BoxStream, StreamExt};
use thiserror::Error;
use tokio::time::{interval, Duration, Interval, MissedTickBehavior};

use crate::types::{PositionSample, StepReading};

/// Error item emitted by a sensor stream. The stream may keep going afterwards.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct SourceError(pub String);

pub type SensorStream<T> = BoxStream<'static, Result<T, SourceError>>;

/// Cumulative step counter feed
pub trait StepSource: Send + Sync {
    fn subscribe(&self) -> SensorStream<StepReading>;
}

/// Location provider feed
pub trait PositionSource: Send + Sync {
    fn subscribe(&self) -> SensorStream<PositionSample>;
}

/// Source driven by explicit `emit`/`fail` calls.
///
/// Every `subscribe` opens a new channel; dropping the returned stream closes
/// it, which is how `active_subscribers` tells live subscriptions apart.
pub struct PushSource<T> {
    subscribers: Mutex<Vec<UnboundedSender<Result<T, SourceError>>>>,
}

impl<T: Clone + Send + 'static> PushSource<T> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn open(&self) -> SensorStream<T> {
        let (tx, rx) = unbounded();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx.boxed()
    }

    /// Deliver a reading, returns how many subscribers received it
    pub fn emit(&self, item: T) -> usize {
        self.broadcast(Ok(item))
    }

    /// Deliver an error item
    pub fn fail(&self, message: impl Into<String>) -> usize {
        self.broadcast(Err(SourceError(message.into())))
    }

    fn broadcast(&self, item: Result<T, SourceError>) -> usize {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return 0;
        };
        subscribers.retain(|tx| !tx.is_closed());
        subscribers
            .iter()
            .filter(|tx| tx.unbounded_send(item.clone()).is_ok())
            .count()
    }

    pub fn active_subscribers(&self) -> usize {
        self.subscribers
            .lock()
            .ok()
            .map(|mut subscribers| {
                subscribers.retain(|tx| !tx.is_closed());
                subscribers.len()
            })
            .unwrap_or(0)
    }
}

impl<T: Clone + Send + 'static> Default for PushSource<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl StepSource for PushSource<StepReading> {
    fn subscribe(&self) -> SensorStream<StepReading> {
        self.open()
    }
}

impl PositionSource for PushSource<PositionSample> {
    fn subscribe(&self) -> SensorStream<PositionSample> {
        self.open()
    }
}

fn new_ticker(period: Duration) -> Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

/// Mock pedometer: a since-boot counter advancing at a steady cadence
#[derive(Clone, Debug)]
pub struct SimulatedStepSource {
    pub start_count: u64,
    pub cadence_spm: f64,
    pub period: Duration,
}

impl SimulatedStepSource {
    pub fn new(start_count: u64, cadence_spm: f64) -> Self {
        Self {
            start_count,
            cadence_spm,
            period: Duration::from_secs(1),
        }
    }
}

impl StepSource for SimulatedStepSource {
    fn subscribe(&self) -> SensorStream<StepReading> {
        let start_count = self.start_count;
        let period = self.period;
        let per_tick = self.cadence_spm.max(0.0) * period.as_secs_f64() / 60.0;

        stream::unfold((None::<Interval>, 0.0_f64, 0_u64), move |(ticker_state, taken, sample_count)| async move {
            let mut ticker = ticker_state.unwrap_or_else(|| new_ticker(period));
            ticker.tick().await;

            let count = start_count + taken.floor() as u64;
            let sample_count = sample_count + 1;
            if sample_count % 60 == 0 {
                log::debug!("[steps] {} samples", sample_count);
            }

            let reading = StepReading::new(count, Utc::now());
            Some((Ok(reading), (Some(ticker), taken + per_tick, sample_count)))
        })
        .boxed()
    }
}

/// Mock GPS: walks due north from `origin` at a constant speed.
/// Every `glitch_every`-th fix is thrown ~1 km east to exercise the jump filter.
#[derive(Clone, Debug)]
pub struct SimulatedPositionSource {
    pub origin: (f64, f64),
    pub speed_mps: f64,
    pub period: Duration,
    pub glitch_every: Option<u64>,
}

impl SimulatedPositionSource {
    pub fn new(origin: (f64, f64), speed_mps: f64) -> Self {
        Self {
            origin,
            speed_mps,
            period: Duration::from_secs(1),
            glitch_every: Some(15),
        }
    }
}

const METERS_PER_DEG_LAT: f64 = 111_320.0;
const GLITCH_OFFSET_DEG: f64 = 0.01;

impl PositionSource for SimulatedPositionSource {
    fn subscribe(&self) -> SensorStream<PositionSample> {
        let (origin_lat, origin_lon) = self.origin;
        let speed_mps = self.speed_mps;
        let period = self.period;
        let glitch_every = self.glitch_every.filter(|n| *n > 0);

        stream::unfold((None::<Interval>, 0_u64), move |(ticker_state, seq)| async move {
            let mut ticker = ticker_state.unwrap_or_else(|| new_ticker(period));
            ticker.tick().await;

            let travelled_m = speed_mps * period.as_secs_f64() * seq as f64;
            let latitude = origin_lat + travelled_m / METERS_PER_DEG_LAT;
            let glitch = glitch_every.is_some_and(|n| seq % n == n - 1);
            let longitude = if glitch {
                origin_lon + GLITCH_OFFSET_DEG
            } else {
                origin_lon
            };

            if glitch {
                log::debug!("[gps] simulated jump at fix {}", seq + 1);
            }

            let sample = PositionSample::new(latitude, longitude, speed_mps, Utc::now());
            Some((Ok(sample), (Some(ticker), seq + 1)))
        })
        .boxed()
    }
}
