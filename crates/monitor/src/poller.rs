//! Polling coordinator: re-fetches windowed history for every sensor of the
//! selected crop and republishes one merged real-time snapshot.
//!
//! ## Scheduler state machine
//!
//! ```text
//! Idle ──[start_monitoring: one cycle, flag on, timer spawned]──▶ Polling
//!  ▲                                                                │
//!  └──────────[stop_monitoring: flag off, timer retired]────────────┘
//! ```
//!
//! Every cycle, timed or manual, goes through the same three gates in
//! order: a poll target must exist, the last cycle must have started at
//! least `min_spacing` ago, and no other cycle may be in flight.  A cycle
//! that fails any gate is dropped, never queued.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{watch, Notify};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::api::HistoryQuery;
use crate::model::{Id, Reading, Sensor};
use crate::normalize::{display_unit_or, SensorKind};
use crate::repo::{InFlight, ReadingRepository, SensorRepository};
use crate::state::SharedState;
use crate::trend::{self, Trend};

// ---------------------------------------------------------------------------
// Time range
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimeRange {
    #[serde(rename = "1H")]
    OneHour,
    #[default]
    #[serde(rename = "6H")]
    SixHours,
    #[serde(rename = "24H")]
    Day,
}

impl TimeRange {
    pub fn as_str(self) -> &'static str {
        match self {
            TimeRange::OneHour => "1H",
            TimeRange::SixHours => "6H",
            TimeRange::Day => "24H",
        }
    }

    pub fn lookback(self) -> time::Duration {
        match self {
            TimeRange::OneHour => time::Duration::hours(1),
            TimeRange::SixHours => time::Duration::hours(6),
            TimeRange::Day => time::Duration::days(1),
        }
    }
}

impl FromStr for TimeRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "1H" => Ok(TimeRange::OneHour),
            "6H" => Ok(TimeRange::SixHours),
            "24H" => Ok(TimeRange::Day),
            other => Err(format!("unknown time range {other:?} (expected 1H, 6H or 24H)")),
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshot and target
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RealTimeSnapshot {
    pub current: Reading,
    /// `None` for sensors of an unrecognised kind.
    pub trend: Option<Trend>,
    /// Newest first.
    pub history: Vec<Reading>,
    pub kind: Option<SensorKind>,
    pub unit: String,
}

/// What one cycle polls: the selected crop and the sensors it owns.
#[derive(Debug, Clone, PartialEq)]
pub struct PollTarget {
    pub crop_id: Id,
    pub sensors: Vec<Sensor>,
}

impl PollTarget {
    /// `None` without a selection or when no listed sensor belongs to it.
    pub fn derive(selected: Option<Id>, sensors: &[Sensor]) -> Option<Self> {
        let crop_id = selected?;
        let owned: Vec<Sensor> = sensors
            .iter()
            .filter(|s| s.crop_id == Some(crop_id))
            .cloned()
            .collect();
        if owned.is_empty() {
            return None;
        }
        Some(Self {
            crop_id,
            sensors: owned,
        })
    }

    pub fn sensor_ids(&self) -> Vec<Id> {
        self.sensors.iter().map(|s| s.id).collect()
    }
}

// ---------------------------------------------------------------------------
// Settings and outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct PollSettings {
    pub interval: Duration,
    pub min_spacing: Duration,
    pub history_limit: u32,
    pub time_range: TimeRange,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(60_000),
            min_spacing: Duration::from_millis(5_000),
            history_limit: 100,
            time_range: TimeRange::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoTarget,
    RateLimited,
    InFlight,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Skipped(SkipReason),
    /// Snapshot installed; `sensors` is the number of keys in it.
    Completed { sensors: usize },
    /// The selection changed while the cycle ran; its result was dropped.
    Superseded,
    Failed(String),
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

struct Inner {
    sensors: Arc<SensorRepository>,
    readings: Arc<ReadingRepository>,
    shared: SharedState,
    min_spacing: Duration,
    history_limit: u32,
    interval: Mutex<Duration>,
    monitoring: AtomicBool,
    in_flight: InFlight,
    /// Start of the last cycle that passed every gate.
    last_fetch_at: tokio::sync::Mutex<Option<Instant>>,
    generation: watch::Sender<u64>,
}

struct Timer {
    retire: Arc<Notify>,
}

impl Timer {
    /// Prevents future ticks.  A cycle already running finishes first.
    fn retire(self) {
        self.retire.notify_one();
    }
}

pub struct PollingCoordinator {
    inner: Arc<Inner>,
    timer: Mutex<Option<Timer>>,
}

impl PollingCoordinator {
    pub fn new(
        sensors: Arc<SensorRepository>,
        readings: Arc<ReadingRepository>,
        shared: SharedState,
        settings: &PollSettings,
    ) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                sensors,
                readings,
                shared,
                min_spacing: settings.min_spacing,
                history_limit: settings.history_limit,
                interval: Mutex::new(settings.interval),
                monitoring: AtomicBool::new(false),
                in_flight: InFlight::default(),
                last_fetch_at: tokio::sync::Mutex::new(None),
                generation,
            }),
            timer: Mutex::new(None),
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.inner.monitoring.load(Ordering::Acquire)
    }

    pub fn is_fetching(&self) -> bool {
        self.inner.in_flight.is_active()
    }

    pub fn interval(&self) -> Duration {
        *lock(&self.inner.interval)
    }

    /// Receiver that changes every time a new snapshot is installed.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.generation.subscribe()
    }

    pub async fn time_range(&self) -> TimeRange {
        self.inner.shared.read().await.time_range
    }

    /// Run one cycle now, subject to the gates.
    pub async fn fetch_latest_readings(&self) -> FetchOutcome {
        self.inner.fetch_latest_readings().await
    }

    /// Idempotent.  Runs one cycle immediately, then turns the flag on and
    /// spawns the recurring timer.  `None` when already monitoring.
    pub async fn start_monitoring(&self) -> Option<FetchOutcome> {
        if self.is_monitoring() {
            debug!("monitoring already active");
            return None;
        }
        let outcome = self.inner.fetch_latest_readings().await;

        if self
            .inner
            .monitoring
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        let interval = self.interval();
        self.replace_timer(Some(spawn_timer(self.inner.clone(), interval)));
        info!(interval_ms = interval.as_millis() as u64, "monitoring started");
        self.inner
            .shared
            .write()
            .await
            .record_system("monitoring started".to_string());
        Some(outcome)
    }

    /// Flip the flag off and retire the timer.  An in-flight cycle still
    /// completes and installs its result.
    pub async fn stop_monitoring(&self) {
        if !self.inner.monitoring.swap(false, Ordering::AcqRel) {
            return;
        }
        self.replace_timer(None);
        info!("monitoring stopped");
        self.inner
            .shared
            .write()
            .await
            .record_system("monitoring stopped".to_string());
    }

    /// Takes effect on the next cycle; no fetch is triggered.
    pub async fn change_time_range(&self, range: TimeRange) {
        let mut st = self.inner.shared.write().await;
        if st.time_range != range {
            info!(range = range.as_str(), "time range changed");
            st.time_range = range;
        }
    }

    /// Swap the timer period.  While monitoring, the current timer is
    /// retired and a new one started with the new period.
    pub fn set_interval(&self, interval: Duration) {
        if interval.is_zero() {
            warn!("ignoring zero polling interval");
            return;
        }
        *lock(&self.inner.interval) = interval;
        if self.is_monitoring() {
            self.replace_timer(Some(spawn_timer(self.inner.clone(), interval)));
            info!(interval_ms = interval.as_millis() as u64, "polling interval changed");
        }
    }

    fn replace_timer(&self, next: Option<Timer>) {
        let previous = std::mem::replace(&mut *lock(&self.timer), next);
        if let Some(timer) = previous {
            timer.retire();
        }
    }
}

impl Drop for PollingCoordinator {
    fn drop(&mut self) {
        self.inner.monitoring.store(false, Ordering::Release);
        self.replace_timer(None);
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn spawn_timer(inner: Arc<Inner>, period: Duration) -> Timer {
    let retire = Arc::new(Notify::new());
    let signal = retire.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = signal.notified() => break,
                _ = ticker.tick() => {
                    let outcome = inner.fetch_latest_readings().await;
                    debug!(?outcome, "timed poll cycle");
                }
            }
        }
        debug!("poll timer retired");
    });
    Timer { retire }
}

// ---------------------------------------------------------------------------
// Fetch cycle
// ---------------------------------------------------------------------------

impl Inner {
    async fn fetch_latest_readings(&self) -> FetchOutcome {
        let (selected, time_range) = {
            let st = self.shared.read().await;
            (st.selected_crop_id(), st.time_range)
        };
        let sensors = self.sensors.items().await;
        let Some(target) = PollTarget::derive(selected, &sensors) else {
            debug!("poll skipped: no crop or sensors to poll");
            return FetchOutcome::Skipped(SkipReason::NoTarget);
        };

        // Rate limit and re-entrancy are decided under one lock so two
        // callers cannot both pass.
        let _cycle = {
            let mut last = self.last_fetch_at.lock().await;
            let now = Instant::now();
            if let Some(prev) = *last {
                let elapsed = now.duration_since(prev);
                if elapsed < self.min_spacing {
                    debug!(elapsed_ms = elapsed.as_millis() as u64, "poll skipped: rate limited");
                    return FetchOutcome::Skipped(SkipReason::RateLimited);
                }
            }
            let Some(guard) = self.in_flight.try_begin() else {
                debug!("poll skipped: cycle already in flight");
                return FetchOutcome::Skipped(SkipReason::InFlight);
            };
            *last = Some(now);
            guard
        };

        let end = OffsetDateTime::now_utc();
        let start = end - time_range.lookback();
        debug!(
            crop = target.crop_id,
            sensors = ?target.sensor_ids(),
            range = time_range.as_str(),
            "poll cycle started"
        );

        let mut next = BTreeMap::new();
        for sensor in &target.sensors {
            let query = HistoryQuery {
                crop_id: target.crop_id,
                sensor_id: sensor.id,
                start,
                end,
                limit: self.history_limit,
            };
            let mut history = match self.readings.history(&query).await {
                Ok(rows) => rows,
                Err(message) => {
                    warn!(crop = target.crop_id, sensor = sensor.id, "poll cycle aborted");
                    self.shared.write().await.record_poll_error(message.clone());
                    return FetchOutcome::Failed(message);
                }
            };
            if history.is_empty() {
                continue;
            }
            history.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
            next.insert(sensor.id, snapshot(sensor, history));
        }

        let count = next.len();
        {
            let mut st = self.shared.write().await;
            if st.selected_crop_id() != Some(target.crop_id) {
                debug!(crop = target.crop_id, "poll result dropped: selection changed");
                return FetchOutcome::Superseded;
            }
            st.install_snapshot(target.crop_id, next);
        }
        self.generation.send_modify(|g| *g += 1);
        info!(crop = target.crop_id, sensors = count, "snapshot installed");
        FetchOutcome::Completed { sensors: count }
    }
}

/// `history` must be non-empty and sorted newest first.
fn snapshot(sensor: &Sensor, history: Vec<Reading>) -> RealTimeSnapshot {
    let trend = sensor.kind.map(|_| trend::compute(&history));
    RealTimeSnapshot {
        current: history[0].clone(),
        trend,
        history,
        kind: sensor.kind,
        unit: display_unit_or(sensor.kind, &sensor.unit),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
