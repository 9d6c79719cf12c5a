//! The aggregation facade: the only surface presentation code talks to.
//!
//! [`Monitor`] owns every repository, the threshold manager and the polling
//! coordinator, plus the [`SharedState`] they coordinate through.  It merges
//! their loading and error flags into one read model ([`MonitorView`]) and
//! cascades loads when the crop selection changes.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{Backend, HistoryQuery};
use crate::model::{
    Alert, AlertLevel, Crop, CropUpdate, Id, NewCrop, NewReading, NewSensor, Reading, Sensor, SensorUpdate,
    Threshold, Thresholds,
};
use crate::normalize::SensorKind;
use crate::poller::{FetchOutcome, PollSettings, PollTarget, PollingCoordinator, RealTimeSnapshot, TimeRange};
use crate::repo::{AlertRepository, CropRepository, Outcome, ReadingRepository, SensorRepository};
use crate::state::{MonitorEvent, MonitorState, SharedState};
use crate::thresholds::{BulkReport, ThresholdManager};

// ---------------------------------------------------------------------------
// Read model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct MonitorView {
    pub crops: Vec<Crop>,
    pub sensors: Vec<Sensor>,
    pub readings: Vec<Reading>,
    pub alerts: Vec<Alert>,
    /// Unresolved critical alerts among `alerts`.
    pub critical_alerts: usize,
    pub real_time_data: BTreeMap<Id, RealTimeSnapshot>,
    pub thresholds: Thresholds,
    pub threshold_revision: u64,
    pub loading: bool,
    pub error: Option<String>,
    pub is_monitoring: bool,
    pub time_range: TimeRange,
    pub selected_crop: Option<Crop>,
    pub monitored_sensor_ids: Vec<Id>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_cycle_at: Option<OffsetDateTime>,
}

/// What `GET /api/status` returns.
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    #[serde(flatten)]
    pub monitor: MonitorView,
    pub events: Vec<MonitorEvent>,
}

// ---------------------------------------------------------------------------
// Facade
// ---------------------------------------------------------------------------

pub struct Monitor {
    crops: CropRepository,
    sensors: Arc<SensorRepository>,
    readings: Arc<ReadingRepository>,
    alerts: Arc<AlertRepository>,
    thresholds: ThresholdManager,
    poller: PollingCoordinator,
    shared: SharedState,
    alert_listener: Mutex<Option<JoinHandle<()>>>,
}

impl Monitor {
    pub fn new(backend: Arc<dyn Backend>, settings: PollSettings) -> Self {
        let shared = MonitorState::shared(settings.time_range);
        let sensors = Arc::new(SensorRepository::new(backend.clone()));
        let readings = Arc::new(ReadingRepository::new(backend.clone()));
        Self {
            crops: CropRepository::new(backend.clone()),
            alerts: Arc::new(AlertRepository::new(backend.clone())),
            thresholds: ThresholdManager::new(backend, sensors.clone(), shared.clone()),
            poller: PollingCoordinator::new(sensors.clone(), readings.clone(), shared.clone(), &settings),
            sensors,
            readings,
            shared,
            alert_listener: Mutex::new(None),
        }
    }

    /// Load crops, sensors and alerts (not crop-scoped) and start reloading
    /// alerts whenever a new live snapshot is installed.
    pub async fn mount(&self) {
        tokio::join!(self.crops.list(), self.sensors.list(), self.alerts.list_mine());
        self.spawn_alert_listener();
        self.shared
            .write()
            .await
            .record_system("monitor mounted".to_string());
    }

    /// New readings may have produced backend-side alerts; reload them after
    /// every installed snapshot.
    fn spawn_alert_listener(&self) {
        let mut slot = self
            .alert_listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_some() {
            return;
        }
        let mut snapshots = self.poller.subscribe();
        let alerts = self.alerts.clone();
        let shared = self.shared.clone();
        *slot = Some(tokio::spawn(async move {
            while snapshots.changed().await.is_ok() {
                let selected = shared.read().await.selected_crop_id();
                let loaded = match selected {
                    Some(crop_id) => alerts.list_by_crop(crop_id).await,
                    None => alerts.list_mine().await,
                };
                debug!(alerts = loaded.len(), "alerts reloaded after snapshot");
                shared
                    .write()
                    .await
                    .record_alert(format!("{} alert(s) after snapshot", loaded.len()));
            }
        }));
    }

    // ----------------------------
    // Selection
    // ----------------------------

    /// Select a crop and load its sensors, alerts and thresholds.  Selecting
    /// the crop that is already selected loads nothing.
    pub async fn select_crop(&self, crop: Crop) {
        let crop_id = crop.id;
        let changed = self.shared.write().await.select_crop(Some(crop));
        if !changed {
            return;
        }
        info!(crop = crop_id, "crop selected");
        tokio::join!(
            self.sensors.list_by_crop(crop_id),
            self.alerts.list_by_crop(crop_id),
            self.thresholds.load_thresholds(crop_id),
        );
        if self.poller.is_monitoring() {
            let outcome = self.poller.fetch_latest_readings().await;
            debug!(crop = crop_id, ?outcome, "poll after selection");
        }
    }

    /// Select by id, fetching the crop when it is not in the list.
    pub async fn select_crop_by_id(&self, crop_id: Id) -> bool {
        let crop = match self.crops.find(crop_id).await {
            Some(crop) => Some(crop),
            None => self.crops.get_by_id(crop_id).await,
        };
        match crop {
            Some(crop) => {
                self.select_crop(crop).await;
                true
            }
            None => {
                warn!(crop = crop_id, "cannot select unknown crop");
                false
            }
        }
    }

    pub async fn clear_selection(&self) {
        if self.shared.write().await.select_crop(None) {
            info!("crop selection cleared");
        }
    }

    pub async fn selected_crop(&self) -> Option<Crop> {
        self.shared.read().await.selected_crop.clone()
    }

    /// Sensors of the listed set owned by the selected crop.  This is the
    /// set the polling coordinator polls.
    pub async fn monitored_sensor_ids(&self) -> Vec<Id> {
        let selected = self.shared.read().await.selected_crop_id();
        PollTarget::derive(selected, &self.sensors.items().await)
            .map(|t| t.sensor_ids())
            .unwrap_or_default()
    }

    // ----------------------------
    // Merged flags
    // ----------------------------

    pub fn loading(&self) -> bool {
        self.crops.is_loading()
            || self.sensors.is_loading()
            || self.readings.is_loading()
            || self.alerts.is_loading()
            || self.thresholds.is_loading()
            || self.poller.is_fetching()
    }

    /// First error in the order crops, sensors, readings, alerts,
    /// real-time, thresholds.
    pub async fn error(&self) -> Option<String> {
        if let Some(e) = self.crops.error().await {
            return Some(e);
        }
        if let Some(e) = self.sensors.error().await {
            return Some(e);
        }
        if let Some(e) = self.readings.error().await {
            return Some(e);
        }
        if let Some(e) = self.alerts.error().await {
            return Some(e);
        }
        if let Some(e) = self.shared.read().await.real_time_error.clone() {
            return Some(e);
        }
        self.thresholds.error().await
    }

    pub async fn view(&self) -> MonitorView {
        let (real_time_data, time_range, selected_crop, last_cycle_at) = {
            let st = self.shared.read().await;
            (
                st.real_time_data.clone(),
                st.time_range,
                st.selected_crop.clone(),
                st.last_cycle_at,
            )
        };
        MonitorView {
            crops: self.crops.items().await,
            sensors: self.sensors.items().await,
            readings: self.readings.items().await,
            alerts: self.alerts.items().await,
            critical_alerts: self.alerts.unresolved_count(AlertLevel::Critical).await,
            real_time_data,
            thresholds: self.thresholds.thresholds().await,
            threshold_revision: self.thresholds.revision().await,
            loading: self.loading(),
            error: self.error().await,
            is_monitoring: self.poller.is_monitoring(),
            time_range,
            selected_crop,
            monitored_sensor_ids: self.monitored_sensor_ids().await,
            last_cycle_at,
        }
    }

    pub async fn status(&self) -> StatusResponse {
        let monitor = self.view().await;
        let st = self.shared.read().await;
        StatusResponse {
            uptime_secs: st.uptime_secs(),
            monitor,
            events: st.recent_events(),
        }
    }

    pub async fn real_time_data(&self) -> BTreeMap<Id, RealTimeSnapshot> {
        self.shared.read().await.real_time_data.clone()
    }

    // ----------------------------
    // Crops
    // ----------------------------

    pub async fn fetch_crops(&self) -> Vec<Crop> {
        self.crops.list().await
    }

    pub async fn fetch_crop(&self, id: Id) -> Option<Crop> {
        self.crops.get_by_id(id).await
    }

    pub async fn create_crop(&self, data: &NewCrop) -> Option<Crop> {
        self.crops.create(data).await
    }

    /// Updating the selected crop refreshes the selection in place.
    pub async fn update_crop(&self, id: Id, data: &CropUpdate) -> Option<Crop> {
        let updated = self.crops.update(id, data).await?;
        let mut st = self.shared.write().await;
        if st.selected_crop_id() == Some(id) {
            st.selected_crop = Some(updated.clone());
        }
        Some(updated)
    }

    /// Deleting the selected crop clears the selection.
    pub async fn delete_crop(&self, id: Id) -> Outcome {
        let outcome = self.crops.delete(id).await;
        if outcome.success && self.shared.read().await.selected_crop_id() == Some(id) {
            self.clear_selection().await;
        }
        outcome
    }

    // ----------------------------
    // Sensors
    // ----------------------------

    pub async fn fetch_sensors(&self) -> Vec<Sensor> {
        self.sensors.list().await
    }

    pub async fn fetch_my_sensors(&self) -> Vec<Sensor> {
        self.sensors.list_mine().await
    }

    pub async fn fetch_crop_sensors(&self, crop_id: Id) -> Vec<Sensor> {
        self.sensors.list_by_crop(crop_id).await
    }

    pub async fn fetch_sensor(&self, id: Id) -> Option<Sensor> {
        self.sensors.get_by_id(id).await
    }

    pub async fn create_sensor(&self, data: &NewSensor) -> Option<Sensor> {
        self.sensors.create(data).await
    }

    pub async fn update_sensor(&self, id: Id, data: &SensorUpdate) -> Option<Sensor> {
        self.sensors.update(id, data).await
    }

    pub async fn delete_sensor(&self, id: Id) -> Outcome {
        self.sensors.delete(id).await
    }

    pub async fn associate_sensor(
        &self,
        crop_id: Id,
        sensor_id: Id,
        threshold: Option<Threshold>,
    ) -> Option<Sensor> {
        self.sensors
            .associate_to_crop(crop_id, sensor_id, threshold)
            .await
    }

    pub async fn disassociate_sensor(&self, crop_id: Id, sensor_id: Id) -> Option<Sensor> {
        self.sensors.disassociate_from_crop(crop_id, sensor_id).await
    }

    pub async fn remove_sensor_and_delete(&self, crop_id: Id, sensor_id: Id) -> Outcome {
        self.sensors.disassociate_and_delete(crop_id, sensor_id).await
    }

    pub async fn create_and_associate_sensor(&self, crop_id: Id, data: &NewSensor) -> Option<Sensor> {
        self.sensors.create_and_associate(crop_id, data).await
    }

    // ----------------------------
    // Readings
    // ----------------------------

    pub async fn fetch_readings(&self, crop_id: Id) -> Vec<Reading> {
        self.readings.list_by_crop(crop_id).await
    }

    pub async fn fetch_reading(&self, id: Id) -> Option<Reading> {
        self.readings.get_by_id(id).await
    }

    pub async fn create_reading(&self, data: &NewReading) -> Option<Reading> {
        self.readings.create(data).await
    }

    pub async fn create_readings_batch(&self, data: &[NewReading]) -> Option<Vec<Reading>> {
        self.readings.create_batch(data).await
    }

    pub async fn reading_history(&self, query: &HistoryQuery) -> Result<Vec<Reading>, String> {
        self.readings.history(query).await
    }

    /// Every reading of a crop, unwindowed.  Best effort: any failure is
    /// logged and yields an empty list.
    pub async fn all_readings_for_crop(&self, crop_id: Id) -> Vec<Reading> {
        self.readings
            .fetch_by_crop(crop_id)
            .await
            .unwrap_or_default()
    }

    // ----------------------------
    // Alerts
    // ----------------------------

    pub async fn fetch_alerts(&self) -> Vec<Alert> {
        self.alerts.list_mine().await
    }

    pub async fn fetch_crop_alerts(&self, crop_id: Id) -> Vec<Alert> {
        self.alerts.list_by_crop(crop_id).await
    }

    pub async fn fetch_alert(&self, id: Id) -> Option<Alert> {
        self.alerts.get_by_id(id).await
    }

    pub async fn delete_alert(&self, id: Id) -> Outcome {
        let outcome = self.alerts.delete(id).await;
        if outcome.success {
            self.shared
                .write()
                .await
                .record_alert(format!("alert {id} resolved"));
        }
        outcome
    }

    // ----------------------------
    // Monitoring
    // ----------------------------

    pub async fn start_monitoring(&self) -> Option<FetchOutcome> {
        self.poller.start_monitoring().await
    }

    pub async fn stop_monitoring(&self) {
        self.poller.stop_monitoring().await
    }

    pub async fn fetch_latest_readings(&self) -> FetchOutcome {
        self.poller.fetch_latest_readings().await
    }

    pub async fn change_time_range(&self, range: TimeRange) {
        self.poller.change_time_range(range).await
    }

    pub fn set_interval(&self, interval: Duration) {
        self.poller.set_interval(interval)
    }

    pub fn is_monitoring(&self) -> bool {
        self.poller.is_monitoring()
    }

    // ----------------------------
    // Thresholds
    // ----------------------------

    pub async fn thresholds(&self) -> Thresholds {
        self.thresholds.thresholds().await
    }

    pub async fn load_thresholds(&self, crop_id: Id) -> bool {
        self.thresholds.load_thresholds(crop_id).await
    }

    pub async fn update_threshold(
        &self,
        crop_id: Id,
        sensor_id: Id,
        kind: SensorKind,
        threshold: Threshold,
    ) -> bool {
        self.thresholds
            .update_threshold(crop_id, sensor_id, kind, threshold)
            .await
    }

    pub async fn update_thresholds(&self, crop_id: Id, wanted: &Thresholds) -> BulkReport {
        self.thresholds.update_all_thresholds(crop_id, wanted).await
    }

    pub async fn sensor_threshold(&self, crop_id: Id, sensor_id: Id) -> Option<Threshold> {
        self.thresholds.sensor_threshold(crop_id, sensor_id).await
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        let slot = self
            .alert_listener
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(handle) = slot.take() {
            handle.abort();
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
