//! Sensor repository.
//!
//! Every record is normalized into a canonical [`Sensor`] on the way in.
//! Crop-scoped listings back-fill `crop_id` and, when the backend has lost
//! the association rows but still has readings, rebuild a minimal sensor
//! list from those readings (see [`sensors_from_readings`]).

use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{describe, Activity, InFlight, Outcome};
use crate::api::{ApiError, ApiResponse, Backend};
use crate::model::{self, Id, NewSensor, Reading, Sensor, SensorRecord, SensorUpdate, Threshold};
use crate::normalize;

#[derive(Default)]
struct SensorState {
    items: Vec<Sensor>,
    current: Option<Sensor>,
    error: Option<String>,
}

pub struct SensorRepository {
    backend: Arc<dyn Backend>,
    state: RwLock<SensorState>,
    list_all_guard: InFlight,
    list_mine_guard: InFlight,
    by_crop_guard: InFlight,
    writes: Activity,
}

fn canonical(records: Vec<SensorRecord>, crop_id: Option<Id>) -> Vec<Sensor> {
    records
        .into_iter()
        .map(|r| Sensor::from_record(r, crop_id))
        .collect()
}

impl SensorRepository {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            state: RwLock::new(SensorState::default()),
            list_all_guard: InFlight::default(),
            list_mine_guard: InFlight::default(),
            by_crop_guard: InFlight::default(),
            writes: Activity::default(),
        }
    }

    // ----------------------------
    // Read model
    // ----------------------------

    pub async fn items(&self) -> Vec<Sensor> {
        self.state.read().await.items.clone()
    }

    pub async fn current(&self) -> Option<Sensor> {
        self.state.read().await.current.clone()
    }

    /// Sensors currently owned by `crop_id`, in list order.
    #[cfg(test)]
    async fn owned_by(&self, crop_id: Id) -> Vec<Sensor> {
        self.state
            .read()
            .await
            .items
            .iter()
            .filter(|s| s.crop_id == Some(crop_id))
            .cloned()
            .collect()
    }

    pub async fn error(&self) -> Option<String> {
        self.state.read().await.error.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.list_all_guard.is_active()
            || self.list_mine_guard.is_active()
            || self.by_crop_guard.is_active()
            || self.writes.is_active()
    }

    async fn fail(&self, message: String) {
        self.state.write().await.error = Some(message);
    }

    async fn replace(&self, sensors: Vec<Sensor>) -> Vec<Sensor> {
        let mut st = self.state.write().await;
        st.items = sensors;
        st.error = None;
        st.items.clone()
    }

    async fn store(&self, sensor: Sensor) {
        let mut st = self.state.write().await;
        if st.current.as_ref().is_some_and(|c| c.id == sensor.id) {
            st.current = Some(sensor.clone());
        }
        model::upsert(&mut st.items, sensor);
    }

    // ----------------------------
    // Listings
    // ----------------------------

    pub async fn list(&self) -> Vec<Sensor> {
        let Some(_guard) = self.list_all_guard.try_begin() else {
            debug!("sensor list already in flight");
            return self.items().await;
        };
        match self.backend.list_sensors().await {
            Ok(res) => self.replace(canonical(res.data, None)).await,
            Err(e) => {
                self.fail(describe("sensors", "cargar los sensores", &e)).await;
                self.items().await
            }
        }
    }

    pub async fn list_mine(&self) -> Vec<Sensor> {
        let Some(_guard) = self.list_mine_guard.try_begin() else {
            debug!("own sensor list already in flight");
            return self.items().await;
        };
        match self.backend.list_my_sensors().await {
            Ok(res) => self.replace(canonical(res.data, None)).await,
            Err(e) => {
                self.fail(describe("sensors", "cargar tus sensores", &e)).await;
                self.items().await
            }
        }
    }

    pub async fn list_by_crop(&self, crop_id: Id) -> Vec<Sensor> {
        let Some(_guard) = self.by_crop_guard.try_begin() else {
            debug!(crop = crop_id, "crop sensor list already in flight");
            return self.items().await;
        };
        match self.fetch_crop_sensors(crop_id).await {
            Ok(sensors) => {
                debug!(crop = crop_id, count = sensors.len(), "crop sensors loaded");
                self.replace(sensors).await
            }
            Err(e) => {
                self.fail(describe(
                    "sensors",
                    &format!("cargar los sensores del cultivo {crop_id}"),
                    &e,
                ))
                .await;
                self.items().await
            }
        }
    }

    /// Normalized sensors for a crop without touching repository state.
    /// Falls back to rebuilding them from readings when the crop listing is
    /// empty.
    pub async fn fetch_crop_sensors(&self, crop_id: Id) -> Result<Vec<Sensor>, ApiError> {
        let res = self.backend.list_sensors_by_crop(crop_id).await?;
        let sensors = canonical(res.data, Some(crop_id));
        if !sensors.is_empty() {
            return Ok(sensors);
        }
        Ok(self.reconstruct_from_readings(crop_id).await)
    }

    /// Fallback branch for backends that drop sensor-association rows while
    /// keeping historical readings.  Failures here only log: the primary
    /// listing already succeeded (empty).
    async fn reconstruct_from_readings(&self, crop_id: Id) -> Vec<Sensor> {
        match self.backend.list_readings_by_crop(crop_id).await {
            Ok(res) => {
                let rebuilt = sensors_from_readings(crop_id, &res.data);
                if !rebuilt.is_empty() {
                    warn!(
                        crop = crop_id,
                        count = rebuilt.len(),
                        "no sensor associations returned; rebuilt sensors from readings"
                    );
                }
                rebuilt
            }
            Err(e) => {
                warn!(crop = crop_id, error = %e, "sensor fallback: reading lookup failed");
                Vec::new()
            }
        }
    }

    // ----------------------------
    // Single-entity operations
    // ----------------------------

    pub async fn get_by_id(&self, id: Id) -> Option<Sensor> {
        let _busy = self.writes.begin();
        match self.backend.get_sensor(id).await {
            Ok(res) => {
                let sensor = Sensor::from_record(res.data, None);
                let mut st = self.state.write().await;
                st.current = Some(sensor.clone());
                model::upsert(&mut st.items, sensor.clone());
                Some(sensor)
            }
            Err(e) => {
                self.fail(describe("sensors", &format!("obtener el sensor {id}"), &e))
                    .await;
                None
            }
        }
    }

    pub async fn create(&self, data: &NewSensor) -> Option<Sensor> {
        let _busy = self.writes.begin();
        match self.backend.create_sensor(data).await {
            Ok(res) => {
                let sensor = Sensor::from_record(res.data, data.crop_id);
                info!(sensor = sensor.id, kind = ?sensor.kind, "sensor created");
                self.store(sensor.clone()).await;
                Some(sensor)
            }
            Err(e) => {
                self.fail(describe("sensors", "crear el sensor", &e)).await;
                None
            }
        }
    }

    pub async fn update(&self, id: Id, data: &SensorUpdate) -> Option<Sensor> {
        let _busy = self.writes.begin();
        match self.backend.update_sensor(id, data).await {
            Ok(res) => {
                let sensor = Sensor::from_record(res.data, None);
                self.store(sensor.clone()).await;
                Some(sensor)
            }
            Err(e) => {
                self.fail(describe("sensors", &format!("actualizar el sensor {id}"), &e))
                    .await;
                None
            }
        }
    }

    pub async fn delete(&self, id: Id) -> Outcome {
        let _busy = self.writes.begin();
        let result = self.backend.delete_sensor(id).await;
        self.finish_removal(id, "eliminar el sensor", result).await
    }

    // ----------------------------
    // Crop association
    // ----------------------------

    pub async fn associate_to_crop(
        &self,
        crop_id: Id,
        sensor_id: Id,
        threshold: Option<Threshold>,
    ) -> Option<Sensor> {
        let _busy = self.writes.begin();
        match self
            .backend
            .associate_to_crop(crop_id, sensor_id, threshold)
            .await
        {
            Ok(res) => {
                let sensor = Sensor::from_record(res.data, Some(crop_id));
                info!(crop = crop_id, sensor = sensor_id, "sensor associated");
                self.store(sensor.clone()).await;
                Some(sensor)
            }
            Err(e) => {
                self.fail(describe(
                    "sensors",
                    &format!("asociar el sensor {sensor_id} al cultivo {crop_id}"),
                    &e,
                ))
                .await;
                None
            }
        }
    }

    pub async fn disassociate_from_crop(&self, crop_id: Id, sensor_id: Id) -> Option<Sensor> {
        let _busy = self.writes.begin();
        match self.backend.disassociate_from_crop(crop_id, sensor_id).await {
            Ok(res) => {
                let sensor = Sensor::from_record(res.data, None);
                info!(crop = crop_id, sensor = sensor_id, "sensor disassociated");
                self.store(sensor.clone()).await;
                Some(sensor)
            }
            Err(e) => {
                self.fail(describe(
                    "sensors",
                    &format!("desasociar el sensor {sensor_id} del cultivo {crop_id}"),
                    &e,
                ))
                .await;
                None
            }
        }
    }

    pub async fn disassociate_and_delete(&self, crop_id: Id, sensor_id: Id) -> Outcome {
        let _busy = self.writes.begin();
        let result = self.backend.disassociate_and_delete(crop_id, sensor_id).await;
        self.finish_removal(sensor_id, "eliminar el sensor", result)
            .await
    }

    pub async fn create_and_associate(&self, crop_id: Id, data: &NewSensor) -> Option<Sensor> {
        let _busy = self.writes.begin();
        match self.backend.create_and_associate(crop_id, data).await {
            Ok(res) => {
                let sensor = Sensor::from_record(res.data, Some(crop_id));
                info!(crop = crop_id, sensor = sensor.id, "sensor created and associated");
                self.store(sensor.clone()).await;
                Some(sensor)
            }
            Err(e) => {
                self.fail(describe(
                    "sensors",
                    &format!("crear y asociar el sensor al cultivo {crop_id}"),
                    &e,
                ))
                .await;
                None
            }
        }
    }

    async fn finish_removal(
        &self,
        id: Id,
        action: &str,
        result: Result<ApiResponse<()>, ApiError>,
    ) -> Outcome {
        match result {
            Ok(res) => {
                info!(sensor = id, "sensor deleted");
                let mut st = self.state.write().await;
                model::remove(&mut st.items, id);
                if st.current.as_ref().is_some_and(|c| c.id == id) {
                    st.current = None;
                }
                Outcome::ok(res.message)
            }
            Err(e) => {
                let message = describe("sensors", &format!("{action} {id}"), &e);
                self.fail(message.clone()).await;
                Outcome::failed(message)
            }
        }
    }
}

/// Minimal sensor list from distinct `(sensor_id, sensor_type, unit)` tuples
/// found in a crop's readings.  Order follows first appearance.
pub fn sensors_from_readings(crop_id: Id, readings: &[Reading]) -> Vec<Sensor> {
    let mut seen: BTreeSet<(Id, String, String)> = BTreeSet::new();
    let mut sensors = Vec::new();

    for r in readings {
        let raw_type = r.sensor_type.clone().unwrap_or_default();
        let unit = r.unit.clone().unwrap_or_default();
        let key = (r.sensor_id, raw_type.clone(), unit.clone());
        if !seen.insert(key) {
            continue;
        }
        let kind = normalize::classify(&raw_type, &unit);
        sensors.push(Sensor {
            id: r.sensor_id,
            name: format!("Sensor {}", r.sensor_id),
            kind,
            unit: normalize::display_unit_or(kind, &unit),
            raw_type,
            crop_id: Some(crop_id),
            active: true,
            last_reading: None,
        });
    }

    sensors
}

// ===========================================================================
// Tests
// ===========================================================================
