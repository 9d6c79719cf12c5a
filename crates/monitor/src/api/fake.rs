//! In-memory [`Backend`] for tests.
//!
//! Every call is logged, yields once (so in-flight guards can be observed
//! with `tokio::join!`), and can be made to fail by name: `"list_crops"`
//! fails every crop listing, `"history:2"` only the history query for
//! sensor 2, `"update_threshold:5"` only threshold updates for sensor 5.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use time::OffsetDateTime;

use super::{ApiError, ApiResponse, ApiResult, Backend, HistoryQuery};
use crate::model::{
    Alert, AlertLevel, Crop, CropStatus, CropUpdate, Id, NewCrop, NewReading, NewSensor, Reading,
    SensorRecord, SensorUpdate, Threshold, ThresholdRecord,
};

#[derive(Default)]
pub(crate) struct FakeData {
    pub crops: Vec<Crop>,
    pub sensors: Vec<SensorRecord>,
    pub readings: Vec<Reading>,
    pub alerts: Vec<Alert>,
    pub thresholds: BTreeMap<(Id, Id), ThresholdRecord>,
    pub failures: HashSet<String>,
    pub calls: Vec<String>,
    pub history_queries: Vec<HistoryQuery>,
    /// Deleted sensors still answer `get_sensor`.
    pub sensors_survive_delete: bool,
    next_id: Id,
}

#[derive(Default)]
pub(crate) struct FakeBackend {
    data: Mutex<FakeData>,
}

pub(crate) fn crop(id: Id, name: &str) -> Crop {
    Crop {
        id,
        name: name.to_string(),
        crop_type: Some("lechuga".to_string()),
        status: CropStatus::Active,
        created_at: None,
        end_date: None,
    }
}

pub(crate) fn sensor(id: Id, crop_id: Option<Id>, sensor_type: &str) -> SensorRecord {
    SensorRecord {
        id,
        name: format!("sensor-{id}"),
        sensor_type: sensor_type.to_string(),
        unit: String::new(),
        crop_id,
        active: true,
        last_value: None,
        last_seen: None,
    }
}

pub(crate) fn reading(sensor_id: Id, crop_id: Id, value: f64, timestamp: OffsetDateTime) -> Reading {
    Reading {
        id: None,
        sensor_id,
        crop_id: Some(crop_id),
        value,
        timestamp,
        note: None,
        sensor_type: None,
        unit: None,
    }
}

pub(crate) fn alert(id: Id, crop_id: Id, level: AlertLevel) -> Alert {
    Alert {
        id,
        crop_id: Some(crop_id),
        sensor_type: "temperature".to_string(),
        level,
        message: format!("alerta {id}"),
        timestamp: None,
        resolved: false,
    }
}

impl FakeBackend {
    pub fn new() -> Self {
        let backend = Self::default();
        backend.data().next_id = 1000;
        backend
    }

    pub fn data(&self) -> MutexGuard<'_, FakeData> {
        self.data.lock().unwrap()
    }

    pub fn with_crop(self, crop: Crop) -> Self {
        self.data().crops.push(crop);
        self
    }

    pub fn with_sensor(self, sensor: SensorRecord) -> Self {
        self.data().sensors.push(sensor);
        self
    }

    pub fn with_reading(self, reading: Reading) -> Self {
        self.data().readings.push(reading);
        self
    }

    pub fn with_alert(self, alert: Alert) -> Self {
        self.data().alerts.push(alert);
        self
    }

    pub fn with_threshold(self, crop_id: Id, sensor_id: Id, sensor_type: &str, min: &str, max: &str) -> Self {
        self.set_threshold(crop_id, sensor_id, sensor_type, min, max);
        self
    }

    pub fn set_threshold(&self, crop_id: Id, sensor_id: Id, sensor_type: &str, min: &str, max: &str) {
        let parse = |s: &str| s.parse::<f64>().ok();
        self.data().thresholds.insert(
            (crop_id, sensor_id),
            ThresholdRecord {
                sensor_id,
                sensor_type: sensor_type.to_string(),
                unit: String::new(),
                min: parse(min),
                max: parse(max),
            },
        );
    }

    pub fn fail(&self, op: &str) {
        self.data().failures.insert(op.to_string());
    }

    pub fn heal(&self, op: &str) {
        self.data().failures.remove(op);
    }

    pub fn calls(&self) -> Vec<String> {
        self.data().calls.clone()
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.data().calls.iter().filter(|c| c.as_str() == op).count()
    }

    pub fn clear_calls(&self) {
        self.data().calls.clear();
    }

    pub fn history_queries(&self) -> Vec<HistoryQuery> {
        self.data().history_queries.clone()
    }

    /// Log the call, yield once, then apply failure injection for both the
    /// bare op name and `op:key`.
    async fn enter(&self, op: &str, key: Option<Id>) -> ApiResult<()> {
        let name = match key {
            Some(k) => format!("{op}:{k}"),
            None => op.to_string(),
        };
        self.data().calls.push(name.clone());

        tokio::task::yield_now().await;

        let data = self.data();
        if data.failures.contains(op) || data.failures.contains(&name) {
            return Err(ApiError::Status {
                status: 500,
                message: format!("{name} falló"),
            });
        }
        Ok(())
    }

    fn next_id(&self) -> Id {
        let mut data = self.data();
        data.next_id += 1;
        data.next_id
    }
}

fn found<T>(item: Option<T>) -> ApiResult<ApiResponse<T>> {
    item.map(ApiResponse::new).ok_or(ApiError::NotFound)
}

#[async_trait]
impl Backend for FakeBackend {
    async fn list_crops(&self) -> ApiResult<ApiResponse<Vec<Crop>>> {
        self.enter("list_crops", None).await?;
        Ok(ApiResponse::new(self.data().crops.clone()))
    }

    async fn get_crop(&self, id: Id) -> ApiResult<ApiResponse<Crop>> {
        self.enter("get_crop", Some(id)).await?;
        found(self.data().crops.iter().find(|c| c.id == id).cloned())
    }

    async fn create_crop(&self, data: &NewCrop) -> ApiResult<ApiResponse<Crop>> {
        self.enter("create_crop", None).await?;
        let created = Crop {
            id: self.next_id(),
            // The server normalizes names; lets tests tell server data from input.
            name: data.name.trim().to_string(),
            crop_type: Some(data.crop_type.clone()),
            status: data.status.unwrap_or_default(),
            created_at: data.start_date,
            end_date: None,
        };
        self.data().crops.push(created.clone());
        Ok(ApiResponse::new(created))
    }

    async fn update_crop(&self, id: Id, update: &CropUpdate) -> ApiResult<ApiResponse<Crop>> {
        self.enter("update_crop", Some(id)).await?;
        let mut data = self.data();
        let crop = data.crops.iter_mut().find(|c| c.id == id).ok_or(ApiError::NotFound)?;
        if let Some(name) = &update.name {
            crop.name = name.trim().to_string();
        }
        if let Some(status) = update.status {
            crop.status = status;
        }
        if update.crop_type.is_some() {
            crop.crop_type = update.crop_type.clone();
        }
        if update.end_date.is_some() {
            crop.end_date = update.end_date;
        }
        Ok(ApiResponse::new(crop.clone()))
    }

    async fn delete_crop(&self, id: Id) -> ApiResult<ApiResponse<()>> {
        self.enter("delete_crop", Some(id)).await?;
        let mut data = self.data();
        let before = data.crops.len();
        data.crops.retain(|c| c.id != id);
        if data.crops.len() == before {
            return Err(ApiError::NotFound);
        }
        Ok(ApiResponse::with_message((), "Cultivo eliminado"))
    }

    async fn list_sensors(&self) -> ApiResult<ApiResponse<Vec<SensorRecord>>> {
        self.enter("list_sensors", None).await?;
        Ok(ApiResponse::new(self.data().sensors.clone()))
    }

    async fn list_my_sensors(&self) -> ApiResult<ApiResponse<Vec<SensorRecord>>> {
        self.enter("list_my_sensors", None).await?;
        Ok(ApiResponse::new(self.data().sensors.clone()))
    }

    async fn get_sensor(&self, id: Id) -> ApiResult<ApiResponse<SensorRecord>> {
        self.enter("get_sensor", Some(id)).await?;
        found(self.data().sensors.iter().find(|s| s.id == id).cloned())
    }

    /// Mimics a backend that omits `crop_id` on crop-scoped listings.
    async fn list_sensors_by_crop(&self, crop_id: Id) -> ApiResult<ApiResponse<Vec<SensorRecord>>> {
        self.enter("list_sensors_by_crop", Some(crop_id)).await?;
        let sensors = self
            .data()
            .sensors
            .iter()
            .filter(|s| s.crop_id == Some(crop_id))
            .map(|s| SensorRecord {
                crop_id: None,
                ..s.clone()
            })
            .collect();
        Ok(ApiResponse::new(sensors))
    }

    async fn create_sensor(&self, data: &NewSensor) -> ApiResult<ApiResponse<SensorRecord>> {
        self.enter("create_sensor", None).await?;
        let created = SensorRecord {
            id: self.next_id(),
            name: data.name.clone(),
            sensor_type: data.sensor_type.clone(),
            unit: data.unit.clone(),
            crop_id: data.crop_id,
            active: true,
            last_value: None,
            last_seen: None,
        };
        self.data().sensors.push(created.clone());
        Ok(ApiResponse::new(created))
    }

    async fn update_sensor(&self, id: Id, update: &SensorUpdate) -> ApiResult<ApiResponse<SensorRecord>> {
        self.enter("update_sensor", Some(id)).await?;
        let mut data = self.data();
        let sensor = data.sensors.iter_mut().find(|s| s.id == id).ok_or(ApiError::NotFound)?;
        if let Some(name) = &update.name {
            sensor.name = name.clone();
        }
        if let Some(t) = &update.sensor_type {
            sensor.sensor_type = t.clone();
        }
        if let Some(unit) = &update.unit {
            sensor.unit = unit.clone();
        }
        if let Some(active) = update.active {
            sensor.active = active;
        }
        Ok(ApiResponse::new(sensor.clone()))
    }

    async fn delete_sensor(&self, id: Id) -> ApiResult<ApiResponse<()>> {
        self.enter("delete_sensor", Some(id)).await?;
        let mut data = self.data();
        let before = data.sensors.len();
        if !data.sensors_survive_delete {
            data.sensors.retain(|s| s.id != id);
        }
        if data.sensors.len() == before && !data.sensors_survive_delete {
            return Err(ApiError::NotFound);
        }
        Ok(ApiResponse::new(()))
    }

    async fn associate_to_crop(
        &self,
        crop_id: Id,
        sensor_id: Id,
        threshold: Option<Threshold>,
    ) -> ApiResult<ApiResponse<SensorRecord>> {
        self.enter("associate_to_crop", Some(sensor_id)).await?;
        let mut data = self.data();
        let sensor = data
            .sensors
            .iter_mut()
            .find(|s| s.id == sensor_id)
            .ok_or(ApiError::NotFound)?;
        sensor.crop_id = Some(crop_id);
        let record = sensor.clone();
        if let Some(t) = threshold {
            data.thresholds.insert(
                (crop_id, sensor_id),
                ThresholdRecord {
                    sensor_id,
                    sensor_type: record.sensor_type.clone(),
                    unit: record.unit.clone(),
                    min: Some(t.min),
                    max: Some(t.max),
                },
            );
        }
        Ok(ApiResponse::new(record))
    }

    async fn disassociate_from_crop(&self, crop_id: Id, sensor_id: Id) -> ApiResult<ApiResponse<SensorRecord>> {
        self.enter("disassociate_from_crop", Some(sensor_id)).await?;
        let mut data = self.data();
        data.thresholds.remove(&(crop_id, sensor_id));
        let sensor = data
            .sensors
            .iter_mut()
            .find(|s| s.id == sensor_id)
            .ok_or(ApiError::NotFound)?;
        sensor.crop_id = None;
        Ok(ApiResponse::new(sensor.clone()))
    }

    async fn create_reading(&self, new: &NewReading) -> ApiResult<ApiResponse<Reading>> {
        self.enter("create_reading", None).await?;
        let created = Reading {
            id: Some(self.next_id()),
            sensor_id: new.sensor_id,
            crop_id: Some(new.crop_id),
            value: new.value,
            timestamp: new.timestamp.unwrap_or_else(OffsetDateTime::now_utc),
            note: new.note.clone(),
            sensor_type: None,
            unit: None,
        };
        self.data().readings.push(created.clone());
        Ok(ApiResponse::new(created))
    }

    async fn create_readings_batch(&self, batch: &[NewReading]) -> ApiResult<ApiResponse<Vec<Reading>>> {
        self.enter("create_readings_batch", None).await?;
        let mut created = Vec::with_capacity(batch.len());
        for new in batch {
            created.push(Reading {
                id: Some(self.next_id()),
                sensor_id: new.sensor_id,
                crop_id: Some(new.crop_id),
                value: new.value,
                timestamp: new.timestamp.unwrap_or_else(OffsetDateTime::now_utc),
                note: new.note.clone(),
                sensor_type: None,
                unit: None,
            });
        }
        self.data().readings.extend(created.iter().cloned());
        Ok(ApiResponse::new(created))
    }

    async fn get_reading(&self, id: Id) -> ApiResult<ApiResponse<Reading>> {
        self.enter("get_reading", Some(id)).await?;
        found(self.data().readings.iter().find(|r| r.id == Some(id)).cloned())
    }

    async fn list_readings_by_crop(&self, crop_id: Id) -> ApiResult<ApiResponse<Vec<Reading>>> {
        self.enter("list_readings_by_crop", Some(crop_id)).await?;
        let readings = self
            .data()
            .readings
            .iter()
            .filter(|r| r.crop_id == Some(crop_id))
            .cloned()
            .collect();
        Ok(ApiResponse::new(readings))
    }

    /// Returns matching readings oldest-first, capped at `limit`.
    async fn reading_history(&self, query: &HistoryQuery) -> ApiResult<ApiResponse<Vec<Reading>>> {
        self.data().history_queries.push(query.clone());
        self.enter("history", Some(query.sensor_id)).await?;
        let mut rows: Vec<Reading> = self
            .data()
            .readings
            .iter()
            .filter(|r| {
                r.sensor_id == query.sensor_id
                    && r.crop_id == Some(query.crop_id)
                    && r.timestamp >= query.start
                    && r.timestamp <= query.end
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        rows.truncate(query.limit as usize);
        Ok(ApiResponse::new(rows))
    }

    async fn list_my_alerts(&self) -> ApiResult<ApiResponse<Vec<Alert>>> {
        self.enter("list_my_alerts", None).await?;
        Ok(ApiResponse::new(self.data().alerts.clone()))
    }

    async fn list_alerts_by_crop(&self, crop_id: Id) -> ApiResult<ApiResponse<Vec<Alert>>> {
        self.enter("list_alerts_by_crop", Some(crop_id)).await?;
        let alerts = self
            .data()
            .alerts
            .iter()
            .filter(|a| a.crop_id == Some(crop_id))
            .cloned()
            .collect();
        Ok(ApiResponse::new(alerts))
    }

    async fn get_alert(&self, id: Id) -> ApiResult<ApiResponse<Alert>> {
        self.enter("get_alert", Some(id)).await?;
        found(self.data().alerts.iter().find(|a| a.id == id).cloned())
    }

    async fn delete_alert(&self, id: Id) -> ApiResult<ApiResponse<()>> {
        self.enter("delete_alert", Some(id)).await?;
        let mut data = self.data();
        let before = data.alerts.len();
        data.alerts.retain(|a| a.id != id);
        if data.alerts.len() == before {
            return Err(ApiError::NotFound);
        }
        Ok(ApiResponse::with_message((), "Alerta resuelta"))
    }

    async fn thresholds_by_crop(&self, crop_id: Id) -> ApiResult<ApiResponse<Vec<ThresholdRecord>>> {
        self.enter("thresholds_by_crop", Some(crop_id)).await?;
        let records = self
            .data()
            .thresholds
            .iter()
            .filter(|((c, _), _)| *c == crop_id)
            .map(|(_, r)| r.clone())
            .collect();
        Ok(ApiResponse::new(records))
    }

    async fn threshold_for_sensor(&self, crop_id: Id, sensor_id: Id) -> ApiResult<ApiResponse<ThresholdRecord>> {
        self.enter("threshold_for_sensor", Some(sensor_id)).await?;
        found(self.data().thresholds.get(&(crop_id, sensor_id)).cloned())
    }

    async fn update_threshold(
        &self,
        crop_id: Id,
        sensor_id: Id,
        threshold: Threshold,
    ) -> ApiResult<ApiResponse<ThresholdRecord>> {
        self.enter("update_threshold", Some(sensor_id)).await?;
        let mut data = self.data();
        let sensor_type = data
            .sensors
            .iter()
            .find(|s| s.id == sensor_id)
            .map(|s| s.sensor_type.clone())
            .unwrap_or_default();
        let record = ThresholdRecord {
            sensor_id,
            sensor_type,
            unit: String::new(),
            min: Some(threshold.min),
            max: Some(threshold.max),
        };
        data.thresholds.insert((crop_id, sensor_id), record.clone());
        Ok(ApiResponse::new(record))
    }
}
