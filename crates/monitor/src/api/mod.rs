//! Backend boundary: one async method per logical operation of the crop
//! platform's HTTP API.
//!
//! Every call returns an [`ApiResponse`] (`data` plus optional `message`).
//! Response bodies come in several shapes; [`unwrap_envelope`] is the only
//! place that knows about them.

pub mod http;

#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;

use crate::model::{
    Alert, Crop, CropUpdate, Id, NewCrop, NewReading, NewSensor, Reading, SensorRecord,
    SensorUpdate, Threshold, ThresholdRecord,
};

/// Message reported when a sensor is detached and deleted.
pub const SENSOR_DELETED: &str = "Sensor eliminado correctamente.";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ApiError {
    #[error("recurso no encontrado")]
    NotFound,
    #[error("el servidor respondió {status}: {message}")]
    Status { status: u16, message: String },
    #[error("fallo de conexión: {0}")]
    Transport(String),
    #[error("respuesta inesperada: {0}")]
    Decode(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse<T> {
    pub data: T,
    pub message: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            message: None,
        }
    }

    pub fn with_message(data: T, message: impl Into<String>) -> Self {
        Self {
            data,
            message: Some(message.into()),
        }
    }
}

/// Bounds for the windowed history endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryQuery {
    pub crop_id: Id,
    pub sensor_id: Id,
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
    pub limit: u32,
}

#[async_trait]
pub trait Backend: Send + Sync {
    // ── Crops ───────────────────────────────────────────────────────
    async fn list_crops(&self) -> ApiResult<ApiResponse<Vec<Crop>>>;
    async fn get_crop(&self, id: Id) -> ApiResult<ApiResponse<Crop>>;
    async fn create_crop(&self, data: &NewCrop) -> ApiResult<ApiResponse<Crop>>;
    async fn update_crop(&self, id: Id, data: &CropUpdate) -> ApiResult<ApiResponse<Crop>>;
    async fn delete_crop(&self, id: Id) -> ApiResult<ApiResponse<()>>;

    // ── Sensors ─────────────────────────────────────────────────────
    async fn list_sensors(&self) -> ApiResult<ApiResponse<Vec<SensorRecord>>>;
    async fn list_my_sensors(&self) -> ApiResult<ApiResponse<Vec<SensorRecord>>>;
    async fn get_sensor(&self, id: Id) -> ApiResult<ApiResponse<SensorRecord>>;
    async fn list_sensors_by_crop(&self, crop_id: Id)
        -> ApiResult<ApiResponse<Vec<SensorRecord>>>;
    async fn create_sensor(&self, data: &NewSensor) -> ApiResult<ApiResponse<SensorRecord>>;
    async fn update_sensor(
        &self,
        id: Id,
        data: &SensorUpdate,
    ) -> ApiResult<ApiResponse<SensorRecord>>;
    async fn delete_sensor(&self, id: Id) -> ApiResult<ApiResponse<()>>;
    async fn associate_to_crop(
        &self,
        crop_id: Id,
        sensor_id: Id,
        threshold: Option<Threshold>,
    ) -> ApiResult<ApiResponse<SensorRecord>>;
    async fn disassociate_from_crop(
        &self,
        crop_id: Id,
        sensor_id: Id,
    ) -> ApiResult<ApiResponse<SensorRecord>>;

    /// Detach, delete, then confirm the sensor is gone.  A 404 from either
    /// the delete or the existence check counts as success.
    async fn disassociate_and_delete(&self, crop_id: Id, sensor_id: Id) -> ApiResult<ApiResponse<()>> {
        self.disassociate_from_crop(crop_id, sensor_id).await?;

        match self.delete_sensor(sensor_id).await {
            Ok(_) | Err(ApiError::NotFound) => {}
            Err(e) => return Err(e),
        }

        match self.get_sensor(sensor_id).await {
            Err(ApiError::NotFound) => Ok(ApiResponse::with_message((), SENSOR_DELETED)),
            Ok(_) => Err(ApiError::Status {
                status: 409,
                message: format!("el sensor {sensor_id} sigue existiendo tras eliminarlo"),
            }),
            Err(e) => Err(e),
        }
    }

    /// Create a sensor and attach it to a crop; returns the attached entity.
    async fn create_and_associate(
        &self,
        crop_id: Id,
        data: &NewSensor,
    ) -> ApiResult<ApiResponse<SensorRecord>> {
        let created = self.create_sensor(data).await?;
        self.associate_to_crop(crop_id, created.data.id, None).await
    }

    // ── Readings ────────────────────────────────────────────────────
    async fn create_reading(&self, data: &NewReading) -> ApiResult<ApiResponse<Reading>>;
    async fn create_readings_batch(
        &self,
        data: &[NewReading],
    ) -> ApiResult<ApiResponse<Vec<Reading>>>;
    async fn get_reading(&self, id: Id) -> ApiResult<ApiResponse<Reading>>;
    async fn list_readings_by_crop(&self, crop_id: Id) -> ApiResult<ApiResponse<Vec<Reading>>>;
    async fn reading_history(&self, query: &HistoryQuery) -> ApiResult<ApiResponse<Vec<Reading>>>;

    // ── Alerts ──────────────────────────────────────────────────────
    async fn list_my_alerts(&self) -> ApiResult<ApiResponse<Vec<Alert>>>;
    async fn list_alerts_by_crop(&self, crop_id: Id) -> ApiResult<ApiResponse<Vec<Alert>>>;
    async fn get_alert(&self, id: Id) -> ApiResult<ApiResponse<Alert>>;
    async fn delete_alert(&self, id: Id) -> ApiResult<ApiResponse<()>>;

    // ── Thresholds ──────────────────────────────────────────────────
    async fn thresholds_by_crop(&self, crop_id: Id)
        -> ApiResult<ApiResponse<Vec<ThresholdRecord>>>;
    async fn threshold_for_sensor(
        &self,
        crop_id: Id,
        sensor_id: Id,
    ) -> ApiResult<ApiResponse<ThresholdRecord>>;
    async fn update_threshold(
        &self,
        crop_id: Id,
        sensor_id: Id,
        threshold: Threshold,
    ) -> ApiResult<ApiResponse<ThresholdRecord>>;
}

// ---------------------------------------------------------------------------
// Envelope handling
// ---------------------------------------------------------------------------

/// Split a response body into `(data, message)`.
///
/// Accepted shapes: `{"data": X, "message": "..."}`, `{"data": {"data": X}}`
/// and a bare `X`.  A bare object's own `message` field is reported too.
pub fn unwrap_envelope(body: Value) -> (Value, Option<String>) {
    let Value::Object(mut outer) = body else {
        return (body, None);
    };

    let message = outer
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string);

    let Some(mut data) = outer.remove("data") else {
        return (Value::Object(outer), message);
    };

    // One level of double wrapping.
    if let Value::Object(inner) = &mut data {
        if let Some(nested) = inner.remove("data") {
            let inner_message = inner
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string);
            return (nested, message.or(inner_message));
        }
    }

    (data, message)
}

pub(crate) fn decode<T: serde::de::DeserializeOwned>(body: Value) -> ApiResult<ApiResponse<T>> {
    let (data, message) = unwrap_envelope(body);
    let data = serde_json::from_value(data).map_err(|e| ApiError::Decode(e.to_string()))?;
    Ok(ApiResponse { data, message })
}

// ===========================================================================
// Tests
// ===========================================================================
