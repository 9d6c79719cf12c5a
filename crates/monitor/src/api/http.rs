//! reqwest-backed [`Backend`] talking JSON to the crop platform API.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use tracing::debug;

use super::{decode, unwrap_envelope, ApiError, ApiResponse, ApiResult, Backend, HistoryQuery};
use crate::model::{
    Alert, Crop, CropUpdate, Id, NewCrop, NewReading, NewSensor, Reading, SensorRecord,
    SensorUpdate, Threshold, ThresholdRecord,
};

#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client.request(method, self.url(path))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> ApiResult<ApiResponse<T>> {
        decode(self.send(self.request(Method::GET, path)).await?)
    }

    async fn with_body<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> ApiResult<ApiResponse<T>> {
        decode(self.send(self.request(method, path).json(body)).await?)
    }

    /// For calls whose `data` is irrelevant (deletes).
    async fn without_data(&self, method: Method, path: &str) -> ApiResult<ApiResponse<()>> {
        let body = self.send(self.request(method, path)).await?;
        let (_, message) = unwrap_envelope(body);
        Ok(ApiResponse { data: (), message })
    }

    async fn send(&self, req: RequestBuilder) -> ApiResult<Value> {
        let res = req
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        let status = res.status();
        let bytes = res
            .bytes()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        debug!(status = status.as_u16(), len = bytes.len(), "backend response");

        if status == StatusCode::NOT_FOUND {
            return Err(ApiError::NotFound);
        }

        let body: Value = if bytes.is_empty() {
            Value::Null
        } else {
            match serde_json::from_slice(&bytes) {
                Ok(v) => v,
                Err(e) if status.is_success() => return Err(ApiError::Decode(e.to_string())),
                Err(_) => Value::String(String::from_utf8_lossy(&bytes).into_owned()),
            }
        };

        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                message: error_message(&body, status),
            });
        }

        Ok(body)
    }
}

/// Best human-readable message out of an error body.
fn error_message(body: &Value, status: StatusCode) -> String {
    let from_field = |key: &str| body.get(key).and_then(Value::as_str).map(str::to_string);
    from_field("message")
        .or_else(|| from_field("error"))
        .or_else(|| body.as_str().filter(|s| !s.trim().is_empty()).map(str::to_string))
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string())
}

fn rfc3339(ts: time::OffsetDateTime) -> ApiResult<String> {
    ts.format(&Rfc3339)
        .map_err(|e| ApiError::Decode(format!("invalid timestamp: {e}")))
}

#[async_trait]
impl Backend for HttpBackend {
    // ── Crops ───────────────────────────────────────────────────────

    async fn list_crops(&self) -> ApiResult<ApiResponse<Vec<Crop>>> {
        self.get("/crops").await
    }

    async fn get_crop(&self, id: Id) -> ApiResult<ApiResponse<Crop>> {
        self.get(&format!("/crops/{id}")).await
    }

    async fn create_crop(&self, data: &NewCrop) -> ApiResult<ApiResponse<Crop>> {
        self.with_body(Method::POST, "/crops", data).await
    }

    async fn update_crop(&self, id: Id, data: &CropUpdate) -> ApiResult<ApiResponse<Crop>> {
        self.with_body(Method::PUT, &format!("/crops/{id}"), data).await
    }

    async fn delete_crop(&self, id: Id) -> ApiResult<ApiResponse<()>> {
        self.without_data(Method::DELETE, &format!("/crops/{id}")).await
    }

    // ── Sensors ─────────────────────────────────────────────────────

    async fn list_sensors(&self) -> ApiResult<ApiResponse<Vec<SensorRecord>>> {
        self.get("/sensors").await
    }

    async fn list_my_sensors(&self) -> ApiResult<ApiResponse<Vec<SensorRecord>>> {
        self.get("/sensors/mine").await
    }

    async fn get_sensor(&self, id: Id) -> ApiResult<ApiResponse<SensorRecord>> {
        self.get(&format!("/sensors/{id}")).await
    }

    async fn list_sensors_by_crop(
        &self,
        crop_id: Id,
    ) -> ApiResult<ApiResponse<Vec<SensorRecord>>> {
        self.get(&format!("/crops/{crop_id}/sensors")).await
    }

    async fn create_sensor(&self, data: &NewSensor) -> ApiResult<ApiResponse<SensorRecord>> {
        self.with_body(Method::POST, "/sensors", data).await
    }

    async fn update_sensor(
        &self,
        id: Id,
        data: &SensorUpdate,
    ) -> ApiResult<ApiResponse<SensorRecord>> {
        self.with_body(Method::PUT, &format!("/sensors/{id}"), data).await
    }

    async fn delete_sensor(&self, id: Id) -> ApiResult<ApiResponse<()>> {
        self.without_data(Method::DELETE, &format!("/sensors/{id}")).await
    }

    async fn associate_to_crop(
        &self,
        crop_id: Id,
        sensor_id: Id,
        threshold: Option<Threshold>,
    ) -> ApiResult<ApiResponse<SensorRecord>> {
        let body = match threshold {
            Some(t) => json!({ "threshold_min": t.min, "threshold_max": t.max }),
            None => json!({}),
        };
        self.with_body(
            Method::POST,
            &format!("/crops/{crop_id}/sensors/{sensor_id}"),
            &body,
        )
        .await
    }

    async fn disassociate_from_crop(
        &self,
        crop_id: Id,
        sensor_id: Id,
    ) -> ApiResult<ApiResponse<SensorRecord>> {
        decode(
            self.send(self.request(
                Method::DELETE,
                &format!("/crops/{crop_id}/sensors/{sensor_id}"),
            ))
            .await?,
        )
    }

    // ── Readings ────────────────────────────────────────────────────

    async fn create_reading(&self, data: &NewReading) -> ApiResult<ApiResponse<Reading>> {
        self.with_body(Method::POST, "/readings", data).await
    }

    async fn create_readings_batch(
        &self,
        data: &[NewReading],
    ) -> ApiResult<ApiResponse<Vec<Reading>>> {
        self.with_body(Method::POST, "/readings/batch", &json!({ "readings": data }))
            .await
    }

    async fn get_reading(&self, id: Id) -> ApiResult<ApiResponse<Reading>> {
        self.get(&format!("/readings/{id}")).await
    }

    async fn list_readings_by_crop(&self, crop_id: Id) -> ApiResult<ApiResponse<Vec<Reading>>> {
        self.get(&format!("/crops/{crop_id}/readings")).await
    }

    async fn reading_history(&self, query: &HistoryQuery) -> ApiResult<ApiResponse<Vec<Reading>>> {
        let params = [
            ("crop_id", query.crop_id.to_string()),
            ("sensor_id", query.sensor_id.to_string()),
            ("start_date", rfc3339(query.start)?),
            ("end_date", rfc3339(query.end)?),
            ("limit", query.limit.to_string()),
        ];
        decode(
            self.send(self.request(Method::GET, "/readings/history").query(&params))
                .await?,
        )
    }

    // ── Alerts ──────────────────────────────────────────────────────

    async fn list_my_alerts(&self) -> ApiResult<ApiResponse<Vec<Alert>>> {
        self.get("/alerts/mine").await
    }

    async fn list_alerts_by_crop(&self, crop_id: Id) -> ApiResult<ApiResponse<Vec<Alert>>> {
        self.get(&format!("/crops/{crop_id}/alerts")).await
    }

    async fn get_alert(&self, id: Id) -> ApiResult<ApiResponse<Alert>> {
        self.get(&format!("/alerts/{id}")).await
    }

    async fn delete_alert(&self, id: Id) -> ApiResult<ApiResponse<()>> {
        self.without_data(Method::DELETE, &format!("/alerts/{id}")).await
    }

    // ── Thresholds ──────────────────────────────────────────────────

    async fn thresholds_by_crop(
        &self,
        crop_id: Id,
    ) -> ApiResult<ApiResponse<Vec<ThresholdRecord>>> {
        self.get(&format!("/crops/{crop_id}/thresholds")).await
    }

    async fn threshold_for_sensor(
        &self,
        crop_id: Id,
        sensor_id: Id,
    ) -> ApiResult<ApiResponse<ThresholdRecord>> {
        self.get(&format!("/crops/{crop_id}/sensors/{sensor_id}/thresholds"))
            .await
    }

    async fn update_threshold(
        &self,
        crop_id: Id,
        sensor_id: Id,
        threshold: Threshold,
    ) -> ApiResult<ApiResponse<ThresholdRecord>> {
        self.with_body(
            Method::PUT,
            &format!("/crops/{crop_id}/sensors/{sensor_id}/thresholds"),
            &json!({ "min": threshold.min, "max": threshold.max }),
        )
        .await
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::SENSOR_DELETED;
    use axum::extract::{Path, Query};
    use axum::http::StatusCode as AxumStatus;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::{Json, Router};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    /// Serve `router` on an ephemeral port and return a backend pointed at it.
    async fn backend_for(router: Router) -> HttpBackend {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        HttpBackend::new(&format!("http://{addr}/api/"), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn lists_crops_from_wrapped_body() {
        let router = Router::new().route(
            "/api/crops",
            get(|| async {
                Json(json!({"data": [{"id": 1, "name": "Lechuga", "status": "active"}], "message": "ok"}))
            }),
        );
        let backend = backend_for(router).await;

        let res = backend.list_crops().await.unwrap();
        assert_eq!(res.data.len(), 1);
        assert_eq!(res.data[0].name, "Lechuga");
        assert_eq!(res.message.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn maps_404_to_not_found_and_errors_to_status() {
        let router = Router::new()
            .route(
                "/api/sensors/{id}",
                get(|Path(id): Path<i64>| async move {
                    if id == 1 {
                        (AxumStatus::NOT_FOUND, "missing").into_response()
                    } else {
                        (
                            AxumStatus::INTERNAL_SERVER_ERROR,
                            Json(json!({"message": "base de datos caída"})),
                        )
                            .into_response()
                    }
                }),
            );
        let backend = backend_for(router).await;

        assert_eq!(backend.get_sensor(1).await.unwrap_err(), ApiError::NotFound);
        match backend.get_sensor(2).await.unwrap_err() {
            ApiError::Status { status, message } => {
                assert_eq!(status, 500);
                assert_eq!(message, "base de datos caída");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn history_sends_window_as_query_params() {
        let seen: Arc<Mutex<HashMap<String, String>>> = Arc::default();
        let captured = Arc::clone(&seen);
        let router = Router::new().route(
            "/api/readings/history",
            get(move |Query(q): Query<HashMap<String, String>>| {
                let captured = Arc::clone(&captured);
                async move {
                    let row = json!({"data": [{
                        "sensor_id": 7,
                        "crop_id": 1,
                        "value": "21.5",
                        "timestamp": q["end_date"],
                    }]});
                    *captured.lock().unwrap() = q;
                    Json(row)
                }
            }),
        );
        let backend = backend_for(router).await;

        let end = time::macros::datetime!(2024-05-01 12:00 UTC);
        let query = HistoryQuery {
            crop_id: 1,
            sensor_id: 7,
            start: end - time::Duration::hours(1),
            end,
            limit: 100,
        };
        let res = backend.reading_history(&query).await.unwrap();
        assert_eq!(res.data[0].timestamp, end);
        assert_eq!(res.data[0].value, 21.5);

        let params = seen.lock().unwrap().clone();
        assert_eq!(params.len(), 5, "{params:?}");
        assert_eq!(params["crop_id"], "1");
        assert_eq!(params["sensor_id"], "7");
        assert_eq!(params["start_date"], "2024-05-01T11:00:00Z");
        assert_eq!(params["end_date"], "2024-05-01T12:00:00Z");
        assert_eq!(params["limit"], "100");
    }

    #[tokio::test]
    async fn rows_with_repeated_fields_decode_whole_lists() {
        let router = Router::new()
            .route(
                "/api/crops/{id}/sensors",
                get(|| async {
                    Json(json!({"data": [
                        {"id": 1, "sensor_type": "temperatura", "type": "temperatura", "crop_id": 1, "cropId": 1},
                        {"id": 2, "sensorType": "humedad", "cropId": 1}
                    ]}))
                }),
            )
            .route(
                "/api/crops/{id}/thresholds",
                get(|| async {
                    Json(json!({"data": [
                        {"sensor_id": 1, "type": "temp", "min": "10", "threshold_min": "10", "max": "20", "threshold_max": "20"}
                    ]}))
                }),
            )
            .route(
                "/api/readings/history",
                get(|| async {
                    Json(json!({"data": [
                        {"sensor_id": 1, "sensorId": 1, "value": 21.0, "timestamp": "2024-05-01T10:00:00Z"}
                    ]}))
                }),
            );
        let backend = backend_for(router).await;

        let sensors = backend.list_sensors_by_crop(1).await.unwrap().data;
        assert_eq!(sensors.iter().map(|s| s.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(sensors[1].crop_id, Some(1));

        let thresholds = backend.thresholds_by_crop(1).await.unwrap().data;
        assert_eq!((thresholds[0].min, thresholds[0].max), (Some(10.0), Some(20.0)));

        let end = time::macros::datetime!(2024-05-01 12:00 UTC);
        let query = HistoryQuery {
            crop_id: 1,
            sensor_id: 1,
            start: end - time::Duration::hours(6),
            end,
            limit: 100,
        };
        let history = backend.reading_history(&query).await.unwrap().data;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].sensor_id, 1);
    }

    #[tokio::test]
    async fn disassociate_and_delete_tolerates_404_on_check() {
        let router = Router::new()
            .route(
                "/api/crops/{crop}/sensors/{sensor}",
                axum::routing::delete(|| async { Json(json!({"data": {"id": 5, "type": "temp"}})) }),
            )
            .route(
                "/api/sensors/{id}",
                axum::routing::delete(|| async { AxumStatus::NO_CONTENT })
                    .get(|| async { AxumStatus::NOT_FOUND }),
            );
        let backend = backend_for(router).await;

        let res = backend.disassociate_and_delete(1, 5).await.unwrap();
        assert_eq!(res.message.as_deref(), Some(SENSOR_DELETED));
    }

    #[test]
    fn error_message_prefers_message_field() {
        let status = StatusCode::BAD_REQUEST;
        assert_eq!(error_message(&json!({"message": "m", "error": "e"}), status), "m");
        assert_eq!(error_message(&json!({"error": "e"}), status), "e");
        assert_eq!(error_message(&json!("plain"), status), "plain");
        assert_eq!(error_message(&Value::Null, status), "Bad Request");
    }
}
