//! Per-crop alert thresholds, one `(min, max)` pair per sensor kind.
//!
//! State starts from [`default_thresholds`] and is only ever replaced when a
//! load actually changes a value, so `revision` counts real changes.  Values
//! belong to one crop: loading a different crop starts again from the
//! defaults instead of the previous crop's values.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::api::Backend;
use crate::model::{default_thresholds, Id, Threshold, ThresholdRecord, Thresholds};
use crate::normalize::{classify, SensorKind};
use crate::repo::{describe, Activity, InFlight, SensorRepository};
use crate::state::SharedState;

struct ThresholdState {
    /// Crop the values belong to; `None` until the first load or update.
    crop_id: Option<Id>,
    thresholds: Thresholds,
    error: Option<String>,
    revision: u64,
}

/// Result of a bulk update.  Successful updates are never rolled back.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BulkReport {
    pub updated: Vec<Id>,
    pub failed: Vec<(Id, String)>,
}

impl BulkReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct ThresholdManager {
    backend: Arc<dyn Backend>,
    sensors: Arc<SensorRepository>,
    shared: SharedState,
    state: RwLock<ThresholdState>,
    load_guard: InFlight,
    writes: Activity,
}

impl ThresholdManager {
    pub fn new(backend: Arc<dyn Backend>, sensors: Arc<SensorRepository>, shared: SharedState) -> Self {
        Self {
            backend,
            sensors,
            shared,
            state: RwLock::new(ThresholdState {
                crop_id: None,
                thresholds: default_thresholds(),
                error: None,
                revision: 0,
            }),
            load_guard: InFlight::default(),
            writes: Activity::default(),
        }
    }

    pub async fn thresholds(&self) -> Thresholds {
        self.state.read().await.thresholds.clone()
    }

    #[cfg(test)]
    async fn get(&self, kind: SensorKind) -> Option<Threshold> {
        self.state.read().await.thresholds.get(&kind).copied()
    }

    pub async fn error(&self) -> Option<String> {
        self.state.read().await.error.clone()
    }

    /// Bumped once per state change.
    pub async fn revision(&self) -> u64 {
        self.state.read().await.revision
    }

    pub fn is_loading(&self) -> bool {
        self.load_guard.is_active() || self.writes.is_active()
    }

    async fn fail(&self, message: String) {
        self.state.write().await.error = Some(message);
    }

    /// Merge the crop's stored thresholds into state.  Returns `true` only
    /// when at least one value changed.  Dropped while another load runs.
    pub async fn load_thresholds(&self, crop_id: Id) -> bool {
        let Some(_guard) = self.load_guard.try_begin() else {
            debug!(crop = crop_id, "threshold load already in flight");
            return false;
        };
        self.reload(crop_id).await
    }

    /// Unguarded load.  The previous values are the merge base only when
    /// they belong to the same crop.
    async fn reload(&self, crop_id: Id) -> bool {
        let fetched = self.backend.thresholds_by_crop(crop_id).await;

        let mut st = self.state.write().await;
        let base = if st.crop_id == Some(crop_id) {
            st.thresholds.clone()
        } else {
            default_thresholds()
        };
        st.crop_id = Some(crop_id);
        let merged = match fetched {
            Ok(res) => {
                st.error = None;
                merge(&base, &res.data)
            }
            Err(e) => {
                st.error = Some(describe(
                    "thresholds",
                    &format!("cargar los umbrales del cultivo {crop_id}"),
                    &e,
                ));
                base
            }
        };
        if merged == st.thresholds {
            debug!(crop = crop_id, "thresholds unchanged");
            return false;
        }
        st.thresholds = merged;
        st.revision += 1;
        let revision = st.revision;
        let failed = st.error.is_some();
        drop(st);

        if failed {
            warn!(crop = crop_id, revision, "thresholds reset to defaults");
            return true;
        }

        info!(crop = crop_id, revision, "thresholds loaded");
        self.shared
            .write()
            .await
            .record_threshold(format!("crop {crop_id}: thresholds loaded (rev {revision})"));
        true
    }

    /// Push one sensor's threshold, mirroring it locally on success when the
    /// local values belong to the same crop.  An invalid pair is rejected
    /// before any request is sent.
    pub async fn update_threshold(
        &self,
        crop_id: Id,
        sensor_id: Id,
        kind: SensorKind,
        threshold: Threshold,
    ) -> bool {
        if let Err(message) = threshold.validate() {
            warn!(crop = crop_id, sensor = sensor_id, %message, "threshold rejected");
            self.fail(message).await;
            return false;
        }
        let _busy = self.writes.begin();
        match self.backend.update_threshold(crop_id, sensor_id, threshold).await {
            Ok(_) => {
                {
                    let mut st = self.state.write().await;
                    st.error = None;
                    if st.crop_id.is_none() {
                        st.crop_id = Some(crop_id);
                    }
                    if st.crop_id == Some(crop_id)
                        && st.thresholds.insert(kind, threshold) != Some(threshold)
                    {
                        st.revision += 1;
                    }
                }
                info!(crop = crop_id, sensor = sensor_id, kind = kind.as_str(), "threshold updated");
                self.shared.write().await.record_threshold(format!(
                    "crop {crop_id}: {kind} set to {}..{} via sensor {sensor_id}",
                    threshold.min, threshold.max
                ));
                true
            }
            Err(e) => {
                self.fail(describe(
                    "thresholds",
                    &format!("actualizar el umbral del sensor {sensor_id}"),
                    &e,
                ))
                .await;
                false
            }
        }
    }

    /// Apply `wanted` to every sensor of the crop whose kind has an entry,
    /// one request at a time, then reload from the backend.  A failing
    /// sensor does not stop the others and nothing is rolled back.
    pub async fn update_all_thresholds(&self, crop_id: Id, wanted: &Thresholds) -> BulkReport {
        let mut report = BulkReport::default();
        for threshold in wanted.values() {
            if let Err(message) = threshold.validate() {
                self.fail(message).await;
                return report;
            }
        }

        let _busy = self.writes.begin();
        let sensors = match self.sensors.fetch_crop_sensors(crop_id).await {
            Ok(sensors) => sensors,
            Err(e) => {
                self.fail(describe(
                    "thresholds",
                    &format!("obtener los sensores del cultivo {crop_id}"),
                    &e,
                ))
                .await;
                return report;
            }
        };

        for sensor in &sensors {
            let Some(threshold) = sensor.kind.and_then(|k| wanted.get(&k)).copied() else {
                continue;
            };
            match self.backend.update_threshold(crop_id, sensor.id, threshold).await {
                Ok(_) => report.updated.push(sensor.id),
                Err(e) => {
                    let message = describe(
                        "thresholds",
                        &format!("actualizar el umbral del sensor {}", sensor.id),
                        &e,
                    );
                    report.failed.push((sensor.id, message));
                }
            }
        }

        self.reload(crop_id).await;

        if report.is_complete() {
            self.state.write().await.error = None;
        } else {
            let detail = report
                .failed
                .iter()
                .map(|(id, msg)| format!("sensor {id}: {msg}"))
                .collect::<Vec<_>>()
                .join("; ");
            self.fail(format!(
                "Error al actualizar {} de {} umbrales: {detail}",
                report.failed.len(),
                report.failed.len() + report.updated.len()
            ))
            .await;
        }
        info!(
            crop = crop_id,
            updated = report.updated.len(),
            failed = report.failed.len(),
            "bulk threshold update finished"
        );
        self.shared.write().await.record_threshold(format!(
            "crop {crop_id}: bulk update, {} ok, {} failed",
            report.updated.len(),
            report.failed.len()
        ));
        report
    }

    /// Stored threshold of a single sensor, without touching state.
    pub async fn sensor_threshold(&self, crop_id: Id, sensor_id: Id) -> Option<Threshold> {
        match self.backend.threshold_for_sensor(crop_id, sensor_id).await {
            Ok(res) => pair(&res.data),
            Err(e) => {
                describe(
                    "thresholds",
                    &format!("obtener el umbral del sensor {sensor_id}"),
                    &e,
                );
                None
            }
        }
    }
}

fn pair(record: &ThresholdRecord) -> Option<Threshold> {
    let t = Threshold::new(record.min?, record.max?);
    t.validate().ok().map(|_| t)
}

/// `current` with every usable record laid over it.  Records of unknown
/// kinds or with missing or inverted bounds are skipped.
fn merge(current: &Thresholds, records: &[ThresholdRecord]) -> Thresholds {
    let mut merged = current.clone();
    for record in records {
        let Some(kind) = classify(&record.sensor_type, &record.unit) else {
            continue;
        };
        if let Some(t) = pair(record) {
            merged.insert(kind, t);
        }
    }
    merged
}

// ===========================================================================
// Tests
// ===========================================================================
