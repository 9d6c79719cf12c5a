//! Domain types shared by the repositories, the threshold manager and the
//! polling coordinator.
//!
//! Backend rows spell the same field several ways (`sensor_type`, `type`,
//! `sensorType`) and sometimes carry two spellings at once.  Every entity
//! decodes through a private raw record with one `Option` per spelling; the
//! first present spelling wins.  Sensors go through [`SensorRecord`] so that
//! type normalization happens in exactly one place.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::OffsetDateTime;

use crate::normalize::{self, SensorKind};

pub type Id = i64;

/// Anything with a backend identity; used for local list bookkeeping.
pub trait Entity {
    fn id(&self) -> Id;
}

/// Replace the entity with the same id, or append it.
pub(crate) fn upsert<T: Entity>(items: &mut Vec<T>, item: T) {
    match items.iter_mut().find(|existing| existing.id() == item.id()) {
        Some(slot) => *slot = item,
        None => items.push(item),
    }
}

pub(crate) fn remove<T: Entity>(items: &mut Vec<T>, id: Id) {
    items.retain(|item| item.id() != id);
}

// ---------------------------------------------------------------------------
// Crops
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CropStatus {
    #[default]
    #[serde(alias = "activo")]
    Active,
    #[serde(alias = "pausado")]
    Paused,
    #[serde(alias = "alerta")]
    Alert,
    #[serde(alias = "completado")]
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "CropRecord")]
pub struct Crop {
    pub id: Id,
    pub name: String,
    pub crop_type: Option<String>,
    pub status: CropStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub end_date: Option<OffsetDateTime>,
}

#[derive(Deserialize)]
struct CropRecord {
    id: Id,
    #[serde(default)]
    name: String,
    #[serde(default)]
    crop_type: Option<String>,
    #[serde(default, rename = "cropType")]
    crop_type_camel: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    status: CropStatus,
    #[serde(default, with = "time::serde::rfc3339::option")]
    created_at: Option<OffsetDateTime>,
    #[serde(default, rename = "createdAt", with = "time::serde::rfc3339::option")]
    created_at_camel: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    start_date: Option<OffsetDateTime>,
    #[serde(default, rename = "startDate", with = "time::serde::rfc3339::option")]
    start_date_camel: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    end_date: Option<OffsetDateTime>,
    #[serde(default, rename = "endDate", with = "time::serde::rfc3339::option")]
    end_date_camel: Option<OffsetDateTime>,
}

impl From<CropRecord> for Crop {
    fn from(r: CropRecord) -> Self {
        Self {
            id: r.id,
            name: r.name,
            crop_type: r.crop_type.or(r.crop_type_camel).or(r.kind),
            status: r.status,
            created_at: r
                .created_at
                .or(r.created_at_camel)
                .or(r.start_date)
                .or(r.start_date_camel),
            end_date: r.end_date.or(r.end_date_camel),
        }
    }
}

impl Entity for Crop {
    fn id(&self) -> Id {
        self.id
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NewCrop {
    pub name: String,
    pub crop_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<CropStatus>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub start_date: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CropUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crop_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<CropStatus>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub end_date: Option<OffsetDateTime>,
}

// ---------------------------------------------------------------------------
// Sensors
// ---------------------------------------------------------------------------

/// Sensor as the backend sends it.  Never used past the repository layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawSensor")]
pub struct SensorRecord {
    pub id: Id,
    pub name: String,
    pub sensor_type: String,
    pub unit: String,
    pub crop_id: Option<Id>,
    pub active: bool,
    pub last_value: Option<f64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_seen: Option<OffsetDateTime>,
}

#[derive(Deserialize)]
struct RawSensor {
    id: Id,
    #[serde(default)]
    name: String,
    #[serde(default)]
    sensor_type: Option<String>,
    #[serde(default, rename = "sensorType")]
    sensor_type_camel: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    tipo: Option<String>,
    #[serde(default)]
    unit: Option<String>,
    #[serde(default)]
    unidad: Option<String>,
    #[serde(default)]
    crop_id: Option<Id>,
    #[serde(default, rename = "cropId")]
    crop_id_camel: Option<Id>,
    #[serde(default)]
    active: Option<bool>,
    #[serde(default)]
    is_active: Option<bool>,
    #[serde(default, rename = "isActive")]
    is_active_camel: Option<bool>,
    #[serde(default, deserialize_with = "lenient::option_number")]
    last_value: Option<f64>,
    #[serde(default, rename = "lastValue", deserialize_with = "lenient::option_number")]
    last_value_camel: Option<f64>,
    #[serde(default, deserialize_with = "lenient::option_number")]
    last_reading: Option<f64>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    last_seen: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    last_reading_at: Option<OffsetDateTime>,
    #[serde(default, rename = "lastReadingAt", with = "time::serde::rfc3339::option")]
    last_reading_at_camel: Option<OffsetDateTime>,
}

impl From<RawSensor> for SensorRecord {
    fn from(r: RawSensor) -> Self {
        Self {
            id: r.id,
            name: r.name,
            sensor_type: r
                .sensor_type
                .or(r.sensor_type_camel)
                .or(r.kind)
                .or(r.tipo)
                .unwrap_or_default(),
            unit: r.unit.or(r.unidad).unwrap_or_default(),
            crop_id: r.crop_id.or(r.crop_id_camel),
            active: r.active.or(r.is_active).or(r.is_active_camel).unwrap_or(true),
            last_value: r.last_value.or(r.last_value_camel).or(r.last_reading),
            last_seen: r
                .last_seen
                .or(r.last_reading_at)
                .or(r.last_reading_at_camel),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LastReading {
    pub value: f64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub at: Option<OffsetDateTime>,
}

/// Canonical sensor.  `kind` is `None` for types the normalizer does not
/// recognise; such sensors are listed but never aggregated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sensor {
    pub id: Id,
    pub name: String,
    pub kind: Option<SensorKind>,
    pub raw_type: String,
    pub unit: String,
    pub crop_id: Option<Id>,
    pub active: bool,
    pub last_reading: Option<LastReading>,
}

impl Sensor {
    /// Normalize a backend record.  `crop_id` back-fills the owning crop when
    /// the record omits it (crop-scoped listings do).
    pub fn from_record(record: SensorRecord, crop_id: Option<Id>) -> Self {
        let kind = normalize::classify(&record.sensor_type, &record.unit);
        let unit = normalize::display_unit_or(kind, &record.unit);
        Self {
            id: record.id,
            name: record.name,
            kind,
            raw_type: record.sensor_type,
            unit,
            crop_id: record.crop_id.or(crop_id),
            active: record.active,
            last_reading: record.last_value.map(|value| LastReading {
                value,
                at: record.last_seen,
            }),
        }
    }
}

impl Entity for Sensor {
    fn id(&self) -> Id {
        self.id
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NewSensor {
    pub name: String,
    pub sensor_type: String,
    pub unit: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crop_id: Option<Id>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SensorUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensor_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
}

// ---------------------------------------------------------------------------
// Readings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ReadingRecord")]
pub struct Reading {
    pub id: Option<Id>,
    pub sensor_id: Id,
    pub crop_id: Option<Id>,
    pub value: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub note: Option<String>,
    /// Present on some endpoints; used to rebuild sensors from readings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensor_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

#[derive(Deserialize)]
struct ReadingRecord {
    #[serde(default)]
    id: Option<Id>,
    #[serde(default)]
    sensor_id: Option<Id>,
    #[serde(default, rename = "sensorId")]
    sensor_id_camel: Option<Id>,
    #[serde(default)]
    crop_id: Option<Id>,
    #[serde(default, rename = "cropId")]
    crop_id_camel: Option<Id>,
    #[serde(deserialize_with = "lenient::number")]
    value: f64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    timestamp: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    created_at: Option<OffsetDateTime>,
    #[serde(default, rename = "createdAt", with = "time::serde::rfc3339::option")]
    created_at_camel: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    fecha: Option<OffsetDateTime>,
    #[serde(default)]
    note: Option<String>,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    nota: Option<String>,
    #[serde(default)]
    sensor_type: Option<String>,
    #[serde(default, rename = "sensorType")]
    sensor_type_camel: Option<String>,
    #[serde(default)]
    unit: Option<String>,
}

impl TryFrom<ReadingRecord> for Reading {
    type Error = String;

    fn try_from(r: ReadingRecord) -> Result<Self, Self::Error> {
        let sensor_id = r
            .sensor_id
            .or(r.sensor_id_camel)
            .ok_or_else(|| "reading has no sensor id".to_string())?;
        let timestamp = r
            .timestamp
            .or(r.created_at)
            .or(r.created_at_camel)
            .or(r.fecha)
            .ok_or_else(|| format!("reading for sensor {sensor_id} has no timestamp"))?;
        Ok(Self {
            id: r.id,
            sensor_id,
            crop_id: r.crop_id.or(r.crop_id_camel),
            value: r.value,
            timestamp,
            note: r.note.or(r.notes).or(r.nota),
            sensor_type: r.sensor_type.or(r.sensor_type_camel),
            unit: r.unit,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NewReading {
    pub sensor_id: Id,
    pub crop_id: Id,
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub timestamp: Option<OffsetDateTime>,
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    #[serde(alias = "critico", alias = "crítico")]
    Critical,
    #[serde(alias = "advertencia")]
    Warning,
    Info,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "AlertRecord")]
pub struct Alert {
    pub id: Id,
    pub crop_id: Option<Id>,
    pub sensor_type: String,
    pub level: AlertLevel,
    pub message: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub timestamp: Option<OffsetDateTime>,
    pub resolved: bool,
}

#[derive(Deserialize)]
struct AlertRecord {
    id: Id,
    #[serde(default)]
    crop_id: Option<Id>,
    #[serde(default, rename = "cropId")]
    crop_id_camel: Option<Id>,
    #[serde(default)]
    sensor_type: Option<String>,
    #[serde(default, rename = "sensorType")]
    sensor_type_camel: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    level: Option<AlertLevel>,
    #[serde(default)]
    severity: Option<AlertLevel>,
    #[serde(default)]
    nivel: Option<AlertLevel>,
    #[serde(default)]
    message: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    timestamp: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    created_at: Option<OffsetDateTime>,
    #[serde(default, rename = "createdAt", with = "time::serde::rfc3339::option")]
    created_at_camel: Option<OffsetDateTime>,
    #[serde(default)]
    resolved: bool,
}

impl TryFrom<AlertRecord> for Alert {
    type Error = String;

    fn try_from(r: AlertRecord) -> Result<Self, Self::Error> {
        let level = r
            .level
            .or(r.severity)
            .or(r.nivel)
            .ok_or_else(|| format!("alert {} has no level", r.id))?;
        Ok(Self {
            id: r.id,
            crop_id: r.crop_id.or(r.crop_id_camel),
            sensor_type: r
                .sensor_type
                .or(r.sensor_type_camel)
                .or(r.kind)
                .unwrap_or_default(),
            level,
            message: r.message,
            timestamp: r.timestamp.or(r.created_at).or(r.created_at_camel),
            resolved: r.resolved,
        })
    }
}

impl Entity for Alert {
    fn id(&self) -> Id {
        self.id
    }
}

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub min: f64,
    pub max: f64,
}

impl Threshold {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.min.is_finite() || !self.max.is_finite() {
            return Err("Los umbrales deben ser valores numéricos".to_string());
        }
        if self.min >= self.max {
            return Err(format!(
                "El mínimo ({}) debe ser menor que el máximo ({})",
                self.min, self.max
            ));
        }
        Ok(())
    }
}

pub type Thresholds = BTreeMap<SensorKind, Threshold>;

/// Values used until the backend supplies explicit ones.
pub fn default_thresholds() -> Thresholds {
    BTreeMap::from([
        (SensorKind::Temperature, Threshold::new(18.0, 26.0)),
        (SensorKind::Humidity, Threshold::new(60.0, 80.0)),
        (SensorKind::Ec, Threshold::new(800.0, 1500.0)),
    ])
}

/// One sensor/threshold pair as returned by the crop threshold endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawThreshold")]
pub struct ThresholdRecord {
    pub sensor_id: Id,
    pub sensor_type: String,
    pub unit: String,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

#[derive(Deserialize)]
struct RawThreshold {
    #[serde(default)]
    sensor_id: Option<Id>,
    #[serde(default, rename = "sensorId")]
    sensor_id_camel: Option<Id>,
    #[serde(default)]
    sensor_type: Option<String>,
    #[serde(default, rename = "sensorType")]
    sensor_type_camel: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    unit: String,
    #[serde(default, deserialize_with = "lenient::option_number")]
    min: Option<f64>,
    #[serde(default, deserialize_with = "lenient::option_number")]
    threshold_min: Option<f64>,
    #[serde(default, rename = "thresholdMin", deserialize_with = "lenient::option_number")]
    threshold_min_camel: Option<f64>,
    #[serde(default, deserialize_with = "lenient::option_number")]
    min_value: Option<f64>,
    #[serde(default, deserialize_with = "lenient::option_number")]
    max: Option<f64>,
    #[serde(default, deserialize_with = "lenient::option_number")]
    threshold_max: Option<f64>,
    #[serde(default, rename = "thresholdMax", deserialize_with = "lenient::option_number")]
    threshold_max_camel: Option<f64>,
    #[serde(default, deserialize_with = "lenient::option_number")]
    max_value: Option<f64>,
}

impl TryFrom<RawThreshold> for ThresholdRecord {
    type Error = String;

    fn try_from(r: RawThreshold) -> Result<Self, Self::Error> {
        let sensor_id = r
            .sensor_id
            .or(r.sensor_id_camel)
            .ok_or_else(|| "threshold has no sensor id".to_string())?;
        Ok(Self {
            sensor_id,
            sensor_type: r
                .sensor_type
                .or(r.sensor_type_camel)
                .or(r.kind)
                .unwrap_or_default(),
            unit: r.unit,
            min: r
                .min
                .or(r.threshold_min)
                .or(r.threshold_min_camel)
                .or(r.min_value),
            max: r
                .max
                .or(r.threshold_max)
                .or(r.threshold_max_camel)
                .or(r.max_value),
        })
    }
}

// ---------------------------------------------------------------------------
// Lenient numbers
// ---------------------------------------------------------------------------

/// Decimal columns sometimes arrive as JSON strings ("23.50").
pub(crate) mod lenient {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(f64),
        Text(String),
    }

    fn parse<E: Error>(raw: NumberOrString) -> Result<f64, E> {
        match raw {
            NumberOrString::Number(n) => Ok(n),
            NumberOrString::Text(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| E::custom(format!("not a number: {s:?}"))),
        }
    }

    pub fn number<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        parse(NumberOrString::deserialize(d)?)
    }

    pub fn option_number<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
        match Option::<NumberOrString>::deserialize(d)? {
            None => Ok(None),
            Some(NumberOrString::Text(s)) if s.trim().is_empty() => Ok(None),
            Some(raw) => parse(raw).map(Some),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
