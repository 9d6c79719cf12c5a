//! Canonical sensor vocabulary.
//!
//! The backend spells sensor types in many ways ("temp", "Sensor Temperatura",
//! "conductividad eléctrica", "tds", ...).  Everything past the repository
//! boundary only ever sees a [`SensorKind`].  Matching is substring based with
//! a fixed priority: temperature, then humidity, then conductivity.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    Temperature,
    Humidity,
    Ec,
}

impl SensorKind {
    pub const ALL: [SensorKind; 3] = [SensorKind::Temperature, SensorKind::Humidity, SensorKind::Ec];

    pub fn as_str(self) -> &'static str {
        match self {
            SensorKind::Temperature => "temperature",
            SensorKind::Humidity => "humidity",
            SensorKind::Ec => "ec",
        }
    }

    /// Fixed unit used for display, regardless of what the backend sent.
    pub fn display_unit(self) -> &'static str {
        match self {
            SensorKind::Temperature => "°C",
            SensorKind::Humidity => "%",
            SensorKind::Ec => "PPM",
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Matching tables (order matters: first match wins)
// ---------------------------------------------------------------------------

const TEMPERATURE_MARKERS: &[&str] = &["temp"];
const HUMIDITY_MARKERS: &[&str] = &["hum"];
const EC_MARKERS: &[&str] = &["ec", "tds", "cond"];

const UNIT_TABLE: &[(&str, SensorKind)] = &[
    ("°c", SensorKind::Temperature),
    ("ºc", SensorKind::Temperature),
    ("celsius", SensorKind::Temperature),
    ("%", SensorKind::Humidity),
    ("ppm", SensorKind::Ec),
    ("µs/cm", SensorKind::Ec),
    ("us/cm", SensorKind::Ec),
    ("ms/cm", SensorKind::Ec),
];

/// Map a backend sensor-type string to its canonical kind.
///
/// Case-insensitive.  Returns `None` for anything unrecognised (e.g. "pH").
/// Idempotent: `normalize_type(k.as_str()) == Some(k)` for every kind.
pub fn normalize_type(raw: &str) -> Option<SensorKind> {
    let s = raw.trim().to_lowercase();
    if s.is_empty() {
        return None;
    }

    let contains_any = |markers: &[&str]| markers.iter().any(|m| s.contains(m));

    if contains_any(TEMPERATURE_MARKERS) {
        Some(SensorKind::Temperature)
    } else if contains_any(HUMIDITY_MARKERS) {
        Some(SensorKind::Humidity)
    } else if contains_any(EC_MARKERS) {
        Some(SensorKind::Ec)
    } else {
        None
    }
}

/// Map a unit string to a kind.  Only exact (trimmed, case-insensitive)
/// matches count; units are too short for substring matching.
pub fn normalize_unit(raw: &str) -> Option<SensorKind> {
    let s = raw.trim().to_lowercase();
    UNIT_TABLE
        .iter()
        .find(|(unit, _)| *unit == s)
        .map(|(_, kind)| *kind)
}

/// Classify using the type string first and the unit as a fallback.
pub fn classify(raw_type: &str, unit: &str) -> Option<SensorKind> {
    normalize_type(raw_type).or_else(|| normalize_unit(unit))
}

/// Display unit for a possibly-unknown kind, falling back to whatever the
/// backend reported.
pub fn display_unit_or(kind: Option<SensorKind>, reported: &str) -> String {
    match kind {
        Some(k) => k.display_unit().to_string(),
        None => reported.trim().to_string(),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
