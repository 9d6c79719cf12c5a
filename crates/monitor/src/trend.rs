//! Trend derivation over a sensor's reading history.

use serde::Serialize;

use crate::model::Reading;

pub const STABLE_LABEL: &str = "Estable";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Stable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trend {
    pub direction: Direction,
    /// `newest - oldest`; zero when stable or under two samples.
    pub magnitude: f64,
    /// Signed magnitude with one decimal, or [`STABLE_LABEL`].
    pub label: String,
    /// Elapsed time between the oldest and newest sample.
    pub window: String,
}

impl Trend {
    fn stable(window: String) -> Self {
        Self {
            direction: Direction::Stable,
            magnitude: 0.0,
            label: STABLE_LABEL.to_string(),
            window,
        }
    }
}

/// Compute the trend of `readings`, which must be sorted newest first.
pub fn compute(readings: &[Reading]) -> Trend {
    let (Some(newest), Some(oldest)) = (readings.first(), readings.last()) else {
        return Trend::stable(window_label(0.0));
    };
    let hours = (newest.timestamp - oldest.timestamp).as_seconds_f64().abs() / 3600.0;
    let window = window_label(hours);
    if readings.len() < 2 {
        return Trend::stable(window);
    }

    let diff = newest.value - oldest.value;
    let direction = if diff > 0.0 {
        Direction::Up
    } else if diff < 0.0 {
        Direction::Down
    } else {
        Direction::Stable
    };

    match direction {
        Direction::Stable => Trend::stable(window),
        _ => Trend {
            direction,
            magnitude: diff,
            label: format!("{diff:+.1}"),
            window,
        },
    }
}

fn window_label(hours: f64) -> String {
    let rounded = hours.round() as i64;
    if hours < 1.0 || rounded <= 1 {
        "última hora".to_string()
    } else {
        format!("últimas {rounded} horas")
    }
}

// ===========================================================================
// Tests
// ===========================================================================
