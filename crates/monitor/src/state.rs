use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::model::{Crop, Id};
use crate::poller::{RealTimeSnapshot, TimeRange};

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<MonitorState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// State shared by the polling coordinator, the threshold manager and the
/// facade.  Lives exactly as long as the [`Monitor`](crate::Monitor).
pub struct MonitorState {
    pub started_at: Instant,
    pub selected_crop: Option<Crop>,
    pub time_range: TimeRange,
    pub real_time_data: BTreeMap<Id, RealTimeSnapshot>,
    pub real_time_error: Option<String>,
    pub last_cycle_at: Option<OffsetDateTime>,
    pub events: VecDeque<MonitorEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Poll,
    Selection,
    Threshold,
    Alert,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl MonitorState {
    pub fn new(time_range: TimeRange) -> Self {
        Self {
            started_at: Instant::now(),
            selected_crop: None,
            time_range,
            real_time_data: BTreeMap::new(),
            real_time_error: None,
            last_cycle_at: None,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared(time_range: TimeRange) -> SharedState {
        Arc::new(RwLock::new(Self::new(time_range)))
    }

    pub fn selected_crop_id(&self) -> Option<Id> {
        self.selected_crop.as_ref().map(|c| c.id)
    }

    /// Replace the selection.  Returns `false` when the crop id did not
    /// change; otherwise the live snapshot is cleared.
    pub fn select_crop(&mut self, crop: Option<Crop>) -> bool {
        let changed = self.selected_crop_id() != crop.as_ref().map(|c| c.id);
        let detail = match &crop {
            Some(c) => format!("crop {} ({}) selected", c.id, c.name),
            None => "selection cleared".to_string(),
        };
        self.selected_crop = crop;
        if changed {
            // The old crop's snapshot must not show under the new one.
            self.real_time_data.clear();
            self.real_time_error = None;
            self.push_event(EventKind::Selection, detail);
        }
        changed
    }

    /// Install the snapshot of one completed poll cycle, replacing the
    /// previous one as a whole.
    pub fn install_snapshot(&mut self, crop_id: Id, data: BTreeMap<Id, RealTimeSnapshot>) {
        let detail = format!(
            "crop {crop_id}: {} sensor(s) [{}]",
            data.len(),
            data.keys().map(Id::to_string).collect::<Vec<_>>().join(", ")
        );
        self.real_time_data = data;
        self.real_time_error = None;
        self.last_cycle_at = Some(OffsetDateTime::now_utc());
        self.push_event(EventKind::Poll, detail);
    }

    /// Record a failed poll cycle.  The previous snapshot stays in place.
    pub fn record_poll_error(&mut self, message: String) {
        self.real_time_error = Some(message.clone());
        self.push_event(EventKind::Error, message);
    }

    pub fn record_threshold(&mut self, detail: String) {
        self.push_event(EventKind::Threshold, detail);
    }

    pub fn record_alert(&mut self, detail: String) {
        self.push_event(EventKind::Alert, detail);
    }

    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Events newest first.
    pub fn recent_events(&self) -> Vec<MonitorEvent> {
        self.events.iter().rev().cloned().collect()
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(MonitorEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
