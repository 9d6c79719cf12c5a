//! Resource repositories: one per backend resource, each holding its own
//! list, error slot and in-flight guards.
//!
//! Repositories never let an [`ApiError`] escape.  A failed call stores a
//! human-readable message in the repository's `error` and leaves the local
//! list untouched; successful writes mirror the entity the server returned.

pub mod alerts;
pub mod crops;
pub mod readings;
pub mod sensors;

pub use alerts::AlertRepository;
pub use crops::CropRepository;
pub use readings::ReadingRepository;
pub use sensors::SensorRepository;

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::warn;

use crate::api::ApiError;

// ---------------------------------------------------------------------------
// In-flight guard
// ---------------------------------------------------------------------------

/// Rejects a second call of the same query kind while one is outstanding.
#[derive(Debug, Default)]
pub struct InFlight {
    busy: AtomicBool,
}

impl InFlight {
    /// `None` when a call is already in flight.  The flag clears when the
    /// returned guard drops, including on early return or cancellation.
    pub fn try_begin(&self) -> Option<InFlightGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlightGuard(&self.busy))
    }

    pub fn is_active(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

pub struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Activity counter
// ---------------------------------------------------------------------------

/// Counts outstanding writes; writes are never deduplicated.
#[derive(Debug, Default)]
pub struct Activity {
    pending: AtomicUsize,
}

impl Activity {
    pub fn begin(&self) -> ActivityGuard<'_> {
        self.pending.fetch_add(1, Ordering::AcqRel);
        ActivityGuard(&self.pending)
    }

    pub fn is_active(&self) -> bool {
        self.pending.load(Ordering::Acquire) > 0
    }
}

pub struct ActivityGuard<'a>(&'a AtomicUsize);

impl Drop for ActivityGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

// ---------------------------------------------------------------------------
// Outcomes and messages
// ---------------------------------------------------------------------------

/// Result of a delete-style action that has no entity to return.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outcome {
    pub success: bool,
    pub message: Option<String>,
}

impl Outcome {
    pub fn ok(message: Option<String>) -> Self {
        Self {
            success: true,
            message,
        }
    }

    pub fn failed(message: String) -> Self {
        Self {
            success: false,
            message: Some(message),
        }
    }
}

/// User-facing message for a failed action, logged on the way out.
pub(crate) fn describe(resource: &'static str, action: &str, err: &ApiError) -> String {
    warn!(resource, action, error = %err, "backend call failed");
    format!("Error al {action}: {err}")
}

// ===========================================================================
// Tests
// ===========================================================================
