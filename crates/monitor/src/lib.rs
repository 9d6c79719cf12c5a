//! Live monitoring layer for a hydroponic crop platform.
//!
//! The crate polls a crop platform's HTTP API for sensor history, derives
//! per-sensor trends, keeps per-crop alert thresholds and exposes all of it
//! through one facade, [`Monitor`].

pub mod api;
pub mod config;
pub mod facade;
pub mod model;
pub mod normalize;
pub mod poller;
pub mod repo;
pub mod state;
pub mod thresholds;
pub mod trend;
pub mod web;

pub use facade::{Monitor, MonitorView, StatusResponse};
pub use normalize::SensorKind;
pub use poller::{FetchOutcome, PollSettings, TimeRange};
