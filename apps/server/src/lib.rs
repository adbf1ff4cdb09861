//! Quire - durable background job queue
//!
//! - Job store backed by a Postgres `jobs` table (queue-of-record)
//! - LISTEN/NOTIFY wake-ups with sweep and reaper fallbacks
//! - Worker with atomic claims, retry backoff, and panic capture
//! - Optional Redis broker with enqueue fallback to the job store
//! - HTTP API for producers and status polling

#![allow(
    clippy::large_enum_variant,      // Job snapshots inside outcome enums are fine
)]

pub mod api;
pub mod background;
pub mod broker;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod queue;
pub mod state;
pub mod workers;

pub use config::Config;
pub use error::{Error, Result};
pub use state::AppState;
