//! Virtual-channel engine: a looping playlist whose "now playing" position is
//! computed from a shared reference point, so any number of stateless
//! instances (and every viewer) agree on what is on air.

pub mod api;
pub mod config;
pub mod content;
pub mod coordinator;
pub mod error;
pub mod playlist;
pub mod probe;
pub mod reconciler;
pub mod scheduler;
pub mod store;

pub use api::{build_router, AppState};

/// Wall clock in epoch milliseconds.
pub fn unix_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
