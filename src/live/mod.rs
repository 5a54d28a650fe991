pub mod cache;
pub mod client;
pub mod delay;
pub mod normalizer;
pub mod poller;
pub mod reconciler;
pub mod transport;
pub mod types;

use std::time::{SystemTime, UNIX_EPOCH};

pub use client::LiveClient;

/// Wall-clock acceptance time for incoming updates.
pub fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}
