use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Running client loop. Cancelling the token stops every timer the loop owns.
pub struct SessionHandle {
    pub cancellation_token: CancellationToken,
    pub join_handle: JoinHandle<()>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClientStats {
    pub uptime_ms: u128,
    pub frames_applied: u64,
    pub frames_dropped: u64,
    pub heartbeats: u64,
    pub duplicates: u64,
    pub poll_starts: u64,
    pub poll_stops: u64,
    pub last_frame_at_ms: Option<i64>,
}

#[derive(Default)]
pub struct ClientCounters {
    frames_applied: AtomicU64,
    frames_dropped: AtomicU64,
    heartbeats: AtomicU64,
    duplicates: AtomicU64,
    poll_starts: AtomicU64,
    poll_stops: AtomicU64,
    last_frame_at_ms: AtomicI64,
}

impl ClientCounters {
    pub fn record_applied(&self, accepted_at_ms: i64) {
        self.frames_applied.fetch_add(1, Ordering::Relaxed);
        self.last_frame_at_ms
            .store(accepted_at_ms, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_heartbeat(&self) {
        self.heartbeats.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_poll_start(&self) {
        self.poll_starts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_poll_stop(&self) {
        self.poll_stops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, started_at: Instant) -> ClientStats {
        let last_frame_at_ms = self.last_frame_at_ms.load(Ordering::Relaxed);
        ClientStats {
            uptime_ms: started_at.elapsed().as_millis(),
            frames_applied: self.frames_applied.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            heartbeats: self.heartbeats.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            poll_starts: self.poll_starts.load(Ordering::Relaxed),
            poll_stops: self.poll_stops.load(Ordering::Relaxed),
            last_frame_at_ms: (last_frame_at_ms > 0).then_some(last_frame_at_ms),
        }
    }
}
