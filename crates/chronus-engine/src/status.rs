//! Engine status reporting: one-shot payloads and the status file.

use crate::supervisor::Supervisor;
use parking_lot::Mutex;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

/// Snapshot of the engine's health counters.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub active_slot: usize,
    pub delivered_frames: u64,
    pub underflows: u64,
    pub overflow: [u64; 2],
    pub dropped_commands: [u64; 2],
    pub failovers: u64,
    pub fatal_restarts: u64,
    pub last_respawn_ms: u64,
    pub record_dropped: u64,
    pub master_peak: f32,
    pub recording: Option<String>,
}

impl EngineStatus {
    pub fn gather(supervisor: &Supervisor, recording: Option<String>) -> Self {
        let counters = supervisor.counters();
        Self {
            active_slot: supervisor.active_idx().load(Ordering::Acquire) & 1,
            delivered_frames: counters.delivered_frames.load(Ordering::Relaxed),
            underflows: counters.underflows.load(Ordering::Relaxed),
            overflow: [supervisor.slot_overflow(0), supervisor.slot_overflow(1)],
            dropped_commands: [
                supervisor.slot_dropped_commands(0),
                supervisor.slot_dropped_commands(1),
            ],
            failovers: supervisor.failover_count(),
            fatal_restarts: supervisor.fatal_restart_count(),
            last_respawn_ms: supervisor.last_respawn_ms(),
            record_dropped: counters.record_dropped.load(Ordering::Relaxed),
            master_peak: counters.master_peak(),
            recording,
        }
    }

    /// Human-readable form used for the status file and the OSC reply.
    pub fn to_text(&self) -> String {
        let mut text = String::with_capacity(256);
        text.push_str(&format!("active_slot: {}\n", self.active_slot));
        text.push_str(&format!("delivered_frames: {}\n", self.delivered_frames));
        text.push_str(&format!("underflows: {}\n", self.underflows));
        text.push_str(&format!(
            "overflow: {} {}\n",
            self.overflow[0], self.overflow[1]
        ));
        text.push_str(&format!(
            "dropped_commands: {} {}\n",
            self.dropped_commands[0], self.dropped_commands[1]
        ));
        text.push_str(&format!("failovers: {}\n", self.failovers));
        text.push_str(&format!("fatal_restarts: {}\n", self.fatal_restarts));
        text.push_str(&format!("last_respawn_ms: {}\n", self.last_respawn_ms));
        text.push_str(&format!("record_dropped: {}\n", self.record_dropped));
        text.push_str(&format!("master_peak: {:.4}\n", self.master_peak));
        match &self.recording {
            Some(path) => text.push_str(&format!("recording: {path}\n")),
            None => text.push_str("recording: off\n"),
        }
        text
    }
}

/// Rate-limited writer for `engine_status.txt`.
pub struct StatusFile {
    path: PathBuf,
    last_write: Mutex<Option<Instant>>,
    min_interval: Duration,
}

impl StatusFile {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            last_write: Mutex::new(None),
            min_interval: Duration::from_millis(100),
        }
    }

    /// Write the status if the rate limit allows it.
    pub fn maybe_write(&self, status: &EngineStatus) {
        let mut last = self.last_write.lock();
        let due = last.map(|t| t.elapsed() >= self.min_interval).unwrap_or(true);
        if !due {
            return;
        }
        *last = Some(Instant::now());
        if let Err(e) = std::fs::write(&self.path, status.to_text()) {
            tracing::warn!(path = %self.path.display(), error = %e, "status write failed");
        }
    }
}
