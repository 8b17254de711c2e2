//! Per-slot shared state between a worker thread and the supervisor.

use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Number of voice peak meters published per slot.
pub const VOICE_METERS: usize = 4;

/// Lock-free cells a worker publishes and the supervisor observes.
///
/// The heartbeat is the liveness signal: the monitor declares a worker hung
/// when the counter fails to advance across consecutive scans. Everything
/// else is telemetry or the commit handshake.
pub struct SlotShared {
    /// Bumped once per worker tick.
    pub heartbeat: CachePadded<AtomicU64>,
    /// Raised by the worker once a committed graph has warmed up.
    pub prime_ready: AtomicBool,
    /// Frames dropped because the slot's audio ring was full.
    pub overflow: CachePadded<AtomicU64>,
    /// Commands dropped for out-of-range module or parameter indices.
    pub dropped_commands: AtomicU64,
    /// Per-voice output peaks of the last tick, stored as f32 bits.
    pub voice_peaks: [AtomicU32; VOICE_METERS],
}

impl SlotShared {
    pub fn new() -> Self {
        Self {
            heartbeat: CachePadded::new(AtomicU64::new(0)),
            prime_ready: AtomicBool::new(false),
            overflow: CachePadded::new(AtomicU64::new(0)),
            dropped_commands: AtomicU64::new(0),
            voice_peaks: Default::default(),
        }
    }

    /// Store one voice peak (worker side).
    #[inline]
    pub fn set_voice_peak(&self, voice: usize, peak: f32) {
        if let Some(cell) = self.voice_peaks.get(voice) {
            cell.store(peak.to_bits(), Ordering::Relaxed);
        }
    }

    /// Load all voice peaks (broadcast side).
    pub fn load_voice_peaks(&self) -> [f32; VOICE_METERS] {
        let mut peaks = [0.0; VOICE_METERS];
        for (out, cell) in peaks.iter_mut().zip(&self.voice_peaks) {
            *out = f32::from_bits(cell.load(Ordering::Relaxed));
        }
        peaks
    }
}

impl Default for SlotShared {
    fn default() -> Self {
        Self::new()
    }
}
