//! Liveness monitor: sentinel and heartbeat checks, failover triggering,
//! underflow alerting, and status file updates.

use crate::status::{EngineStatus, StatusFile};
use crate::supervisor::Supervisor;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Consecutive stale heartbeat scans before a worker is declared hung.
const STALE_SCANS: u32 = 3;

/// Minimum spacing between respawn attempts for one slot.
const RESPAWN_RETRY: Duration = Duration::from_millis(100);

/// Underflow alert threshold: fraction of frames over the alert window.
const UNDERFLOW_ALERT_RATIO: f64 = 0.005;

/// Frames per underflow alert window.
const UNDERFLOW_WINDOW: u64 = 1000;

pub struct MonitorHandle {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Spawn the monitor thread.
pub fn spawn(
    supervisor: Arc<Supervisor>,
    status_file: Option<Arc<StatusFile>>,
) -> std::io::Result<MonitorHandle> {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);
    let join = std::thread::Builder::new()
        .name("chronus-monitor".into())
        .spawn(move || run(supervisor, status_file, stop_flag))?;
    Ok(MonitorHandle {
        stop,
        join: Some(join),
    })
}

fn run(supervisor: Arc<Supervisor>, status_file: Option<Arc<StatusFile>>, stop: Arc<AtomicBool>) {
    let cfg = supervisor.config().clone();
    let period = Duration::from_millis(cfg.supervisor.heartbeat_period_ms);
    // A worker only beats once per buffer; with large buffers that is
    // slower than the scan, so the hung threshold covers at least two
    // buffer periods regardless of the scan rate.
    let buffer_scans =
        (2.0 * cfg.buffer_period().as_secs_f64() / period.as_secs_f64()).ceil() as u32;
    let stale_limit = STALE_SCANS.max(buffer_scans);

    let mut last_heartbeat = [0u64; 2];
    let mut stale = [0u32; 2];
    let mut last_attempt: [Option<Instant>; 2] = [None, None];

    let counters = supervisor.counters();
    let mut window_frames = counters.delivered_frames.load(Ordering::Relaxed);
    let mut window_underflows = counters.underflows.load(Ordering::Relaxed);

    tracing::debug!(stale_limit, "monitor started");

    while !stop.load(Ordering::Acquire) {
        std::thread::sleep(period);

        let mut dead = [false; 2];
        for idx in 0..2 {
            let (heartbeat, finished) = supervisor.slot_liveness(idx);
            if finished {
                // Sentinel: the thread itself is gone.
                dead[idx] = true;
            } else if heartbeat == last_heartbeat[idx] {
                stale[idx] += 1;
                if stale[idx] >= stale_limit {
                    dead[idx] = true;
                }
            } else {
                stale[idx] = 0;
            }
            last_heartbeat[idx] = heartbeat;
        }

        if dead[0] && dead[1] {
            if attempt_due(&mut last_attempt, 0) {
                last_attempt[1] = last_attempt[0];
                supervisor.fatal_restart();
                stale = [0; 2];
            }
        } else {
            for idx in 0..2 {
                if dead[idx] && attempt_due(&mut last_attempt, idx) {
                    supervisor.failover(idx);
                    stale[idx] = 0;
                }
            }
        }

        // Underflow alert over a sliding window of delivered frames.
        let frames = counters.delivered_frames.load(Ordering::Relaxed);
        if frames.saturating_sub(window_frames) >= UNDERFLOW_WINDOW {
            let underflows = counters.underflows.load(Ordering::Relaxed);
            let delta_frames = frames - window_frames;
            let delta_under = underflows.saturating_sub(window_underflows);
            let ratio = delta_under as f64 / delta_frames as f64;
            if ratio > UNDERFLOW_ALERT_RATIO {
                tracing::warn!(
                    underflows = delta_under,
                    frames = delta_frames,
                    "underflow rate above threshold"
                );
            }
            window_frames = frames;
            window_underflows = underflows;
        }

        if let Some(file) = &status_file {
            file.maybe_write(&EngineStatus::gather(&supervisor, None));
        }
    }
}

fn attempt_due(last_attempt: &mut [Option<Instant>; 2], idx: usize) -> bool {
    let due = last_attempt[idx]
        .map(|t| t.elapsed() >= RESPAWN_RETRY)
        .unwrap_or(true);
    if due {
        last_attempt[idx] = Some(Instant::now());
    }
    due
}
