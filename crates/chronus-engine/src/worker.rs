//! DSP worker: one slot's tick loop on its own thread.

use crate::host::ModuleHost;
use crate::ring::{Consumer, FrameProducer};
use crate::shared::SlotShared;
use chronus_protocol::{Command, CommandOp};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Bounded command drain per tick so a flooded ring cannot starve audio.
pub const MAX_CMDS_PER_TICK: usize = 256;

/// Everything a worker thread needs at spawn time.
pub struct WorkerContext {
    pub slot: usize,
    pub sample_rate: f32,
    pub buffer_size: usize,
    /// Frames of lead to keep in the audio ring before pacing kicks in.
    pub lead_target: usize,
    pub commands: Consumer<Command>,
    pub audio: FrameProducer,
    pub shared: Arc<SlotShared>,
}

/// Spawn a worker thread. The thread exits on a `Shutdown` command; a panic
/// inside the tick loop ends the thread, which the monitor's sentinel check
/// observes via `JoinHandle::is_finished`.
pub fn spawn(ctx: WorkerContext) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name(format!("chronus-worker-{}", ctx.slot))
        .spawn(move || run(ctx))
}

fn run(mut ctx: WorkerContext) {
    let mut host = ModuleHost::new(ctx.sample_rate, ctx.buffer_size);
    let mut frame = vec![0.0f32; ctx.buffer_size];
    let period = Duration::from_secs_f64(ctx.buffer_size as f64 / ctx.sample_rate as f64);
    let mut deadline = Instant::now();

    tracing::debug!(slot = ctx.slot, "worker started");

    loop {
        if !drain_commands(&mut ctx, &mut host) {
            break;
        }

        host.tick(&mut frame);

        if ctx.audio.write(&frame).is_err() {
            // Ring full: the reader is behind. Drop the frame; latest wins.
            ctx.shared.overflow.fetch_add(1, Ordering::Relaxed);
        }

        let peaks = host.voice_peaks();
        for (i, peak) in peaks.iter().enumerate() {
            ctx.shared.set_voice_peak(i, *peak);
        }

        ctx.shared.heartbeat.fetch_add(1, Ordering::Release);

        // Pace against the buffer deadline once enough lead is banked;
        // otherwise tick again immediately to build the lead back up.
        if ctx.audio.occupancy() < ctx.lead_target {
            deadline = Instant::now();
            continue;
        }
        deadline += period;
        let now = Instant::now();
        if deadline > now {
            std::thread::sleep(deadline - now);
        } else {
            // Ran late: rebase rather than accumulate unbounded drift.
            deadline = now;
        }
    }

    tracing::debug!(slot = ctx.slot, "worker exited");
}

/// Apply up to `MAX_CMDS_PER_TICK` commands. Returns false on `Shutdown`.
fn drain_commands(ctx: &mut WorkerContext, host: &mut ModuleHost) -> bool {
    let mut seen = 0u64;
    for _ in 0..MAX_CMDS_PER_TICK {
        let Ok(command) = ctx.commands.read() else {
            break;
        };
        debug_assert!(command.seq >= seen, "command ring reordered");
        seen = command.seq;

        let applied = match command.op {
            CommandOp::ParamSet {
                module,
                param,
                value,
            } => host.set_param(module, param, value, false),
            CommandOp::Prime {
                module,
                param,
                value,
            } => host.set_param(module, param, value, true),
            CommandOp::Gate { module, on } => host.gate(module, on),
            CommandOp::GraphBegin => {
                host.stage_begin();
                ctx.shared.prime_ready.store(false, Ordering::Release);
                true
            }
            CommandOp::GraphCreate { module, kind } => host.stage_create(module, kind),
            CommandOp::GraphConnect { source, dst } => host.stage_connect(source, dst),
            CommandOp::GraphCommit { warmup_frames } => match host.commit_staged(warmup_frames) {
                Ok(()) => {
                    ctx.shared.prime_ready.store(true, Ordering::Release);
                    true
                }
                Err(err) => {
                    tracing::warn!(slot = ctx.slot, ?err, "staged graph rejected");
                    false
                }
            },
            CommandOp::Shutdown => return false,
        };
        if !applied {
            ctx.shared.dropped_commands.fetch_add(1, Ordering::Relaxed);
        }
    }
    true
}
