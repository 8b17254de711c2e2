//! Supervisor: slot ownership, failover, and the patch-commit protocol.
//!
//! The supervisor owns both worker slots, the canonical description of the
//! live graph (names and cached parameter values), and the single atomic
//! `active_idx` word the audio callback reads. Everything it does to a
//! worker travels through that slot's command ring; the audio path is never
//! locked or touched directly.

use crate::audio::Counters;
use crate::error::PatchError;
use crate::ring::{
    FrameConsumer, FrameRingHandle, Producer, RingHandle, frame_ring, record_ring,
};
use crate::shared::SlotShared;
use crate::worker::{self, WorkerContext};
use chronus_protocol::command::{SINK, pack_source};
use chronus_protocol::{Command, CommandOp, EngineConfig, ModuleKind, module_param_specs};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Command ring capacity per slot. Must hold a full graph push.
const COMMAND_RING_CAPACITY: usize = 1024;

/// Warmup frames requested from a freshly built graph.
const WARMUP_FRAMES: u16 = 8;

/// Reserved destination name routing a connection to the chain output.
pub const OUTPUT_NODE: &str = "out";

/// A staged patch edit received over OSC.
#[derive(Debug, Clone)]
pub enum PatchOp {
    Create { id: String, kind: ModuleKind },
    Connect { src: String, dst: String },
    Remove { id: String },
}

/// Canonical (named) graph plus pending edits and the parameter cache.
#[derive(Default)]
struct GraphState {
    /// Module names and kinds; position is the wire index.
    modules: Vec<(String, ModuleKind)>,
    /// Edges as (src name, src port, dst name); dst may be [`OUTPUT_NODE`].
    edges: Vec<(String, u8, String)>,
    /// Last known value per (module, param path); replayed on rebuilds.
    params: HashMap<(String, String), f32>,
    pending: Vec<PatchOp>,
}

/// A name-resolved graph ready to ship over a command ring.
struct WireGraph {
    modules: Vec<(String, ModuleKind)>,
    edges: Vec<(String, u8, String)>,
    creates: Vec<(u16, ModuleKind)>,
    connects: Vec<(u16, u16)>,
    primes: Vec<(u16, u16, f32)>,
}

struct CommandSender {
    producer: Producer<Command>,
    seq: u64,
}

impl CommandSender {
    fn send(&mut self, op: CommandOp) -> Result<(), PatchError> {
        self.seq += 1;
        self.producer
            .write(Command::new(self.seq, op))
            .map_err(|_| PatchError::RingFull)
    }

    fn free(&self) -> usize {
        self.producer.free()
    }
}

struct SlotRuntime {
    cmd: Mutex<CommandSender>,
    cmd_handle: RingHandle<Command>,
    audio_handle: FrameRingHandle,
    shared: Arc<SlotShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

pub struct Supervisor {
    cfg: EngineConfig,
    slots: [SlotRuntime; 2],
    active_idx: Arc<AtomicUsize>,
    graph: Mutex<GraphState>,
    counters: Arc<Counters>,
    sample_clock: Arc<AtomicU64>,
    failovers: AtomicU64,
    fatal_restarts: AtomicU64,
    last_respawn_ms: AtomicU64,
}

impl Supervisor {
    /// Build both slots and spawn their workers. Returns the supervisor and
    /// the audio-ring consumers the callback owns from here on.
    pub fn new(cfg: EngineConfig) -> std::io::Result<(Arc<Self>, [FrameConsumer; 2])> {
        let counters = Arc::new(Counters::new());

        let mut consumers = Vec::with_capacity(2);
        let mut slots = Vec::with_capacity(2);
        for slot in 0..2 {
            let (cmd_tx, cmd_rx, cmd_handle) = record_ring::<Command>(COMMAND_RING_CAPACITY);
            let (audio_tx, audio_rx, audio_handle) =
                frame_ring(cfg.supervisor.ring_depth, cfg.audio.buffer_size);
            let shared = Arc::new(SlotShared::new());
            let join = worker::spawn(WorkerContext {
                slot,
                sample_rate: cfg.audio.sample_rate as f32,
                buffer_size: cfg.audio.buffer_size,
                lead_target: cfg.supervisor.lead_target_frames,
                commands: cmd_rx,
                audio: audio_tx,
                shared: Arc::clone(&shared),
            })?;
            consumers.push(audio_rx);
            slots.push(SlotRuntime {
                cmd: Mutex::new(CommandSender {
                    producer: cmd_tx,
                    seq: 0,
                }),
                cmd_handle,
                audio_handle,
                shared,
                worker: Mutex::new(Some(join)),
            });
        }

        let supervisor = Arc::new(Self {
            cfg,
            slots: match <[SlotRuntime; 2]>::try_from(slots) {
                Ok(s) => s,
                Err(_) => unreachable!("exactly two slots built"),
            },
            active_idx: Arc::new(AtomicUsize::new(0)),
            graph: Mutex::new(GraphState::default()),
            counters,
            sample_clock: Arc::new(AtomicU64::new(0)),
            failovers: AtomicU64::new(0),
            fatal_restarts: AtomicU64::new(0),
            last_respawn_ms: AtomicU64::new(0),
        });

        let consumers = match <[FrameConsumer; 2]>::try_from(consumers) {
            Ok(c) => c,
            Err(_) => unreachable!("exactly two consumers built"),
        };
        Ok((supervisor, consumers))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn active_idx(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.active_idx)
    }

    pub fn counters(&self) -> Arc<Counters> {
        Arc::clone(&self.counters)
    }

    pub fn sample_clock(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.sample_clock)
    }

    /// Install the boot patch: four voices into a mixer, with per-voice
    /// sends into a shared reverb and delay. Pushed to both slots so either
    /// can take the active role immediately.
    pub fn install_default_patch(&self) -> Result<(), PatchError> {
        {
            let mut graph = self.graph.lock();
            graph.modules = vec![
                ("voice1".into(), ModuleKind::Voice),
                ("voice2".into(), ModuleKind::Voice),
                ("voice3".into(), ModuleKind::Voice),
                ("voice4".into(), ModuleKind::Voice),
                ("mixer".into(), ModuleKind::Mixer),
                ("reverb".into(), ModuleKind::Reverb),
                ("delay".into(), ModuleKind::Delay),
            ];
            graph.edges.clear();
            for voice in ["voice1", "voice2", "voice3", "voice4"] {
                graph.edges.push((voice.into(), 0, "mixer".into()));
                graph.edges.push((voice.into(), 1, "reverb".into()));
                graph.edges.push((voice.into(), 2, "delay".into()));
            }
            graph.params.clear();
            graph.pending.clear();
        }

        let wire = {
            let graph = self.graph.lock();
            resolve(&graph, &[])?
        };
        for idx in [0, 1] {
            self.push_graph(idx, &wire)?;
        }
        for idx in [0, 1] {
            self.wait_primed(idx)?;
        }
        store_canonical(&mut self.graph.lock(), &wire);
        Ok(())
    }

    /// Stage a patch edit; validated at commit time.
    pub fn stage(&self, op: PatchOp) {
        self.graph.lock().pending.push(op);
    }

    /// Discard the pending patch.
    pub fn abort_pending(&self) {
        self.graph.lock().pending.clear();
    }

    pub fn has_pending(&self) -> bool {
        !self.graph.lock().pending.is_empty()
    }

    /// Atomically activate the pending graph.
    ///
    /// The standby index is captured once so a concurrent failover cannot
    /// redirect the build mid-protocol. On any failure the pending patch is
    /// discarded and the active graph stays untouched.
    pub fn commit(&self) -> Result<(), PatchError> {
        let wire = {
            let graph = self.graph.lock();
            if graph.pending.is_empty() {
                return Err(PatchError::NoPending);
            }
            resolve(&graph, &graph.pending)
        };
        let wire = match wire {
            Ok(w) => w,
            Err(e) => {
                self.abort_pending();
                return Err(e);
            }
        };

        let standby = 1 - (self.active_idx.load(Ordering::Acquire) & 1);

        if let Err(e) = self.push_graph(standby, &wire) {
            self.abort_pending();
            return Err(e);
        }
        if let Err(e) = self.wait_primed(standby) {
            self.abort_pending();
            return Err(e);
        }

        // Canonicalize and swap under one lock. Routing resolves names
        // against the canonical graph while holding this same lock, so no
        // caller can pair a pre-commit index with the post-commit slot.
        {
            let mut graph = self.graph.lock();
            store_canonical(&mut graph, &wire);
            graph.pending.clear();
            // The callback picks this up at its next frame boundary.
            self.active_idx.store(standby, Ordering::Release);
        }
        let former = 1 - standby;

        // Mirror the new graph onto the former active slot so it becomes a
        // ready standby for the next commit or failover.
        if let Err(e) = self.push_graph(former, &wire) {
            tracing::warn!(slot = former, error = %e, "standby mirror failed");
        }

        tracing::info!(active = standby, "patch committed");
        Ok(())
    }

    /// Route a parameter write to the live graph.
    ///
    /// Steady state targets the active slot only; while a commit is pending
    /// the write is broadcast to both slots so the incoming graph observes
    /// the same state. The graph lock is held from name resolution through
    /// the send so a concurrent commit can never re-index the graph between
    /// the two.
    pub fn set_param(&self, module: &str, path: &str, value: f32) -> Result<(), PatchError> {
        let mut graph = self.graph.lock();
        let (index, kind) = resolve_module(&graph, module)?;
        let specs = module_param_specs(kind);
        let param = chronus_protocol::param_index(kind, path)
            .ok_or_else(|| PatchError::UnknownParam(format!("{module}/{path}")))?;
        let value = specs[param as usize].clamp(value);

        let broadcast = !graph.pending.is_empty();
        graph.params.insert((module.into(), path.into()), value);

        let op = CommandOp::ParamSet {
            module: index,
            param,
            value,
        };
        self.send_routed(op, broadcast)
    }

    /// Route an immediate gate transition. Same locking discipline as
    /// [`Self::set_param`].
    pub fn gate(&self, module: &str, on: bool) -> Result<(), PatchError> {
        let graph = self.graph.lock();
        let (index, _) = resolve_module(&graph, module)?;
        let broadcast = !graph.pending.is_empty();
        self.send_routed(CommandOp::Gate { module: index, on }, broadcast)
    }

    /// Lock order: callers may hold the graph lock; the slot command locks
    /// are always taken after it, never the other way around.
    fn send_routed(&self, op: CommandOp, broadcast: bool) -> Result<(), PatchError> {
        let active = self.active_idx.load(Ordering::Acquire) & 1;
        self.slots[active].cmd.lock().send(op)?;
        if broadcast {
            // Best effort: the standby may be mid-respawn.
            let _ = self.slots[1 - active].cmd.lock().send(op);
        }
        Ok(())
    }

    /// Ship a wire graph to one slot as a single commit bracket.
    fn push_graph(&self, idx: usize, wire: &WireGraph) -> Result<(), PatchError> {
        // Clear the handshake before the bracket is enqueued; waiting on a
        // flag the previous commit left raised would be a false positive.
        self.slots[idx].shared.prime_ready.store(false, Ordering::Release);
        let mut cmd = self.slots[idx].cmd.lock();
        let needed = 2 + wire.creates.len() + wire.connects.len() + wire.primes.len();
        if cmd.free() < needed {
            return Err(PatchError::RingFull);
        }
        cmd.send(CommandOp::GraphBegin)?;
        for (module, kind) in &wire.creates {
            cmd.send(CommandOp::GraphCreate {
                module: *module,
                kind: *kind,
            })?;
        }
        for (source, dst) in &wire.connects {
            cmd.send(CommandOp::GraphConnect {
                source: *source,
                dst: *dst,
            })?;
        }
        for (module, param, value) in &wire.primes {
            cmd.send(CommandOp::Prime {
                module: *module,
                param: *param,
                value: *value,
            })?;
        }
        cmd.send(CommandOp::GraphCommit {
            warmup_frames: WARMUP_FRAMES,
        })?;
        Ok(())
    }

    fn wait_primed(&self, idx: usize) -> Result<(), PatchError> {
        let timeout = Duration::from_millis(self.cfg.supervisor.prime_timeout_ms);
        let start = Instant::now();
        while !self.slots[idx].shared.prime_ready.load(Ordering::Acquire) {
            if start.elapsed() > timeout {
                return Err(PatchError::PrimeTimeout(
                    self.cfg.supervisor.prime_timeout_ms,
                ));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }

    /// Liveness snapshot for the monitor: (heartbeat, thread finished).
    pub fn slot_liveness(&self, idx: usize) -> (u64, bool) {
        let slot = &self.slots[idx];
        let heartbeat = slot.shared.heartbeat.load(Ordering::Acquire);
        let finished = slot
            .worker
            .lock()
            .as_ref()
            .map(|j| j.is_finished())
            .unwrap_or(true);
        (heartbeat, finished)
    }

    /// Voice peaks of the active slot, for the level broadcast.
    pub fn active_voice_peaks(&self) -> [f32; crate::shared::VOICE_METERS] {
        let active = self.active_idx.load(Ordering::Acquire) & 1;
        self.slots[active].shared.load_voice_peaks()
    }

    /// Handle a dead worker: switch the callback away from it if it was
    /// active, then rebuild it as the new standby.
    pub fn failover(&self, dead: usize) {
        let active = self.active_idx.load(Ordering::Acquire) & 1;
        if dead == active {
            let survivor = 1 - dead;
            self.active_idx.store(survivor, Ordering::Release);
            self.failovers.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(dead, survivor, "worker died; failed over");
        } else {
            tracing::warn!(dead, "standby worker died");
        }
        if let Err(e) = self.respawn(dead) {
            tracing::error!(slot = dead, error = %e, "respawn failed");
        }
    }

    /// Both workers are dead: restart the whole worker layer while the
    /// callback keeps replaying its last good frame.
    pub fn fatal_restart(&self) {
        self.fatal_restarts.fetch_add(1, Ordering::Relaxed);
        tracing::error!("both workers dead; restarting worker layer");
        let active = self.active_idx.load(Ordering::Acquire) & 1;
        for idx in [active, 1 - active] {
            if let Err(e) = self.respawn(idx) {
                tracing::error!(slot = idx, error = %e, "restart respawn failed");
            }
        }
    }

    /// Rebuild one slot: join the dead thread, re-arm its rings, spawn a
    /// fresh worker, and replay the canonical graph and parameter cache.
    fn respawn(&self, idx: usize) -> Result<(), PatchError> {
        let started = Instant::now();
        let slot = &self.slots[idx];

        {
            let mut guard = slot.worker.lock();
            match guard.take() {
                None => {}
                Some(join) if join.is_finished() => {
                    let _ = join.join();
                }
                Some(join) => {
                    // Hung, not dead: a thread cannot be killed, and its
                    // ring endpoints cannot be reclaimed while it lives.
                    // Ask it to exit; the monitor retries on a later cycle.
                    let _ = self.slots[idx].cmd.lock().send(CommandOp::Shutdown);
                    *guard = Some(join);
                    return Err(PatchError::WorkerBusy);
                }
            }
        }

        // The dead worker's ring endpoints are gone with its thread, so
        // re-arming is sound. Stale commands addressed to the old graph are
        // drained here rather than applied to the new one.
        let mut stale = unsafe { slot.cmd_handle.attach_consumer() };
        while stale.read().is_ok() {}
        let audio_tx = unsafe { slot.audio_handle.attach_producer() };

        slot.shared.prime_ready.store(false, Ordering::Release);

        let join = worker::spawn(WorkerContext {
            slot: idx,
            sample_rate: self.cfg.audio.sample_rate as f32,
            buffer_size: self.cfg.audio.buffer_size,
            lead_target: self.cfg.supervisor.lead_target_frames,
            commands: stale,
            audio: audio_tx,
            shared: Arc::clone(&slot.shared),
        })
        .map_err(|e| {
            tracing::error!(error = %e, "worker thread spawn failed");
            PatchError::SpawnFailed
        })?;
        *slot.worker.lock() = Some(join);

        let wire = {
            let graph = self.graph.lock();
            resolve(&graph, &[])?
        };
        self.push_graph(idx, &wire)?;
        self.wait_primed(idx)?;

        let elapsed = started.elapsed().as_millis() as u64;
        self.last_respawn_ms.store(elapsed, Ordering::Relaxed);
        tracing::info!(slot = idx, elapsed_ms = elapsed, "standby respawned");
        Ok(())
    }

    pub fn failover_count(&self) -> u64 {
        self.failovers.load(Ordering::Relaxed)
    }

    pub fn fatal_restart_count(&self) -> u64 {
        self.fatal_restarts.load(Ordering::Relaxed)
    }

    pub fn last_respawn_ms(&self) -> u64 {
        self.last_respawn_ms.load(Ordering::Relaxed)
    }

    pub fn slot_overflow(&self, idx: usize) -> u64 {
        self.slots[idx].shared.overflow.load(Ordering::Relaxed)
    }

    pub fn slot_dropped_commands(&self, idx: usize) -> u64 {
        self.slots[idx].shared.dropped_commands.load(Ordering::Relaxed)
    }

    /// Ask a worker to exit. Used by shutdown and by the failover tests.
    pub fn request_worker_exit(&self, idx: usize) {
        let _ = self.slots[idx].cmd.lock().send(CommandOp::Shutdown);
    }

    /// Graceful engine shutdown: stop both workers and join them.
    pub fn shutdown(&self) {
        for idx in [0, 1] {
            self.request_worker_exit(idx);
        }
        let deadline = Instant::now() + Duration::from_millis(100);
        for idx in [0, 1] {
            loop {
                let finished = self.slots[idx]
                    .worker
                    .lock()
                    .as_ref()
                    .map(|j| j.is_finished())
                    .unwrap_or(true);
                if finished {
                    if let Some(join) = self.slots[idx].worker.lock().take() {
                        let _ = join.join();
                    }
                    break;
                }
                if Instant::now() > deadline {
                    tracing::warn!(slot = idx, "worker did not exit in time");
                    break;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }
}

/// Look up a module's wire index and kind in the canonical graph.
fn resolve_module(graph: &GraphState, module: &str) -> Result<(u16, ModuleKind), PatchError> {
    graph
        .modules
        .iter()
        .position(|(name, _)| name == module)
        .map(|i| (i as u16, graph.modules[i].1))
        .ok_or_else(|| PatchError::UnknownModule(module.to_string()))
}

/// Replace the canonical graph with a resolved wire graph, dropping cached
/// parameters for module names that did not survive.
fn store_canonical(graph: &mut GraphState, wire: &WireGraph) {
    graph.modules = wire.modules.clone();
    graph.edges = wire.edges.clone();
    let names: Vec<&String> = graph.modules.iter().map(|(n, _)| n).collect();
    graph
        .params
        .retain(|(module, _), _| names.iter().any(|n| *n == module));
}

/// Resolve the canonical graph plus pending edits into wire form.
fn resolve(graph: &GraphState, pending: &[PatchOp]) -> Result<WireGraph, PatchError> {
    let mut modules = graph.modules.clone();
    let mut edges = graph.edges.clone();

    for op in pending {
        match op {
            PatchOp::Create { id, kind } => {
                if modules.iter().any(|(name, _)| name == id) {
                    return Err(PatchError::DuplicateModule(id.clone()));
                }
                modules.push((id.clone(), *kind));
            }
            PatchOp::Connect { src, dst } => {
                edges.push((src.clone(), 0, dst.clone()));
            }
            PatchOp::Remove { id } => {
                let before = modules.len();
                modules.retain(|(name, _)| name != id);
                if modules.len() == before {
                    return Err(PatchError::UnknownModule(id.clone()));
                }
                edges.retain(|(src, _, dst)| src != id && dst != id);
            }
        }
    }

    if modules.len() > chronus_protocol::MAX_GRAPH_MODULES {
        return Err(PatchError::TooManyModules(
            chronus_protocol::MAX_GRAPH_MODULES,
        ));
    }
    if edges.len() > chronus_protocol::MAX_GRAPH_EDGES {
        return Err(PatchError::TooManyEdges(chronus_protocol::MAX_GRAPH_EDGES));
    }

    let index_of = |name: &str| -> Option<u16> {
        modules
            .iter()
            .position(|(n, _)| n == name)
            .map(|i| i as u16)
    };

    let mut connects = Vec::with_capacity(edges.len());
    for (src, port, dst) in &edges {
        let src_idx = index_of(src).ok_or_else(|| PatchError::UnknownModule(src.clone()))?;
        let dst_idx = if dst == OUTPUT_NODE {
            SINK
        } else {
            index_of(dst).ok_or_else(|| PatchError::UnknownModule(dst.clone()))?
        };
        connects.push((pack_source(src_idx, *port), dst_idx));
    }

    let creates: Vec<(u16, ModuleKind)> = modules
        .iter()
        .enumerate()
        .map(|(i, (_, kind))| (i as u16, *kind))
        .collect();

    // Prime with declared defaults, overridden by the cached last-known
    // values for module names that survive the edit.
    let mut primes = Vec::new();
    for (i, (name, kind)) in modules.iter().enumerate() {
        for (p, spec) in module_param_specs(*kind).iter().enumerate() {
            let value = graph
                .params
                .get(&(name.clone(), spec.path.to_string()))
                .copied()
                .unwrap_or(spec.default);
            primes.push((i as u16, p as u16, value));
        }
    }

    Ok(WireGraph {
        creates,
        connects,
        primes,
        modules,
        edges,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with(modules: &[(&str, ModuleKind)]) -> GraphState {
        GraphState {
            modules: modules
                .iter()
                .map(|(n, k)| (n.to_string(), *k))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn resolve_assigns_dense_indices() {
        let state = state_with(&[("osc1", ModuleKind::Sine), ("filt1", ModuleKind::BiquadLp)]);
        let wire = resolve(&state, &[]).expect("resolves");
        assert_eq!(wire.creates, vec![(0, ModuleKind::Sine), (1, ModuleKind::BiquadLp)]);
    }

    #[test]
    fn resolve_rejects_duplicate_create() {
        let state = state_with(&[("osc1", ModuleKind::Sine)]);
        let pending = vec![PatchOp::Create {
            id: "osc1".into(),
            kind: ModuleKind::Sine,
        }];
        assert_eq!(
            resolve(&state, &pending).err(),
            Some(PatchError::DuplicateModule("osc1".into()))
        );
    }

    #[test]
    fn resolve_rejects_unknown_edge_endpoint() {
        let state = state_with(&[("osc1", ModuleKind::Sine)]);
        let pending = vec![PatchOp::Connect {
            src: "osc1".into(),
            dst: "ghost".into(),
        }];
        assert_eq!(
            resolve(&state, &pending).err(),
            Some(PatchError::UnknownModule("ghost".into()))
        );
    }

    #[test]
    fn remove_drops_module_and_its_edges() {
        let mut state = state_with(&[("osc1", ModuleKind::Sine), ("filt1", ModuleKind::BiquadLp)]);
        state.edges.push(("osc1".into(), 0, "filt1".into()));
        let pending = vec![PatchOp::Remove { id: "filt1".into() }];
        let wire = resolve(&state, &pending).expect("resolves");
        assert_eq!(wire.creates.len(), 1);
        assert!(wire.connects.is_empty());
    }

    #[test]
    fn connect_to_out_targets_sink() {
        let state = state_with(&[("osc1", ModuleKind::Sine)]);
        let pending = vec![PatchOp::Connect {
            src: "osc1".into(),
            dst: OUTPUT_NODE.into(),
        }];
        let wire = resolve(&state, &pending).expect("resolves");
        assert_eq!(wire.connects, vec![(0, SINK)]);
    }

    #[test]
    fn cached_params_override_defaults_in_primes() {
        let mut state = state_with(&[("osc1", ModuleKind::Sine)]);
        state
            .params
            .insert(("osc1".into(), "freq".into()), 523.25);
        let wire = resolve(&state, &[]).expect("resolves");
        assert!(wire.primes.contains(&(0, 0, 523.25)));
    }
}
