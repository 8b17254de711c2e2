//! Module host: the per-slot patch graph and its execution engine.
//!
//! The host owns an arena of modules, a summed input bus per module, and a
//! topologically ordered execution list. All buffers are allocated at build
//! time; the per-tick path only indexes and sums. Graph edits arrive as a
//! staged `GraphBegin .. GraphCommit` bracket so the swap from the old graph
//! to the new one happens between two ticks, never inside one.

use chronus_dsp::{AnyModule, Module};
use chronus_protocol::command::{MAX_GRAPH_EDGES, MAX_GRAPH_MODULES, SINK, unpack_source};
use chronus_protocol::ModuleKind;
use crate::shared::VOICE_METERS;

/// Warmup frames stop early once a frame's RMS clears this floor.
const WARMUP_RMS_FLOOR: f32 = 1e-4;

#[derive(Debug, Clone, Copy)]
struct Edge {
    src: usize,
    port: u8,
    dst: usize,
}

/// Why a staged graph could not be built. The worker reacts by leaving the
/// old graph (or silence) in place and never raising `prime_ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphBuildError {
    SparseIndices,
    PortOutOfRange,
    Cycle,
}

#[derive(Default)]
struct Staging {
    active: bool,
    kinds: Vec<(u16, ModuleKind)>,
    edges: Vec<(u16, u16)>,
    primes: Vec<(u16, u16, f32)>,
    gates: Vec<(u16, bool)>,
}

pub struct ModuleHost {
    sample_rate: f32,
    block: usize,
    modules: Vec<AnyModule>,
    edges: Vec<Edge>,
    /// (module, port) pairs summed into the chain output.
    sink_taps: Vec<(usize, u8)>,
    exec_order: Vec<usize>,
    input_bufs: Vec<Box<[f32]>>,
    output_bufs: Vec<Box<[f32]>>,
    aux_bufs: Vec<[Box<[f32]>; 2]>,
    voice_peaks: [f32; VOICE_METERS],
    staging: Staging,
    scratch: Box<[f32]>,
}

impl ModuleHost {
    pub fn new(sample_rate: f32, block: usize) -> Self {
        let mut staging = Staging::default();
        staging.kinds.reserve(MAX_GRAPH_MODULES);
        staging.edges.reserve(MAX_GRAPH_EDGES);
        staging.primes.reserve(MAX_GRAPH_MODULES * 8);
        staging.gates.reserve(MAX_GRAPH_MODULES);
        Self {
            sample_rate,
            block,
            modules: Vec::new(),
            edges: Vec::new(),
            sink_taps: Vec::new(),
            exec_order: Vec::new(),
            input_bufs: Vec::new(),
            output_bufs: Vec::new(),
            aux_bufs: Vec::new(),
            voice_peaks: [0.0; VOICE_METERS],
            staging,
            scratch: vec![0.0; block].into_boxed_slice(),
        }
    }

    /// Number of modules in the live graph.
    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    pub fn is_staging(&self) -> bool {
        self.staging.active
    }

    /// Begin staging a replacement graph, discarding any previous staging.
    pub fn stage_begin(&mut self) {
        self.staging.active = true;
        self.staging.kinds.clear();
        self.staging.edges.clear();
        self.staging.primes.clear();
        self.staging.gates.clear();
    }

    /// Stage a module instantiation. Returns false when dropped.
    pub fn stage_create(&mut self, index: u16, kind: ModuleKind) -> bool {
        if !self.staging.active || self.staging.kinds.len() >= MAX_GRAPH_MODULES {
            return false;
        }
        self.staging.kinds.push((index, kind));
        true
    }

    /// Stage an edge. Returns false when dropped.
    pub fn stage_connect(&mut self, source: u16, dst: u16) -> bool {
        if !self.staging.active || self.staging.edges.len() >= MAX_GRAPH_EDGES {
            return false;
        }
        self.staging.edges.push((source, dst));
        true
    }

    /// Stage an immediate parameter write applied right after the build.
    pub fn stage_prime(&mut self, module: u16, param: u16, value: f32) -> bool {
        if !self.staging.active {
            return false;
        }
        self.staging.primes.push((module, param, value));
        true
    }

    /// Stage a gate applied right after the build.
    pub fn stage_gate(&mut self, module: u16, on: bool) -> bool {
        if !self.staging.active {
            return false;
        }
        self.staging.gates.push((module, on));
        true
    }

    /// Tear down the live graph and build the staged one, then prime it and
    /// warm it up: up to `warmup_frames` ticks rendered into scratch (never
    /// the audio ring) so envelopes, filters and delay lines reach steady
    /// state. Warmup ends early once a frame's RMS clears the floor.
    pub fn commit_staged(&mut self, warmup_frames: u16) -> Result<(), GraphBuildError> {
        self.staging.active = false;
        self.rebuild()?;

        let primes: Vec<_> = self.staging.primes.drain(..).collect();
        for (module, param, value) in primes {
            self.set_param(module, param, value, true);
        }
        let gates: Vec<_> = self.staging.gates.drain(..).collect();
        for (module, on) in gates {
            self.gate(module, on);
        }

        for _ in 0..warmup_frames {
            let mut scratch = std::mem::take(&mut self.scratch);
            self.tick(&mut scratch);
            let rms = (scratch.iter().map(|x| x * x).sum::<f32>() / scratch.len().max(1) as f32)
                .sqrt();
            self.scratch = scratch;
            if rms > WARMUP_RMS_FLOOR {
                break;
            }
        }
        Ok(())
    }

    fn rebuild(&mut self) -> Result<(), GraphBuildError> {
        // Indices must be dense 0..n in staging order.
        for (expected, (index, _)) in self.staging.kinds.iter().enumerate() {
            if *index as usize != expected {
                return Err(GraphBuildError::SparseIndices);
            }
        }
        let n = self.staging.kinds.len();

        let mut edges = Vec::with_capacity(self.staging.edges.len());
        let mut sink_taps = Vec::new();
        for (source, dst) in &self.staging.edges {
            let (src, port) = unpack_source(*source);
            let src = src as usize;
            if src >= n || port > 2 {
                return Err(GraphBuildError::PortOutOfRange);
            }
            if *dst == SINK {
                sink_taps.push((src, port));
            } else if (*dst as usize) < n {
                edges.push(Edge {
                    src,
                    port,
                    dst: *dst as usize,
                });
            } else {
                return Err(GraphBuildError::PortOutOfRange);
            }
        }

        let kinds: Vec<ModuleKind> = self.staging.kinds.iter().map(|(_, k)| *k).collect();

        // Modules with an unconnected main output feed the chain output,
        // except LFOs, whose output is a control signal.
        for (m, kind) in kinds.iter().enumerate() {
            let has_main_edge = edges.iter().any(|e| e.src == m && e.port == 0)
                || sink_taps.iter().any(|(s, p)| *s == m && *p == 0);
            if !has_main_edge && *kind != ModuleKind::Lfo {
                sink_taps.push((m, 0));
            }
        }

        let exec_order = topo_order(n, &edges).ok_or(GraphBuildError::Cycle)?;

        self.modules = kinds
            .iter()
            .map(|kind| AnyModule::build(*kind, self.sample_rate, self.block))
            .collect();
        self.edges = edges;
        self.sink_taps = sink_taps;
        self.exec_order = exec_order;
        self.input_bufs = (0..n).map(|_| vec![0.0; self.block].into_boxed_slice()).collect();
        self.output_bufs = (0..n).map(|_| vec![0.0; self.block].into_boxed_slice()).collect();
        self.aux_bufs = self
            .modules
            .iter()
            .map(|m| {
                let len = if m.aux_count() > 0 { self.block } else { 0 };
                [
                    vec![0.0; len].into_boxed_slice(),
                    vec![0.0; len].into_boxed_slice(),
                ]
            })
            .collect();
        self.voice_peaks = [0.0; VOICE_METERS];
        Ok(())
    }

    /// Set a parameter by wire indices. Returns false for unknown targets.
    pub fn set_param(&mut self, module: u16, param: u16, value: f32, immediate: bool) -> bool {
        if self.staging.active {
            // Writes inside a commit bracket target the graph being staged.
            return self.stage_prime(module, param, value);
        }
        match self.modules.get_mut(module as usize) {
            Some(m) => {
                if (param as usize) < m.specs().len() {
                    m.set_param(param as usize, value, immediate);
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    /// Gate a module by wire index. Returns false for unknown targets.
    pub fn gate(&mut self, module: u16, on: bool) -> bool {
        if self.staging.active {
            return self.stage_gate(module, on);
        }
        match self.modules.get_mut(module as usize) {
            Some(m) => {
                m.gate(on);
                true
            }
            None => false,
        }
    }

    /// Process one tick: run every module in topological order, propagate
    /// edge sums, and accumulate the chain output into `out`.
    pub fn tick(&mut self, out: &mut [f32]) {
        out.fill(0.0);
        if self.modules.is_empty() {
            return;
        }
        for buf in &mut self.input_bufs {
            buf.fill(0.0);
        }

        for i in 0..self.exec_order.len() {
            let m = self.exec_order[i];
            let module = &mut self.modules[m];
            let input = &self.input_bufs[m];
            let output = &mut self.output_bufs[m];
            if module.aux_count() > 0 {
                let [a, b] = &mut self.aux_bufs[m];
                let mut aux: [&mut [f32]; 2] = [&mut a[..], &mut b[..]];
                module.process_aux(input, output, &mut aux);
            } else {
                module.process(input, output);
            }

            // Propagate this module's outputs to downstream input buses.
            for edge in &self.edges {
                if edge.src != m {
                    continue;
                }
                let src_buf: &[f32] = if edge.port == 0 {
                    &self.output_bufs[m]
                } else {
                    &self.aux_bufs[m][edge.port as usize - 1]
                };
                // Buffers for unused aux ports are empty; nothing to add.
                if src_buf.is_empty() {
                    continue;
                }
                for (acc, x) in self.input_bufs[edge.dst].iter_mut().zip(src_buf.iter()) {
                    *acc += x;
                }
            }
        }

        for (m, port) in &self.sink_taps {
            let src_buf: &[f32] = if *port == 0 {
                &self.output_bufs[*m]
            } else {
                &self.aux_bufs[*m][*port as usize - 1]
            };
            for (acc, x) in out.iter_mut().zip(src_buf.iter()) {
                *acc += x;
            }
        }

        // Publish per-voice peaks for the level broadcast.
        let mut meter = 0;
        for (m, module) in self.modules.iter().enumerate() {
            if module.kind() == ModuleKind::Voice && meter < VOICE_METERS {
                self.voice_peaks[meter] = self.output_bufs[m]
                    .iter()
                    .fold(0.0f32, |a, b| a.max(b.abs()));
                meter += 1;
            }
        }
    }

    /// Peaks of the voice modules' outputs from the last tick.
    pub fn voice_peaks(&self) -> [f32; VOICE_METERS] {
        self.voice_peaks
    }

    /// Drop the live graph, returning the host to silence.
    pub fn reset_graph(&mut self) {
        self.modules.clear();
        self.edges.clear();
        self.sink_taps.clear();
        self.exec_order.clear();
        self.input_bufs.clear();
        self.output_bufs.clear();
        self.aux_bufs.clear();
        self.voice_peaks = [0.0; VOICE_METERS];
    }
}

/// Kahn's algorithm over module-to-module edges.
fn topo_order(n: usize, edges: &[Edge]) -> Option<Vec<usize>> {
    let mut indegree = vec![0usize; n];
    for edge in edges {
        indegree[edge.dst] += 1;
    }
    let mut ready: Vec<usize> = (0..n).filter(|m| indegree[*m] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(m) = ready.pop() {
        order.push(m);
        for edge in edges {
            if edge.src == m {
                indegree[edge.dst] -= 1;
                if indegree[edge.dst] == 0 {
                    ready.push(edge.dst);
                }
            }
        }
    }
    (order.len() == n).then_some(order)
}
