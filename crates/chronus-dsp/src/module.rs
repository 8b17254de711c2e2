//! The module contract and the closed dispatch enum.

use crate::{Adsr, BiquadLp, Delay, Distortion, Lfo, Mixer, Reverb, SineOsc, Voice};
use chronus_protocol::{ModuleKind, ParamSpec};

/// Number of aux output ports a module may expose (reverb send, delay send).
pub const AUX_OUTPUTS: usize = 2;

/// Contract shared by every DSP module.
///
/// `process` fills `output` with exactly `output.len()` samples. It must not
/// allocate, block, or consult wall-clock time; parameters are read once per
/// buffer through their smoothing records. `input` is the host-summed input
/// bus (zeroed when nothing is connected).
pub trait Module: Send {
    /// Static parameter table for this module's kind.
    fn specs(&self) -> &'static [ParamSpec];

    /// Set a parameter target by index. Values are clamped to the declared
    /// range; unknown indices are ignored. `immediate` bypasses smoothing.
    fn set_param(&mut self, param: usize, value: f32, immediate: bool);

    /// Immediate gate input. Modules without an envelope ignore it.
    fn gate(&mut self, _on: bool) {}

    /// How many aux output ports this module fills (0 for most).
    fn aux_count(&self) -> usize {
        0
    }

    /// Process one buffer.
    fn process(&mut self, input: &[f32], output: &mut [f32]);

    /// Process one buffer, also filling aux send taps. The default ignores
    /// aux; only modules with `aux_count() > 0` override this.
    fn process_aux(&mut self, input: &[f32], output: &mut [f32], _aux: &mut [&mut [f32]]) {
        self.process(input, output);
    }

    /// Return all internal state (phases, envelopes, lines) to silence.
    fn reset(&mut self);
}

/// The closed set of module variants, dispatched by match rather than by
/// boxed trait object so the worker's hot loop can devirtualize.
pub enum AnyModule {
    Sine(SineOsc),
    Adsr(Adsr),
    BiquadLp(BiquadLp),
    Distortion(Distortion),
    Reverb(Reverb),
    Delay(Delay),
    Lfo(Lfo),
    Voice(Voice),
    Mixer(Mixer),
}

impl AnyModule {
    /// Factory keyed on the wire tag.
    pub fn build(kind: ModuleKind, sample_rate: f32, max_block: usize) -> Self {
        match kind {
            ModuleKind::Sine => AnyModule::Sine(SineOsc::new(sample_rate)),
            ModuleKind::Adsr => AnyModule::Adsr(Adsr::new(sample_rate)),
            ModuleKind::BiquadLp => AnyModule::BiquadLp(BiquadLp::new(sample_rate)),
            ModuleKind::Distortion => AnyModule::Distortion(Distortion::new(sample_rate)),
            ModuleKind::Reverb => AnyModule::Reverb(Reverb::new(sample_rate)),
            ModuleKind::Delay => AnyModule::Delay(Delay::new(sample_rate)),
            ModuleKind::Lfo => AnyModule::Lfo(Lfo::new(sample_rate)),
            ModuleKind::Voice => AnyModule::Voice(Voice::new(sample_rate, max_block)),
            ModuleKind::Mixer => AnyModule::Mixer(Mixer::new(sample_rate)),
        }
    }

    /// The kind tag this instance was built from.
    pub fn kind(&self) -> ModuleKind {
        match self {
            AnyModule::Sine(_) => ModuleKind::Sine,
            AnyModule::Adsr(_) => ModuleKind::Adsr,
            AnyModule::BiquadLp(_) => ModuleKind::BiquadLp,
            AnyModule::Distortion(_) => ModuleKind::Distortion,
            AnyModule::Reverb(_) => ModuleKind::Reverb,
            AnyModule::Delay(_) => ModuleKind::Delay,
            AnyModule::Lfo(_) => ModuleKind::Lfo,
            AnyModule::Voice(_) => ModuleKind::Voice,
            AnyModule::Mixer(_) => ModuleKind::Mixer,
        }
    }

    #[inline]
    fn inner(&self) -> &dyn Module {
        match self {
            AnyModule::Sine(m) => m,
            AnyModule::Adsr(m) => m,
            AnyModule::BiquadLp(m) => m,
            AnyModule::Distortion(m) => m,
            AnyModule::Reverb(m) => m,
            AnyModule::Delay(m) => m,
            AnyModule::Lfo(m) => m,
            AnyModule::Voice(m) => m,
            AnyModule::Mixer(m) => m,
        }
    }

    #[inline]
    fn inner_mut(&mut self) -> &mut dyn Module {
        match self {
            AnyModule::Sine(m) => m,
            AnyModule::Adsr(m) => m,
            AnyModule::BiquadLp(m) => m,
            AnyModule::Distortion(m) => m,
            AnyModule::Reverb(m) => m,
            AnyModule::Delay(m) => m,
            AnyModule::Lfo(m) => m,
            AnyModule::Voice(m) => m,
            AnyModule::Mixer(m) => m,
        }
    }
}

impl Module for AnyModule {
    fn specs(&self) -> &'static [ParamSpec] {
        self.inner().specs()
    }

    fn set_param(&mut self, param: usize, value: f32, immediate: bool) {
        self.inner_mut().set_param(param, value, immediate);
    }

    fn gate(&mut self, on: bool) {
        self.inner_mut().gate(on);
    }

    fn aux_count(&self) -> usize {
        self.inner().aux_count()
    }

    fn process(&mut self, input: &[f32], output: &mut [f32]) {
        // The match in inner_mut devirtualizes per variant; the dyn bounce
        // exists only to avoid repeating the nine-arm match per method.
        self.inner_mut().process(input, output);
    }

    fn process_aux(&mut self, input: &[f32], output: &mut [f32], aux: &mut [&mut [f32]]) {
        self.inner_mut().process_aux(input, output, aux);
    }

    fn reset(&mut self) {
        self.inner_mut().reset();
    }
}
