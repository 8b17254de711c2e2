//! Sine oscillator with smoothed frequency and gain.

use crate::module::Module;
use crate::smooth::Smoothed;
use chronus_protocol::params::SINE_PARAMS;
use chronus_protocol::{ModuleKind, ParamSpec, module_param_specs};
use std::f32::consts::TAU;

/// Phase-accumulator sine oscillator.
///
/// The phase increment is interpolated linearly across each buffer between
/// the previous and current smoothed frequency, so a frequency change never
/// lands as a mid-buffer discontinuity. The (normally unconnected) input is
/// a ratio FM signal: a sample of `+1.0` doubles the instantaneous
/// frequency, `-0.5` halves it.
pub struct SineOsc {
    sample_rate: f32,
    phase: f32,
    freq: Smoothed,
    gain: Smoothed,
    prev_freq: f32,
    prev_gain: f32,
}

impl SineOsc {
    pub fn new(sample_rate: f32) -> Self {
        let specs = SINE_PARAMS;
        let freq = Smoothed::new(specs[0].default, specs[0].smooth_samples(sample_rate));
        let gain = Smoothed::new(specs[1].default, specs[1].smooth_samples(sample_rate));
        Self {
            sample_rate,
            phase: 0.0,
            prev_freq: freq.value(),
            prev_gain: gain.value(),
            freq,
            gain,
        }
    }
}

impl Module for SineOsc {
    fn specs(&self) -> &'static [ParamSpec] {
        module_param_specs(ModuleKind::Sine)
    }

    fn set_param(&mut self, param: usize, value: f32, immediate: bool) {
        let Some(spec) = self.specs().get(param) else {
            return;
        };
        let value = spec.clamp(value);
        let target = match param {
            0 => &mut self.freq,
            _ => &mut self.gain,
        };
        if immediate {
            target.set_immediate(value);
        } else {
            target.set_target(value);
        }
    }

    fn process(&mut self, input: &[f32], output: &mut [f32]) {
        let n = output.len();
        let f0 = self.prev_freq;
        let f1 = self.freq.begin_buffer(n);
        let g0 = self.prev_gain;
        let g1 = self.gain.begin_buffer(n);
        self.prev_freq = f1;
        self.prev_gain = g1;

        let step = 1.0 / n as f32;
        let mut t = 0.0;
        for (i, out) in output.iter_mut().enumerate() {
            let freq = f0 + (f1 - f0) * t;
            let gain = g0 + (g1 - g0) * t;
            // Ratio FM from the input buffer; zero input leaves pitch alone.
            let fm = input.get(i).copied().unwrap_or(0.0);
            let eff = (freq * (1.0 + fm)).max(0.0);
            *out = gain * self.phase.sin();
            self.phase += TAU * eff / self.sample_rate;
            if self.phase >= TAU {
                self.phase -= TAU;
            }
            t += step;
        }
    }

    fn reset(&mut self) {
        self.phase = 0.0;
    }
}
