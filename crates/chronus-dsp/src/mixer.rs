//! Summing mixer with a smoothed master gain.
//!
//! Edge summation happens in the host (every source feeding a module is
//! accumulated into its input buffer), so the mixer itself only applies the
//! master gain to the pre-summed bus.

use crate::module::Module;
use crate::smooth::Smoothed;
use chronus_protocol::params::MIXER_PARAMS;
use chronus_protocol::{ModuleKind, ParamSpec, module_param_specs};

pub struct Mixer {
    gain: Smoothed,
}

impl Mixer {
    pub fn new(sample_rate: f32) -> Self {
        let p = MIXER_PARAMS;
        Self {
            gain: Smoothed::new(p[0].default, p[0].smooth_samples(sample_rate)),
        }
    }
}

impl Module for Mixer {
    fn specs(&self) -> &'static [ParamSpec] {
        module_param_specs(ModuleKind::Mixer)
    }

    fn set_param(&mut self, param: usize, value: f32, immediate: bool) {
        let Some(spec) = self.specs().get(param) else {
            return;
        };
        let value = spec.clamp(value);
        if immediate {
            self.gain.set_immediate(value);
        } else {
            self.gain.set_target(value);
        }
    }

    fn process(&mut self, input: &[f32], output: &mut [f32]) {
        let gain = self.gain.begin_buffer(output.len());
        for (i, out) in output.iter_mut().enumerate() {
            *out = input.get(i).copied().unwrap_or(0.0) * gain;
        }
    }

    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applies_gain() {
        let mut mixer = Mixer::new(44100.0);
        mixer.set_param(0, 0.5, true);
        let input = vec![0.8; 256];
        let mut out = vec![0.0; 256];
        mixer.process(&input, &mut out);
        assert!(out.iter().all(|s| (s - 0.4).abs() < 1e-6));
    }

    #[test]
    fn gain_clamps_to_range() {
        let mut mixer = Mixer::new(44100.0);
        mixer.set_param(0, 4.0, true);
        let input = vec![1.0; 64];
        let mut out = vec![0.0; 64];
        mixer.process(&input, &mut out);
        assert!(out.iter().all(|s| *s <= 1.0));
    }
}
