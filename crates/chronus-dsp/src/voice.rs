//! Polyphony unit: oscillator -> envelope -> filter with effect sends.

use crate::biquad::BiquadLp;
use crate::envelope::Adsr;
use crate::module::Module;
use crate::oscillator::SineOsc;
use crate::smooth::Smoothed;
use chronus_protocol::params::VOICE_PARAMS;
use chronus_protocol::{ModuleKind, ParamSpec, module_param_specs};

/// One synthesizer voice.
///
/// The internal chain is a sine oscillator into an ADSR into a lowpass
/// biquad, scaled by `amp`. Besides the main output the voice fills two send
/// taps (aux ports 1 and 2) feeding the reverb and delay buses. The voice's
/// own input is forwarded to the oscillator as ratio FM.
pub struct Voice {
    osc: SineOsc,
    env: Adsr,
    filter: BiquadLp,
    amp: Smoothed,
    send_reverb: Smoothed,
    send_delay: Smoothed,
    scratch_a: Vec<f32>,
    scratch_b: Vec<f32>,
}

impl Voice {
    pub fn new(sample_rate: f32, max_block: usize) -> Self {
        let p = VOICE_PARAMS;
        let mut osc = SineOsc::new(sample_rate);
        let mut filter = BiquadLp::new(sample_rate);
        // The voice table declares its own defaults for the inner modules.
        osc.set_param(0, p[0].default, true);
        osc.set_param(1, 1.0, true);
        filter.set_param(0, p[2].default, true);
        filter.set_param(1, p[3].default, true);
        Self {
            osc,
            env: Adsr::new(sample_rate),
            filter,
            amp: Smoothed::new(p[1].default, p[1].smooth_samples(sample_rate)),
            send_reverb: Smoothed::new(p[8].default, p[8].smooth_samples(sample_rate)),
            send_delay: Smoothed::new(p[9].default, p[9].smooth_samples(sample_rate)),
            scratch_a: vec![0.0; max_block],
            scratch_b: vec![0.0; max_block],
        }
    }
}

impl Module for Voice {
    fn specs(&self) -> &'static [ParamSpec] {
        module_param_specs(ModuleKind::Voice)
    }

    fn set_param(&mut self, param: usize, value: f32, immediate: bool) {
        let Some(spec) = self.specs().get(param) else {
            return;
        };
        let value = spec.clamp(value);
        match param {
            0 => self.osc.set_param(0, value, immediate),
            1 => set(&mut self.amp, value, immediate),
            2 => self.filter.set_param(0, value, immediate),
            3 => self.filter.set_param(1, value, immediate),
            4..=7 => self.env.set_param(param - 4, value, immediate),
            8 => set(&mut self.send_reverb, value, immediate),
            _ => set(&mut self.send_delay, value, immediate),
        }
    }

    fn gate(&mut self, on: bool) {
        self.env.gate(on);
    }

    fn aux_count(&self) -> usize {
        2
    }

    fn process(&mut self, input: &[f32], output: &mut [f32]) {
        let n = output.len();
        let amp = self.amp.begin_buffer(n);
        self.send_reverb.begin_buffer(n);
        self.send_delay.begin_buffer(n);

        let a = &mut self.scratch_a[..n];
        let b = &mut self.scratch_b[..n];
        self.osc.process(input, a);
        self.env.process(a, b);
        self.filter.process(b, output);
        for out in output.iter_mut() {
            *out *= amp;
        }
    }

    fn process_aux(&mut self, input: &[f32], output: &mut [f32], aux: &mut [&mut [f32]]) {
        self.process(input, output);
        let send_r = self.send_reverb.value();
        let send_d = self.send_delay.value();
        if let Some(reverb_tap) = aux.first_mut() {
            for (tap, out) in reverb_tap.iter_mut().zip(output.iter()) {
                *tap = out * send_r;
            }
        }
        if let Some(delay_tap) = aux.get_mut(1) {
            for (tap, out) in delay_tap.iter_mut().zip(output.iter()) {
                *tap = out * send_d;
            }
        }
    }

    fn reset(&mut self) {
        self.osc.reset();
        self.env.reset();
        self.filter.reset();
    }
}

#[inline]
fn set(param: &mut Smoothed, value: f32, immediate: bool) {
    if immediate {
        param.set_immediate(value);
    } else {
        param.set_target(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: f32 = 44100.0;
    const BLOCK: usize = 256;

    fn run(voice: &mut Voice, buffers: usize) -> Vec<f32> {
        let silent = vec![0.0; BLOCK];
        let mut out = vec![0.0; BLOCK];
        let mut all = Vec::new();
        for _ in 0..buffers {
            voice.process(&silent, &mut out);
            all.extend_from_slice(&out);
        }
        all
    }

    #[test]
    fn silent_until_gated() {
        let mut voice = Voice::new(SR, BLOCK);
        let samples = run(&mut voice, 8);
        assert!(samples.iter().all(|s| s.abs() < 1e-6));
    }

    #[test]
    fn gate_produces_tone_then_release_fades() {
        let mut voice = Voice::new(SR, BLOCK);
        voice.set_param(0, 220.0, true);
        voice.gate(true);
        let sustained = run(&mut voice, 40);
        let peak = sustained.iter().copied().fold(0.0f32, |a, b| a.max(b.abs()));
        assert!(peak > 0.1);

        voice.gate(false);
        // Default release is 200 ms; half a second later the voice is idle.
        let tail = run(&mut voice, 90);
        let late = &tail[tail.len() - BLOCK..];
        assert!(late.iter().all(|s| s.abs() < 1e-4));
    }

    #[test]
    fn sends_scale_aux_taps() {
        let mut voice = Voice::new(SR, BLOCK);
        voice.set_param(0, 220.0, true);
        voice.set_param(8, 0.5, true);
        voice.set_param(9, 0.25, true);
        voice.gate(true);

        let silent = vec![0.0; BLOCK];
        let mut out = vec![0.0; BLOCK];
        let mut reverb_tap = vec![0.0; BLOCK];
        let mut delay_tap = vec![0.0; BLOCK];
        for _ in 0..20 {
            let mut aux: [&mut [f32]; 2] = [&mut reverb_tap, &mut delay_tap];
            voice.process_aux(&silent, &mut out, &mut aux);
        }
        for i in 0..BLOCK {
            assert!((reverb_tap[i] - out[i] * 0.5).abs() < 1e-5);
            assert!((delay_tap[i] - out[i] * 0.25).abs() < 1e-5);
        }
    }

    #[test]
    fn nested_param_paths_reach_inner_modules() {
        let mut voice = Voice::new(SR, BLOCK);
        // adsr/sustain
        voice.set_param(6, 0.4, true);
        voice.gate(true);
        run(&mut voice, 40);
        assert!((voice.env.level() - 0.4).abs() < 1e-3);
    }
}
