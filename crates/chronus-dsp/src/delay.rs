//! Feedback delay line.

use crate::module::Module;
use crate::smooth::Smoothed;
use chronus_protocol::params::DELAY_PARAMS;
use chronus_protocol::{ModuleKind, ParamSpec, module_param_specs};

/// Maximum delay time the line must hold.
const MAX_DELAY_SECONDS: f32 = 0.6;

/// Absolute feedback ceiling; the parameter range also enforces this, the
/// runtime clamp guards against a future range widening.
const FEEDBACK_CAP: f32 = 0.7;

pub struct Delay {
    sample_rate: f32,
    time: Smoothed,
    feedback: Smoothed,
    mix: Smoothed,
    line: Vec<f32>,
    write: usize,
}

impl Delay {
    pub fn new(sample_rate: f32) -> Self {
        let p = DELAY_PARAMS;
        let len = (MAX_DELAY_SECONDS * sample_rate).ceil() as usize + 1;
        Self {
            sample_rate,
            time: Smoothed::new(p[0].default, p[0].smooth_samples(sample_rate)),
            feedback: Smoothed::new(p[1].default, p[1].smooth_samples(sample_rate)),
            mix: Smoothed::new(p[2].default, p[2].smooth_samples(sample_rate)),
            line: vec![0.0; len],
            write: 0,
        }
    }
}

impl Module for Delay {
    fn specs(&self) -> &'static [ParamSpec] {
        module_param_specs(ModuleKind::Delay)
    }

    fn set_param(&mut self, param: usize, value: f32, immediate: bool) {
        let Some(spec) = self.specs().get(param) else {
            return;
        };
        let value = spec.clamp(value);
        let target = match param {
            0 => &mut self.time,
            1 => &mut self.feedback,
            _ => &mut self.mix,
        };
        if immediate {
            target.set_immediate(value);
        } else {
            target.set_target(value);
        }
    }

    fn process(&mut self, input: &[f32], output: &mut [f32]) {
        let n = output.len();
        let time = self.time.begin_buffer(n);
        let feedback = self.feedback.begin_buffer(n).min(FEEDBACK_CAP);
        let mix = self.mix.begin_buffer(n);

        let len = self.line.len();
        let delay_samples = ((time * self.sample_rate) as usize).clamp(1, len - 1);

        for (i, out) in output.iter_mut().enumerate() {
            let dry = input.get(i).copied().unwrap_or(0.0);
            let read = (self.write + len - delay_samples) % len;
            let wet = self.line[read];
            self.line[self.write] = dry + wet * feedback;
            self.write = (self.write + 1) % len;
            *out = dry * (1.0 - mix) + wet * mix;
        }
    }

    fn reset(&mut self) {
        self.line.fill(0.0);
        self.write = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: f32 = 44100.0;

    fn run(delay: &mut Delay, input: &[f32]) -> Vec<f32> {
        let mut out = vec![0.0; input.len()];
        for (chunk_in, chunk_out) in input.chunks(256).zip(out.chunks_mut(256)) {
            delay.process(chunk_in, chunk_out);
        }
        out
    }

    #[test]
    fn echo_lands_at_configured_time() {
        let mut delay = Delay::new(SR);
        delay.set_param(0, 0.25, true);
        delay.set_param(1, 0.0, true);
        delay.set_param(2, 1.0, true);
        let mut input = vec![0.0; 22050];
        input[0] = 1.0;
        let out = run(&mut delay, &input);
        let expected = (0.25 * SR) as usize;
        let peak = out
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))
            .map(|(i, _)| i)
            .unwrap();
        assert!(peak.abs_diff(expected) <= 1);
    }

    #[test]
    fn max_feedback_remains_bounded() {
        let mut delay = Delay::new(SR);
        delay.set_param(0, 0.1, true);
        delay.set_param(1, 0.7, true);
        delay.set_param(2, 1.0, true);
        // 10 seconds of sustained input at the feedback cap must converge,
        // not run away: geometric series bounds the wet sum at 1/(1-0.7).
        let input = vec![0.5; 10 * 44100];
        let out = run(&mut delay, &input);
        assert!(out.iter().all(|s| s.is_finite() && s.abs() < 2.0));
    }

    #[test]
    fn dry_mix_is_identity() {
        let mut delay = Delay::new(SR);
        delay.set_param(2, 0.0, true);
        let input: Vec<f32> = (0..4096).map(|i| (i as f32 * 0.02).sin()).collect();
        let out = run(&mut delay, &input);
        for (x, y) in input[1024..].iter().zip(&out[1024..]) {
            assert!((x - y).abs() < 1e-4);
        }
    }

    #[test]
    fn reset_clears_the_line() {
        let mut delay = Delay::new(SR);
        delay.set_param(2, 1.0, true);
        let input = vec![1.0; 44100];
        run(&mut delay, &input);
        delay.reset();
        let silent = vec![0.0; 44100];
        let out = run(&mut delay, &silent);
        assert!(out.iter().all(|s| *s == 0.0));
    }
}
