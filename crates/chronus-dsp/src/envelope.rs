//! Linear ADSR envelope with immediate gate input.

use crate::module::Module;
use crate::smooth::Smoothed;
use chronus_protocol::params::ADSR_PARAMS;
use chronus_protocol::{ModuleKind, ParamSpec, module_param_specs};

/// Envelope stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Attack,
    Decay,
    Sustain,
    Release,
}

/// Four-stage linear envelope applied as a per-sample multiplier.
///
/// A rising gate always restarts the envelope from level zero. That reset is
/// what keeps fast retriggers click-free: resuming an attack from a leftover
/// level produces an audible step on every retrigger.
pub struct Adsr {
    sample_rate: f32,
    stage: Stage,
    level: f32,
    gate_high: bool,
    /// Per-sample release slope, fixed at the moment the gate falls.
    release_rate: f32,
    attack_ms: Smoothed,
    decay_ms: Smoothed,
    sustain: Smoothed,
    release_ms: Smoothed,
}

impl Adsr {
    pub fn new(sample_rate: f32) -> Self {
        let p = ADSR_PARAMS;
        Self {
            sample_rate,
            stage: Stage::Idle,
            level: 0.0,
            gate_high: false,
            release_rate: 0.0,
            attack_ms: Smoothed::new(p[0].default, 0.0),
            decay_ms: Smoothed::new(p[1].default, 0.0),
            sustain: Smoothed::new(p[2].default, 0.0),
            release_ms: Smoothed::new(p[3].default, 0.0),
        }
    }

    /// Current envelope stage.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Current envelope level in [0, 1].
    pub fn level(&self) -> f32 {
        self.level
    }

    #[inline]
    fn ms_to_samples(&self, ms: f32) -> f32 {
        // Parameter floors guarantee ms >= 1, so the division is safe.
        ms * 1e-3 * self.sample_rate
    }
}

impl Module for Adsr {
    fn specs(&self) -> &'static [ParamSpec] {
        module_param_specs(ModuleKind::Adsr)
    }

    fn set_param(&mut self, param: usize, value: f32, immediate: bool) {
        let Some(spec) = self.specs().get(param) else {
            return;
        };
        let value = spec.clamp(value);
        let target = match param {
            0 => &mut self.attack_ms,
            1 => &mut self.decay_ms,
            2 => &mut self.sustain,
            _ => &mut self.release_ms,
        };
        if immediate {
            target.set_immediate(value);
        } else {
            target.set_target(value);
        }
    }

    fn gate(&mut self, on: bool) {
        if on && !self.gate_high {
            self.stage = Stage::Attack;
            self.level = 0.0;
        } else if !on && self.gate_high {
            if matches!(self.stage, Stage::Attack | Stage::Decay | Stage::Sustain) {
                self.stage = Stage::Release;
                let samples = self.ms_to_samples(self.release_ms.target());
                self.release_rate = self.level / samples.max(1.0);
            }
        }
        self.gate_high = on;
    }

    fn process(&mut self, input: &[f32], output: &mut [f32]) {
        let n = output.len();
        let attack = self.attack_ms.begin_buffer(n);
        let decay = self.decay_ms.begin_buffer(n);
        let sustain = self.sustain.begin_buffer(n);
        self.release_ms.begin_buffer(n);

        let attack_rate = 1.0 / self.ms_to_samples(attack).max(1.0);
        let decay_rate = (1.0 - sustain) / self.ms_to_samples(decay).max(1.0);

        for (i, out) in output.iter_mut().enumerate() {
            match self.stage {
                Stage::Idle => {
                    self.level = 0.0;
                }
                Stage::Attack => {
                    self.level += attack_rate;
                    if self.level >= 1.0 {
                        self.level = 1.0;
                        self.stage = Stage::Decay;
                    }
                }
                Stage::Decay => {
                    self.level -= decay_rate;
                    if self.level <= sustain {
                        self.level = sustain;
                        self.stage = Stage::Sustain;
                    }
                }
                Stage::Sustain => {
                    self.level = sustain;
                }
                Stage::Release => {
                    self.level -= self.release_rate;
                    if self.level <= 0.0 {
                        self.level = 0.0;
                        self.stage = Stage::Idle;
                    }
                }
            }
            *out = input.get(i).copied().unwrap_or(0.0) * self.level;
        }
    }

    fn reset(&mut self) {
        self.stage = Stage::Idle;
        self.level = 0.0;
        self.gate_high = false;
        self.release_rate = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: f32 = 44100.0;

    fn ones(n: usize) -> Vec<f32> {
        vec![1.0; n]
    }

    fn configure(env: &mut Adsr, a: f32, d: f32, s: f32, r: f32) {
        env.set_param(0, a, true);
        env.set_param(1, d, true);
        env.set_param(2, s, true);
        env.set_param(3, r, true);
    }

    #[test]
    fn walks_through_all_stages() {
        let mut env = Adsr::new(SR);
        configure(&mut env, 10.0, 50.0, 0.7, 200.0);
        env.gate(true);
        assert_eq!(env.stage(), Stage::Attack);

        let input = ones(256);
        let mut out = vec![0.0; 256];
        // 10 ms attack + 50 ms decay fit well inside 30 buffers.
        for _ in 0..30 {
            env.process(&input, &mut out);
        }
        assert_eq!(env.stage(), Stage::Sustain);
        assert!((env.level() - 0.7).abs() < 1e-3);

        env.gate(false);
        assert_eq!(env.stage(), Stage::Release);
        // 200 ms release: 250 ms of buffers must reach silence.
        for _ in 0..44 {
            env.process(&input, &mut out);
        }
        assert_eq!(env.stage(), Stage::Idle);
        assert_eq!(env.level(), 0.0);
    }

    #[test]
    fn attack_peak_reaches_unity() {
        let mut env = Adsr::new(SR);
        configure(&mut env, 10.0, 50.0, 0.7, 200.0);
        env.gate(true);
        let input = ones(256);
        let mut out = vec![0.0; 256];
        let mut peak = 0.0f32;
        for _ in 0..30 {
            env.process(&input, &mut out);
            peak = peak.max(out.iter().copied().fold(0.0, f32::max));
        }
        assert!((0.95..=1.0).contains(&peak));
    }

    #[test]
    fn retrigger_restarts_from_zero() {
        let mut env = Adsr::new(SR);
        configure(&mut env, 10.0, 50.0, 0.7, 200.0);
        env.gate(true);
        let input = ones(256);
        let mut out = vec![0.0; 256];
        for _ in 0..30 {
            env.process(&input, &mut out);
        }
        assert!(env.level() > 0.5);

        // Retrigger while sustaining: the very next sample starts from zero.
        env.gate(false);
        env.gate(true);
        env.process(&input, &mut out);
        let first_rate = 1.0 / (0.010 * SR);
        assert!(out[0] <= first_rate * 1.5, "retrigger clicked: {}", out[0]);
    }

    #[test]
    fn release_from_mid_attack_decays_to_silence() {
        let mut env = Adsr::new(SR);
        configure(&mut env, 1000.0, 50.0, 0.7, 50.0);
        env.gate(true);
        let input = ones(256);
        let mut out = vec![0.0; 256];
        env.process(&input, &mut out);
        assert_eq!(env.stage(), Stage::Attack);
        env.gate(false);
        for _ in 0..12 {
            env.process(&input, &mut out);
        }
        assert_eq!(env.stage(), Stage::Idle);
    }

    #[test]
    fn idle_envelope_outputs_silence() {
        let mut env = Adsr::new(SR);
        let input = ones(64);
        let mut out = vec![1.0; 64];
        env.process(&input, &mut out);
        assert!(out.iter().all(|s| *s == 0.0));
    }
}
