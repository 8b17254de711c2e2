//! Waveshaping distortion with sub-bass safety conditioning.
//!
//! Chain: 20 Hz fourth-order highpass -> drive waveshaper -> hard clip ->
//! DC blocker -> tone lowpass -> dry/wet mix. The highpass keeps subsonic
//! energy out of the shaper and the epsilon guard on the shaper denominator
//! keeps low-drive sub-bass input from collapsing into NaN.

use crate::biquad::{Coefficients, Section};
use crate::module::Module;
use crate::smooth::Smoothed;
use chronus_protocol::params::DISTORTION_PARAMS;
use chronus_protocol::{ModuleKind, ParamSpec, module_param_specs};
use std::f32::consts::TAU;

/// Denominator guard for the waveshaper.
const SHAPER_EPSILON: f32 = 1e-6;

/// Butterworth Q values for a fourth-order highpass split into two biquads.
const BUTTERWORTH_Q: [f32; 2] = [0.541_196_1, 1.306_563_0];

/// Subsonic cutoff for the input conditioning highpass.
const HIGHPASS_HZ: f32 = 20.0;

/// One-pole DC blocker feedback coefficient.
const DC_BLOCK_R: f32 = 0.995;

/// Soft-knee threshold: drive beyond this is halved to keep the shaper slope
/// out of its oscillatory region.
const KNEE: f32 = 0.7;

pub struct Distortion {
    sample_rate: f32,
    drive: Smoothed,
    mix: Smoothed,
    tone: Smoothed,
    hp_coeffs: [Coefficients; 2],
    hp_sections: [Section; 2],
    // DC blocker state.
    dc_x1: f32,
    dc_y1: f32,
    // Tone lowpass state and per-buffer coefficient.
    tone_state: f32,
    tone_coeff: f32,
}

impl Distortion {
    pub fn new(sample_rate: f32) -> Self {
        let p = DISTORTION_PARAMS;
        Self {
            sample_rate,
            drive: Smoothed::new(p[0].default, p[0].smooth_samples(sample_rate)),
            mix: Smoothed::new(p[1].default, p[1].smooth_samples(sample_rate)),
            tone: Smoothed::new(p[2].default, p[2].smooth_samples(sample_rate)),
            hp_coeffs: [
                Coefficients::highpass(sample_rate, HIGHPASS_HZ, BUTTERWORTH_Q[0]),
                Coefficients::highpass(sample_rate, HIGHPASS_HZ, BUTTERWORTH_Q[1]),
            ],
            hp_sections: [Section::default(), Section::default()],
            dc_x1: 0.0,
            dc_y1: 0.0,
            tone_state: 0.0,
            tone_coeff: 0.0,
        }
    }

    /// Effective drive after the soft knee.
    #[inline]
    fn effective_drive(drive: f32) -> f32 {
        if drive > KNEE {
            KNEE + 0.5 * (drive - KNEE)
        } else {
            drive
        }
    }

    #[inline]
    fn shape(x: f32, k: f32) -> f32 {
        let denom = (1.0 + k * x.abs()).max(SHAPER_EPSILON);
        ((1.0 + k) * x / denom).clamp(-1.0, 1.0)
    }
}

impl Module for Distortion {
    fn specs(&self) -> &'static [ParamSpec] {
        module_param_specs(ModuleKind::Distortion)
    }

    fn set_param(&mut self, param: usize, value: f32, immediate: bool) {
        let Some(spec) = self.specs().get(param) else {
            return;
        };
        let value = spec.clamp(value);
        let target = match param {
            0 => &mut self.drive,
            1 => &mut self.mix,
            _ => &mut self.tone,
        };
        if immediate {
            target.set_immediate(value);
        } else {
            target.set_target(value);
        }
    }

    fn process(&mut self, input: &[f32], output: &mut [f32]) {
        let n = output.len();
        let drive = Self::effective_drive(self.drive.begin_buffer(n));
        let mix = self.mix.begin_buffer(n);
        let tone = self.tone.begin_buffer(n);

        // drive_eff tops out at 0.85, so the k denominator stays away from 0.
        let k = 2.0 * drive / (1.0 - drive).max(SHAPER_EPSILON);

        // Tone maps [0, 1] exponentially onto 1-8 kHz.
        let tone_hz = 1000.0 * 8.0_f32.powf(tone);
        self.tone_coeff = 1.0 - (-TAU * tone_hz / self.sample_rate).exp();

        self.hp_sections[0].flush_denormals();
        self.hp_sections[1].flush_denormals();

        for (i, out) in output.iter_mut().enumerate() {
            let dry = input.get(i).copied().unwrap_or(0.0);

            let hp_stage0 = self.hp_sections[0].tick(dry, &self.hp_coeffs[0]);
            let hp = self.hp_sections[1].tick(hp_stage0, &self.hp_coeffs[1]);

            let shaped = Self::shape(hp, k);

            // One-pole DC blocker.
            let blocked = shaped - self.dc_x1 + DC_BLOCK_R * self.dc_y1;
            self.dc_x1 = shaped;
            self.dc_y1 = blocked;

            // Tone lowpass.
            self.tone_state += self.tone_coeff * (blocked - self.tone_state);

            *out = dry * (1.0 - mix) + self.tone_state * mix;
        }
    }

    fn reset(&mut self) {
        self.hp_sections[0].reset();
        self.hp_sections[1].reset();
        self.dc_x1 = 0.0;
        self.dc_y1 = 0.0;
        self.tone_state = 0.0;
    }
}
