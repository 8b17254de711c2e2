//! Lowpass biquad filter, transposed direct form II.

use crate::module::Module;
use crate::smooth::Smoothed;
use chronus_protocol::params::BIQUAD_LP_PARAMS;
use chronus_protocol::{ModuleKind, ParamSpec, module_param_specs};
use std::f32::consts::TAU;

/// Injected into the state variables at every buffer start, alternating in
/// sign, so decaying tails never reach the denormal range, where per-sample
/// cost explodes.
const DENORMAL_OFFSET: f32 = 1.0e-18;

/// Normalized biquad coefficients.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Coefficients {
    pub b0: f32,
    pub b1: f32,
    pub b2: f32,
    pub a1: f32,
    pub a2: f32,
}

impl Coefficients {
    /// RBJ cookbook lowpass. The bilinear transform's tan pre-warp is folded
    /// into the sin/cos of the normalized frequency.
    pub fn lowpass(sample_rate: f32, cutoff: f32, q: f32) -> Self {
        let omega = TAU * cutoff / sample_rate;
        let (sin_w, cos_w) = omega.sin_cos();
        let alpha = sin_w / (2.0 * q.max(1e-3));
        let a0 = 1.0 + alpha;
        Self {
            b0: ((1.0 - cos_w) / 2.0) / a0,
            b1: (1.0 - cos_w) / a0,
            b2: ((1.0 - cos_w) / 2.0) / a0,
            a1: (-2.0 * cos_w) / a0,
            a2: (1.0 - alpha) / a0,
        }
    }

    /// RBJ cookbook highpass, used by the distortion input conditioning.
    pub fn highpass(sample_rate: f32, cutoff: f32, q: f32) -> Self {
        let omega = TAU * cutoff / sample_rate;
        let (sin_w, cos_w) = omega.sin_cos();
        let alpha = sin_w / (2.0 * q.max(1e-3));
        let a0 = 1.0 + alpha;
        Self {
            b0: ((1.0 + cos_w) / 2.0) / a0,
            b1: (-(1.0 + cos_w)) / a0,
            b2: ((1.0 + cos_w) / 2.0) / a0,
            a1: (-2.0 * cos_w) / a0,
            a2: (1.0 - alpha) / a0,
        }
    }
}

/// Two-scalar transposed direct form II section.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Section {
    z1: f32,
    z2: f32,
    /// Flipped each buffer so the injected offset alternates sign and
    /// cannot accumulate as DC.
    flip: bool,
}

impl Section {
    #[inline]
    pub fn flush_denormals(&mut self) {
        let offset = if self.flip {
            -DENORMAL_OFFSET
        } else {
            DENORMAL_OFFSET
        };
        self.z1 += offset;
        self.z2 += offset;
        self.flip = !self.flip;
    }

    #[inline]
    pub fn tick(&mut self, x: f32, c: &Coefficients) -> f32 {
        let y = c.b0 * x + self.z1;
        self.z1 = c.b1 * x - c.a1 * y + self.z2;
        self.z2 = c.b2 * x - c.a2 * y;
        y
    }

    pub fn reset(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
        self.flip = false;
    }
}

/// Lowpass biquad module. Coefficients are recomputed once per buffer from
/// the smoothed cutoff and Q.
pub struct BiquadLp {
    sample_rate: f32,
    cutoff: Smoothed,
    q: Smoothed,
    coeffs: Coefficients,
    section: Section,
}

impl BiquadLp {
    pub fn new(sample_rate: f32) -> Self {
        let p = BIQUAD_LP_PARAMS;
        let cutoff = Smoothed::new(p[0].default, p[0].smooth_samples(sample_rate));
        let q = Smoothed::new(p[1].default, p[1].smooth_samples(sample_rate));
        Self {
            sample_rate,
            coeffs: Coefficients::lowpass(sample_rate, cutoff.value(), q.value()),
            cutoff,
            q,
            section: Section::default(),
        }
    }
}

impl Module for BiquadLp {
    fn specs(&self) -> &'static [ParamSpec] {
        module_param_specs(ModuleKind::BiquadLp)
    }

    fn set_param(&mut self, param: usize, value: f32, immediate: bool) {
        let Some(spec) = self.specs().get(param) else {
            return;
        };
        let value = spec.clamp(value);
        let target = match param {
            0 => &mut self.cutoff,
            _ => &mut self.q,
        };
        if immediate {
            target.set_immediate(value);
        } else {
            target.set_target(value);
        }
    }

    fn process(&mut self, input: &[f32], output: &mut [f32]) {
        let n = output.len();
        let cutoff = self.cutoff.begin_buffer(n);
        let q = self.q.begin_buffer(n);
        self.coeffs = Coefficients::lowpass(self.sample_rate, cutoff, q);
        self.section.flush_denormals();

        for (i, out) in output.iter_mut().enumerate() {
            let x = input.get(i).copied().unwrap_or(0.0);
            *out = self.section.tick(x, &self.coeffs);
        }
    }

    fn reset(&mut self) {
        self.section.reset();
    }
}
