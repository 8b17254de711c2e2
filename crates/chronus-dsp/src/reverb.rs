//! Algorithmic reverb: parallel damped combs into series allpasses.

use crate::module::Module;
use crate::smooth::Smoothed;
use chronus_protocol::params::REVERB_PARAMS;
use chronus_protocol::{ModuleKind, ParamSpec, module_param_specs};

/// Comb delay lengths in samples at 44.1 kHz; scaled to the actual rate.
const COMB_TUNINGS: [usize; 4] = [1116, 1188, 1277, 1356];

/// Allpass delay lengths in samples at 44.1 kHz.
const ALLPASS_TUNINGS: [usize; 2] = [556, 441];

const ALLPASS_FEEDBACK: f32 = 0.5;

/// Room size maps onto comb feedback in [0.7, 0.98].
const ROOM_SCALE: f32 = 0.28;
const ROOM_OFFSET: f32 = 0.7;

/// Damping maps onto the comb's internal lowpass coefficient.
const DAMP_SCALE: f32 = 0.4;

struct Comb {
    buffer: Vec<f32>,
    index: usize,
    filter_store: f32,
}

impl Comb {
    fn new(len: usize) -> Self {
        Self {
            buffer: vec![0.0; len.max(1)],
            index: 0,
            filter_store: 0.0,
        }
    }

    #[inline]
    fn tick(&mut self, input: f32, feedback: f32, damp: f32) -> f32 {
        let out = self.buffer[self.index];
        self.filter_store = out * (1.0 - damp) + self.filter_store * damp;
        self.buffer[self.index] = input + self.filter_store * feedback;
        self.index = (self.index + 1) % self.buffer.len();
        out
    }

    fn reset(&mut self) {
        self.buffer.fill(0.0);
        self.filter_store = 0.0;
        self.index = 0;
    }
}

struct Allpass {
    buffer: Vec<f32>,
    index: usize,
}

impl Allpass {
    fn new(len: usize) -> Self {
        Self {
            buffer: vec![0.0; len.max(1)],
            index: 0,
        }
    }

    #[inline]
    fn tick(&mut self, input: f32) -> f32 {
        let buffered = self.buffer[self.index];
        let out = -input + buffered;
        self.buffer[self.index] = input + buffered * ALLPASS_FEEDBACK;
        self.index = (self.index + 1) % self.buffer.len();
        out
    }

    fn reset(&mut self) {
        self.buffer.fill(0.0);
        self.index = 0;
    }
}

pub struct Reverb {
    mix: Smoothed,
    room: Smoothed,
    damp: Smoothed,
    combs: [Comb; 4],
    allpasses: [Allpass; 2],
}

impl Reverb {
    pub fn new(sample_rate: f32) -> Self {
        let p = REVERB_PARAMS;
        let scale = sample_rate / 44100.0;
        let scaled = |len: usize| ((len as f32 * scale) as usize).max(1);
        Self {
            mix: Smoothed::new(p[0].default, p[0].smooth_samples(sample_rate)),
            room: Smoothed::new(p[1].default, p[1].smooth_samples(sample_rate)),
            damp: Smoothed::new(p[2].default, p[2].smooth_samples(sample_rate)),
            combs: [
                Comb::new(scaled(COMB_TUNINGS[0])),
                Comb::new(scaled(COMB_TUNINGS[1])),
                Comb::new(scaled(COMB_TUNINGS[2])),
                Comb::new(scaled(COMB_TUNINGS[3])),
            ],
            allpasses: [
                Allpass::new(scaled(ALLPASS_TUNINGS[0])),
                Allpass::new(scaled(ALLPASS_TUNINGS[1])),
            ],
        }
    }
}

impl Module for Reverb {
    fn specs(&self) -> &'static [ParamSpec] {
        module_param_specs(ModuleKind::Reverb)
    }

    fn set_param(&mut self, param: usize, value: f32, immediate: bool) {
        let Some(spec) = self.specs().get(param) else {
            return;
        };
        let value = spec.clamp(value);
        let target = match param {
            0 => &mut self.mix,
            1 => &mut self.room,
            _ => &mut self.damp,
        };
        if immediate {
            target.set_immediate(value);
        } else {
            target.set_target(value);
        }
    }

    fn process(&mut self, input: &[f32], output: &mut [f32]) {
        let n = output.len();
        let mix = self.mix.begin_buffer(n);
        let feedback = ROOM_OFFSET + ROOM_SCALE * self.room.begin_buffer(n);
        let damp = DAMP_SCALE * self.damp.begin_buffer(n);

        for (i, out) in output.iter_mut().enumerate() {
            let dry = input.get(i).copied().unwrap_or(0.0);
            let mut wet = 0.0;
            for comb in &mut self.combs {
                wet += comb.tick(dry, feedback, damp);
            }
            wet *= 0.25;
            for allpass in &mut self.allpasses {
                wet = allpass.tick(wet);
            }
            *out = dry * (1.0 - mix) + wet * mix;
        }
    }

    fn reset(&mut self) {
        for comb in &mut self.combs {
            comb.reset();
        }
        for allpass in &mut self.allpasses {
            allpass.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SR: f32 = 44100.0;

    fn impulse_response(room: f32, damp: f32, seconds: f32) -> Vec<f32> {
        let mut reverb = Reverb::new(SR);
        reverb.set_param(0, 1.0, true);
        reverb.set_param(1, room, true);
        reverb.set_param(2, damp, true);
        let n = (seconds * SR) as usize;
        let mut input = vec![0.0; n];
        input[0] = 1.0;
        let mut out = vec![0.0; n];
        for (chunk_in, chunk_out) in input.chunks(256).zip(out.chunks_mut(256)) {
            reverb.process(chunk_in, chunk_out);
        }
        out
    }

    #[test]
    fn impulse_produces_tail() {
        let ir = impulse_response(0.5, 0.5, 1.0);
        let late = &ir[22050..];
        assert!(late.iter().any(|s| s.abs() > 1e-5), "no late reflections");
    }

    #[test]
    fn tail_decays() {
        let ir = impulse_response(0.5, 0.5, 3.0);
        let early: f32 = ir[..4410].iter().map(|s| s * s).sum();
        let late: f32 = ir[ir.len() - 4410..].iter().map(|s| s * s).sum();
        assert!(late < early * 0.01);
    }

    #[test]
    fn stays_bounded_at_max_room() {
        let ir = impulse_response(1.0, 0.0, 3.0);
        assert!(ir.iter().all(|s| s.is_finite() && s.abs() < 10.0));
    }

    #[test]
    fn dry_mix_is_identity() {
        let mut reverb = Reverb::new(SR);
        reverb.set_param(0, 0.0, true);
        let input: Vec<f32> = (0..4096).map(|i| (i as f32 * 0.01).sin()).collect();
        let mut out = vec![0.0; 4096];
        for (chunk_in, chunk_out) in input.chunks(256).zip(out.chunks_mut(256)) {
            reverb.process(chunk_in, chunk_out);
        }
        for (x, y) in input[1024..].iter().zip(&out[1024..]) {
            assert!((x - y).abs() < 1e-4);
        }
    }

    #[test]
    fn damping_darkens_tail() {
        let bright = impulse_response(0.8, 0.0, 1.0);
        let dark = impulse_response(0.8, 1.0, 1.0);
        let energy = |ir: &[f32]| ir[11025..].iter().map(|s| s * s).sum::<f32>();
        assert!(energy(&dark) < energy(&bright));
    }
}
