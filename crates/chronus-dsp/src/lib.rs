//! DSP crate - pure audio processing modules.
//!
//! This crate contains all per-sample DSP without any I/O or threading
//! dependencies, making it fully testable in isolation. Modules share the
//! contract in [`module::Module`]: `process` fills its output with exactly
//! `n` samples, never allocates, never blocks, and reads smoothed parameters
//! once per buffer.

pub mod biquad;
pub mod delay;
pub mod distortion;
pub mod envelope;
pub mod lfo;
pub mod mixer;
pub mod module;
pub mod oscillator;
pub mod reverb;
pub mod smooth;
pub mod voice;

pub use biquad::BiquadLp;
pub use delay::Delay;
pub use distortion::Distortion;
pub use envelope::Adsr;
pub use lfo::Lfo;
pub use mixer::Mixer;
pub use module::{AnyModule, AUX_OUTPUTS, Module};
pub use oscillator::SineOsc;
pub use reverb::Reverb;
pub use smooth::Smoothed;
pub use voice::Voice;
