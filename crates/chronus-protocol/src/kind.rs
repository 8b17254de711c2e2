//! Module kind registry - the closed set of DSP module variants.
//!
//! The patch graph is built from a fixed set of module kinds tagged by this
//! enum. Workers receive kinds as `u16` tags inside fixed-size command
//! records and instantiate modules through a factory keyed on the tag, so the
//! hot path never goes through string lookups or boxed trait objects.

/// Every module type the engine can instantiate.
///
/// The `#[repr(u16)]` discriminants are the wire tags carried by
/// `GraphCreate` commands and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ModuleKind {
    /// Sine oscillator with smoothed frequency and gain.
    Sine = 0,
    /// Linear ADSR envelope with immediate gate input.
    Adsr = 1,
    /// Lowpass biquad filter (transposed direct form II).
    BiquadLp = 2,
    /// Waveshaping distortion with sub-bass safety chain.
    Distortion = 3,
    /// Comb/allpass algorithmic reverb.
    Reverb = 4,
    /// Feedback delay line.
    Delay = 5,
    /// Free-running low-frequency oscillator.
    Lfo = 6,
    /// Polyphony unit: oscillator -> ADSR -> filter with effect sends.
    Voice = 7,
    /// Summing mixer with master gain.
    Mixer = 8,
}

impl ModuleKind {
    /// All kinds in tag order.
    pub const ALL: &'static [ModuleKind] = &[
        ModuleKind::Sine,
        ModuleKind::Adsr,
        ModuleKind::BiquadLp,
        ModuleKind::Distortion,
        ModuleKind::Reverb,
        ModuleKind::Delay,
        ModuleKind::Lfo,
        ModuleKind::Voice,
        ModuleKind::Mixer,
    ];

    /// Wire tag for command records.
    #[inline]
    pub fn tag(self) -> u16 {
        self as u16
    }

    /// Decode a wire tag. Unknown tags are rejected rather than defaulted;
    /// a worker must never instantiate a module the supervisor did not name.
    pub fn from_tag(tag: u16) -> Option<Self> {
        Self::ALL.get(tag as usize).copied()
    }

    /// Canonical type name used on the OSC surface (`/patch/create <id> <type>`).
    pub fn type_name(self) -> &'static str {
        match self {
            ModuleKind::Sine => "sine",
            ModuleKind::Adsr => "adsr",
            ModuleKind::BiquadLp => "biquad_lp",
            ModuleKind::Distortion => "dist",
            ModuleKind::Reverb => "reverb",
            ModuleKind::Delay => "delay",
            ModuleKind::Lfo => "lfo",
            ModuleKind::Voice => "voice",
            ModuleKind::Mixer => "mixer",
        }
    }

    /// Parse an OSC type name, accepting the common aliases.
    pub fn from_type_name(name: &str) -> Option<Self> {
        match name {
            "sine" | "osc" | "oscillator" => Some(ModuleKind::Sine),
            "adsr" | "env" | "envelope" => Some(ModuleKind::Adsr),
            "biquad_lp" | "lowpass" | "filter" => Some(ModuleKind::BiquadLp),
            "dist" | "distortion" => Some(ModuleKind::Distortion),
            "reverb" => Some(ModuleKind::Reverb),
            "delay" => Some(ModuleKind::Delay),
            "lfo" => Some(ModuleKind::Lfo),
            "voice" => Some(ModuleKind::Voice),
            "mixer" => Some(ModuleKind::Mixer),
            _ => None,
        }
    }
}
