//! Step sequencer driven by the audio clock.
//!
//! The sequencer never sleeps its way to musical time: it watches the
//! callback's sample counter and enqueues gate and parameter commands one
//! buffer ahead of each step's scheduled sample position, so co-scheduled
//! tracks land in the same worker tick. Swing biases odd steps by
//! `swing * 0.5 * step_samples`.

use crate::supervisor::Supervisor;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;

/// One parsed pattern step: trigger velocity, or a rest.
pub type Step = Option<f32>;

const ACCENT_VELOCITY: f32 = 1.0;
const NORMAL_VELOCITY: f32 = 0.6;

/// Fraction of a step a gate stays high unless overridden with `gate=`.
const DEFAULT_GATE_FRAC: f32 = 0.5;

/// Parse a pattern string over {X, x, .}.
pub fn parse_pattern(text: &str) -> Result<Vec<Step>, String> {
    let mut steps = Vec::with_capacity(text.len());
    for c in text.chars() {
        match c {
            'X' => steps.push(Some(ACCENT_VELOCITY)),
            'x' => steps.push(Some(NORMAL_VELOCITY)),
            '.' => steps.push(None),
            other => return Err(format!("invalid pattern char '{other}'")),
        }
    }
    if steps.is_empty() {
        return Err("empty pattern".to_string());
    }
    Ok(steps)
}

/// Parse a note token: a frequency in Hz (> 127), a MIDI note number
/// (0-127), or a note name like `C#3` or `Bb2`.
pub fn parse_note(token: &str) -> Result<f32, String> {
    let token = token.trim();
    if let Ok(value) = token.parse::<f32>() {
        if value < 0.0 {
            return Err(format!("negative note value {value}"));
        }
        return Ok(if value > 127.0 {
            value
        } else {
            midi_to_hz(value)
        });
    }

    let mut chars = token.chars();
    let letter = chars
        .next()
        .ok_or_else(|| "empty note".to_string())?
        .to_ascii_uppercase();
    let base = match letter {
        'C' => 0,
        'D' => 2,
        'E' => 4,
        'F' => 5,
        'G' => 7,
        'A' => 9,
        'B' => 11,
        other => return Err(format!("invalid note letter '{other}'")),
    };
    let rest: String = chars.collect();
    let (accidental, octave_text) = match rest.chars().next() {
        Some('#') => (1, &rest[1..]),
        Some('b') => (-1, &rest[1..]),
        _ => (0, rest.as_str()),
    };
    let octave: i32 = octave_text
        .parse()
        .map_err(|_| format!("invalid octave in '{token}'"))?;
    // C4 is MIDI 60.
    let midi = (octave + 1) * 12 + base + accidental;
    if !(0..=127).contains(&midi) {
        return Err(format!("note '{token}' outside MIDI range"));
    }
    Ok(midi_to_hz(midi as f32))
}

#[inline]
fn midi_to_hz(midi: f32) -> f32 {
    440.0 * 2.0_f32.powf((midi - 69.0) / 12.0)
}

/// One sequenced track.
#[derive(Debug, Clone)]
pub struct Track {
    pub id: String,
    pub voice: String,
    pub steps: Vec<Step>,
    pub base_freq: f32,
    pub notes: Vec<f32>,
    pub gate_frac: f32,
    note_pos: usize,
}

impl Track {
    pub fn new(id: String, voice: String, steps: Vec<Step>, base_freq: f32) -> Self {
        Self {
            id,
            voice,
            steps,
            base_freq,
            notes: Vec::new(),
            gate_frac: DEFAULT_GATE_FRAC,
            note_pos: 0,
        }
    }
}

/// A command the sequencer wants applied at the next buffer boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum SeqEvent {
    Param {
        voice: String,
        path: &'static str,
        value: f32,
    },
    Gate {
        voice: String,
        on: bool,
    },
}

/// Pure scheduling core, driven by an externally advancing sample clock.
pub struct SeqCore {
    sample_rate: f32,
    tracks: Vec<Track>,
    bpm: f32,
    swing: f32,
    running: bool,
    /// Global 16th-note index since start.
    step_index: u64,
    /// Unswung sample time of `step_index`.
    step_sample: f64,
    pending_offs: Vec<(u64, String)>,
}

impl SeqCore {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            sample_rate,
            tracks: Vec::new(),
            bpm: 120.0,
            swing: 0.0,
            running: false,
            step_index: 0,
            step_sample: 0.0,
            pending_offs: Vec::new(),
        }
    }

    /// Samples per 16th note at the current tempo.
    fn step_samples(&self) -> f64 {
        self.sample_rate as f64 * 60.0 / self.bpm as f64 / 4.0
    }

    pub fn set_bpm(&mut self, bpm: f32) {
        self.bpm = bpm.clamp(30.0, 300.0);
    }

    pub fn set_swing(&mut self, swing: f32) {
        self.swing = swing.clamp(0.0, 0.6);
    }

    pub fn add_track(&mut self, track: Track) {
        self.remove_track(&track.id.clone());
        self.tracks.push(track);
    }

    pub fn remove_track(&mut self, id: &str) -> bool {
        let before = self.tracks.len();
        self.tracks.retain(|t| t.id != id);
        self.tracks.len() != before
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
    }

    pub fn track_mut(&mut self, id: &str) -> Option<&mut Track> {
        self.tracks.iter_mut().find(|t| t.id == id)
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Begin playing; the first step lands at `now` rounded up to the next
    /// buffer boundary by the caller's scheduling window.
    pub fn start(&mut self, now: u64) {
        self.running = true;
        self.step_index = 0;
        self.step_sample = now as f64;
        self.pending_offs.clear();
        for track in &mut self.tracks {
            track.note_pos = 0;
        }
    }

    /// Stop playing and gate every sequenced voice off.
    pub fn stop(&mut self) -> Vec<SeqEvent> {
        self.running = false;
        self.pending_offs.clear();
        let mut events = Vec::new();
        for track in &self.tracks {
            events.push(SeqEvent::Gate {
                voice: track.voice.clone(),
                on: false,
            });
        }
        events
    }

    /// Collect every event scheduled before `window_end` (exclusive).
    pub fn advance(&mut self, window_end: u64) -> Vec<SeqEvent> {
        let mut events = Vec::new();

        // Release gates first so a retrigger in the same window works.
        self.pending_offs.sort_by_key(|(at, _)| *at);
        while let Some((at, _)) = self.pending_offs.first() {
            if *at >= window_end {
                break;
            }
            let (_, voice) = self.pending_offs.remove(0);
            events.push(SeqEvent::Gate { voice, on: false });
        }

        if !self.running {
            return events;
        }

        loop {
            let step = self.step_samples();
            let swing_offset = if self.step_index % 2 == 1 {
                self.swing as f64 * 0.5 * step
            } else {
                0.0
            };
            let fire_at = self.step_sample + swing_offset;
            if fire_at >= window_end as f64 {
                break;
            }

            for track in &mut self.tracks {
                let slot = self.step_index as usize % track.steps.len();
                let Some(velocity) = track.steps[slot] else {
                    continue;
                };
                let freq = if track.notes.is_empty() {
                    track.base_freq
                } else {
                    let f = track.notes[track.note_pos % track.notes.len()];
                    track.note_pos += 1;
                    f
                };
                events.push(SeqEvent::Param {
                    voice: track.voice.clone(),
                    path: "freq",
                    value: freq,
                });
                events.push(SeqEvent::Param {
                    voice: track.voice.clone(),
                    path: "amp",
                    value: velocity,
                });
                events.push(SeqEvent::Gate {
                    voice: track.voice.clone(),
                    on: true,
                });
                let off_at = (fire_at + track.gate_frac as f64 * step) as u64;
                self.pending_offs.push((off_at, track.voice.clone()));
            }

            self.step_index += 1;
            self.step_sample += step;
        }

        events
    }
}

/// Thread wrapper applying [`SeqCore`] events through the supervisor.
pub struct Sequencer {
    core: Arc<parking_lot::Mutex<SeqCore>>,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl Sequencer {
    pub fn spawn(
        supervisor: Arc<Supervisor>,
        sample_clock: Arc<AtomicU64>,
    ) -> std::io::Result<Self> {
        let cfg = supervisor.config();
        let core = Arc::new(parking_lot::Mutex::new(SeqCore::new(
            cfg.audio.sample_rate as f32,
        )));
        let period = cfg.buffer_period();
        let buffer = cfg.audio.buffer_size as u64;
        let stop = Arc::new(AtomicBool::new(false));

        let thread_core = Arc::clone(&core);
        let thread_stop = Arc::clone(&stop);
        let join = std::thread::Builder::new()
            .name("chronus-sequencer".into())
            .spawn(move || {
                while !thread_stop.load(Ordering::Acquire) {
                    std::thread::sleep(period);
                    let now = sample_clock.load(Ordering::Acquire);
                    let events = thread_core.lock().advance(now + buffer);
                    for event in events {
                        apply(&supervisor, event);
                    }
                }
            })?;

        Ok(Self {
            core,
            stop,
            join: Some(join),
        })
    }

    /// Shared handle to the scheduling core for the control plane.
    pub fn core(&self) -> Arc<parking_lot::Mutex<SeqCore>> {
        Arc::clone(&self.core)
    }

    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn apply(supervisor: &Supervisor, event: SeqEvent) {
    let result = match &event {
        SeqEvent::Param { voice, path, value } => supervisor.set_param(voice, path, *value),
        SeqEvent::Gate { voice, on } => supervisor.gate(voice, *on),
    };
    if let Err(e) = result {
        tracing::warn!(?event, error = %e, "sequencer event dropped");
    }
}
