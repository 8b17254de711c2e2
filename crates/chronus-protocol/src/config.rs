//! Engine configuration.
//!
//! All knobs have conservative defaults and are validated up front; the
//! engine never re-checks them on the audio path.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unsupported sample rate {0} (expected 44100 or 48000)")]
    SampleRate(u32),

    #[error("unsupported buffer size {0} (expected 128, 256, 512 or 1024)")]
    BufferSize(usize),

    #[error("unsupported audio ring depth {0} (expected 8, 16 or 32)")]
    RingDepth(usize),

    #[error("heartbeat period {0} ms out of range (1..=5)")]
    HeartbeatPeriod(u64),
}

/// Audio device settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Frames per audio callback and per worker tick.
    pub buffer_size: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            buffer_size: 256,
        }
    }
}

/// Supervisor and failover settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Capacity of each slot's audio ring, in frames.
    pub ring_depth: usize,
    /// How long a patch commit may wait for the standby to prime.
    pub prime_timeout_ms: u64,
    /// Liveness monitor scan period.
    pub heartbeat_period_ms: u64,
    /// How many frames of lead the worker keeps in its audio ring.
    pub lead_target_frames: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            ring_depth: 16,
            prime_timeout_ms: 500,
            heartbeat_period_ms: 5,
            lead_target_frames: 3,
        }
    }
}

/// OSC control-plane settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OscConfig {
    pub host: String,
    pub port: u16,
}

impl Default for OscConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5005,
        }
    }
}

/// Visualizer broadcast settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VizConfig {
    pub host: String,
    pub port: u16,
    pub enable: bool,
}

impl Default for VizConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5006,
            enable: true,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub audio: AudioConfig,
    pub supervisor: SupervisorConfig,
    pub osc: OscConfig,
    pub viz: VizConfig,
}

impl EngineConfig {
    /// Validate every knob against its accepted set.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.audio.sample_rate, 44100 | 48000) {
            return Err(ConfigError::SampleRate(self.audio.sample_rate));
        }
        if !matches!(self.audio.buffer_size, 128 | 256 | 512 | 1024) {
            return Err(ConfigError::BufferSize(self.audio.buffer_size));
        }
        if !matches!(self.supervisor.ring_depth, 8 | 16 | 32) {
            return Err(ConfigError::RingDepth(self.supervisor.ring_depth));
        }
        if !(1..=5).contains(&self.supervisor.heartbeat_period_ms) {
            return Err(ConfigError::HeartbeatPeriod(
                self.supervisor.heartbeat_period_ms,
            ));
        }
        Ok(())
    }

    /// Duration of one audio buffer.
    pub fn buffer_period(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(
            self.audio.buffer_size as f64 / self.audio.sample_rate as f64,
        )
    }
}
