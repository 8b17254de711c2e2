//! Error types for the audio core.

use chronus_protocol::ConfigError;
use thiserror::Error;

/// Errors surfaced while editing or committing a patch graph.
///
/// All of these leave the active graph untouched.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatchError {
    #[error("unknown module type: {0}")]
    UnknownType(String),

    #[error("unknown module id: {0}")]
    UnknownModule(String),

    #[error("module id already staged: {0}")]
    DuplicateModule(String),

    #[error("patch graph exceeds {0} modules")]
    TooManyModules(usize),

    #[error("patch graph exceeds {0} edges")]
    TooManyEdges(usize),

    #[error("patch graph contains a cycle")]
    Cycle,

    #[error("command ring full; commit aborted")]
    RingFull,

    #[error("standby slot did not prime within {0} ms")]
    PrimeTimeout(u64),

    #[error("unknown parameter: {0}")]
    UnknownParam(String),

    #[error("no pending patch to commit")]
    NoPending,

    #[error("worker thread still running; respawn deferred")]
    WorkerBusy,

    #[error("worker thread could not be spawned")]
    SpawnFailed,
}

/// Errors from the recording tap.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("already recording to {0}")]
    AlreadyRecording(String),

    #[error("not recording")]
    NotRecording,

    #[error("cannot open {path}: {source}")]
    Open {
        path: String,
        source: hound::Error,
    },
}

/// Top-level engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("no output audio device available")]
    NoOutputDevice,

    #[error("audio device error: {0}")]
    DeviceConfig(#[from] cpal::DefaultStreamConfigError),

    #[error("audio stream error: {0}")]
    BuildStream(#[from] cpal::BuildStreamError),

    #[error("audio stream error: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),

    #[error("patch error: {0}")]
    Patch(#[from] PatchError),

    #[error("recorder error: {0}")]
    Record(#[from] RecordError),

    #[error("control socket error: {0}")]
    Io(#[from] std::io::Error),
}
