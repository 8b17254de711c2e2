//! Engine crate - the fault-tolerant audio core.
//!
//! Wires the supervisor's dual worker slots, the audio delivery path, the
//! liveness monitor, and the OSC control plane into one [`Engine`]. The
//! headless constructor leaves the audio device out so tests (and embedders
//! with their own output) can pump frames through the identical delivery
//! path the device callback uses.

pub mod audio;
pub mod broadcast;
pub mod control;
pub mod error;
pub mod host;
pub mod monitor;
pub mod recorder;
pub mod ring;
pub mod sequencer;
pub mod shared;
pub mod status;
pub mod supervisor;
pub mod worker;

use audio::{Counters, Delivery, Taps};
use chronus_protocol::EngineConfig;
use error::EngineError;
use recorder::{RECORD_QUEUE_SAMPLES, Recorder};
use sequencer::Sequencer;
use status::StatusFile;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use supervisor::Supervisor;

/// Samples buffered between the callback and the visualizer thread.
const VIZ_QUEUE_SAMPLES: usize = 1 << 14;

/// A running engine and the handles needed to stop it.
pub struct Engine {
    supervisor: Arc<Supervisor>,
    stream: Option<cpal::Stream>,
    monitor: Option<monitor::MonitorHandle>,
    control: Option<control::ControlHandle>,
    broadcast: Option<broadcast::BroadcastHandle>,
    sequencer: Option<Sequencer>,
    recorder: Option<Arc<Recorder>>,
}

/// A headless engine plus the delivery state tests pump manually.
pub struct HeadlessEngine {
    pub engine: Engine,
    pub delivery: Delivery,
}

impl Engine {
    /// Start the full engine on the default audio device.
    pub fn start(cfg: EngineConfig) -> Result<Engine, EngineError> {
        cfg.validate()?;
        let sample_rate = cfg.audio.sample_rate;
        let buffer_size = cfg.audio.buffer_size;
        let (mut engine, delivery) = Self::build(cfg)?;
        let stream = audio::start_stream(delivery, sample_rate, buffer_size)?;
        engine.stream = Some(stream);
        Ok(engine)
    }

    /// Start everything except the audio device. The returned delivery state
    /// is the callback body; whoever holds it drives the audio clock.
    pub fn start_headless(cfg: EngineConfig) -> Result<HeadlessEngine, EngineError> {
        cfg.validate()?;
        let (engine, delivery) = Self::build(cfg)?;
        Ok(HeadlessEngine { engine, delivery })
    }

    fn build(cfg: EngineConfig) -> Result<(Engine, Delivery), EngineError> {
        let (supervisor, consumers) = Supervisor::new(cfg.clone())?;
        supervisor.install_default_patch()?;

        let (record_queue, record_rx) = rtrb::RingBuffer::new(RECORD_QUEUE_SAMPLES);
        let (viz_queue, viz_rx) = rtrb::RingBuffer::new(VIZ_QUEUE_SAMPLES);
        let record_enabled = Arc::new(AtomicBool::new(false));
        let viz_enabled = Arc::new(AtomicBool::new(cfg.viz.enable));

        let delivery = Delivery::new(
            consumers,
            supervisor.active_idx(),
            cfg.audio.buffer_size,
            cfg.supervisor.lead_target_frames,
            supervisor.counters(),
            supervisor.sample_clock(),
            Taps {
                record_enabled: Arc::clone(&record_enabled),
                record_queue,
                viz_enabled,
                viz_queue,
            },
        );

        let recorder = Arc::new(Recorder::spawn(
            cfg.audio.sample_rate,
            record_enabled,
            record_rx,
        )?);

        let sequencer = Sequencer::spawn(Arc::clone(&supervisor), supervisor.sample_clock())?;

        let status_file = Arc::new(StatusFile::new(PathBuf::from("engine_status.txt")));
        let monitor = monitor::spawn(Arc::clone(&supervisor), Some(status_file))?;

        let control = control::spawn(
            control::ControlContext {
                supervisor: Arc::clone(&supervisor),
                seq: sequencer.core(),
                recorder: Arc::clone(&recorder),
                sample_clock: supervisor.sample_clock(),
            },
            &cfg.osc.host,
            cfg.osc.port,
        )?;

        let broadcast = if cfg.viz.enable {
            let target = format!("{}:{}", cfg.viz.host, cfg.viz.port);
            Some(broadcast::spawn(Arc::clone(&supervisor), viz_rx, target)?)
        } else {
            None
        };

        Ok((
            Engine {
                supervisor,
                stream: None,
                monitor: Some(monitor),
                control: Some(control),
                broadcast,
                sequencer: Some(sequencer),
                recorder: Some(recorder),
            },
            delivery,
        ))
    }

    pub fn supervisor(&self) -> Arc<Supervisor> {
        Arc::clone(&self.supervisor)
    }

    pub fn recorder(&self) -> Option<Arc<Recorder>> {
        self.recorder.as_ref().map(Arc::clone)
    }

    pub fn counters(&self) -> Arc<Counters> {
        self.supervisor.counters()
    }

    /// Orderly shutdown: control plane first, then the periodic threads,
    /// then the workers. The device stream is dropped last.
    pub fn shutdown(mut self) {
        if let Some(control) = self.control.take() {
            control.stop();
        }
        if let Some(broadcast) = self.broadcast.take() {
            broadcast.stop();
        }
        if let Some(sequencer) = self.sequencer.take() {
            sequencer.shutdown();
        }
        if let Some(monitor) = self.monitor.take() {
            monitor.stop();
        }
        if let Some(recorder) = self.recorder.take() {
            if let Ok(recorder) = Arc::try_unwrap(recorder) {
                recorder.shutdown();
            }
        }
        self.supervisor.shutdown();
        drop(self.stream.take());
        tracing::info!("engine stopped");
    }
}
