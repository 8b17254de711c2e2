//! Recording tap: drains the callback's sample queue into a WAV file.
//!
//! The callback only pushes into a lock-free queue; this writer thread owns
//! the file I/O. Queue-full drops are counted by the callback, never
//! blocked on.

use crate::error::RecordError;
use chrono::Utc;
use hound::{SampleFormat, WavSpec, WavWriter};
use parking_lot::Mutex;
use std::fs::File;
use std::io::BufWriter;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Samples buffered between the callback and the writer thread.
pub const RECORD_QUEUE_SAMPLES: usize = 1 << 16;

struct ActiveTake {
    writer: WavWriter<BufWriter<File>>,
    path: String,
    samples_written: u64,
}

struct RecorderState {
    take: Option<ActiveTake>,
    /// Set when `stop` wants the current take drained and finalized.
    finalize: bool,
    /// The most recently finalized take: (path, samples).
    finished: Option<(String, u64)>,
}

/// Control side of the recording tap.
pub struct Recorder {
    sample_rate: u32,
    enabled: Arc<AtomicBool>,
    state: Arc<Mutex<RecorderState>>,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl Recorder {
    /// Spawn the writer thread around the queue consumer.
    pub fn spawn(
        sample_rate: u32,
        enabled: Arc<AtomicBool>,
        queue: rtrb::Consumer<f32>,
    ) -> std::io::Result<Self> {
        let state = Arc::new(Mutex::new(RecorderState {
            take: None,
            finalize: false,
            finished: None,
        }));
        let stop = Arc::new(AtomicBool::new(false));

        let thread_state = Arc::clone(&state);
        let thread_stop = Arc::clone(&stop);
        let join = std::thread::Builder::new()
            .name("chronus-recorder".into())
            .spawn(move || writer_loop(queue, thread_state, thread_stop))?;

        Ok(Self {
            sample_rate,
            enabled,
            state,
            stop,
            join: Some(join),
        })
    }

    /// Begin capturing to `name`, or to a timestamped default.
    pub fn start(&self, name: Option<String>) -> Result<String, RecordError> {
        let mut state = self.state.lock();
        if let Some(take) = &state.take {
            return Err(RecordError::AlreadyRecording(take.path.clone()));
        }
        let path = name.unwrap_or_else(|| {
            format!("recording_{}.wav", Utc::now().format("%Y%m%d-%H%M%S"))
        });
        let spec = WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let writer = WavWriter::create(&path, spec).map_err(|source| RecordError::Open {
            path: path.clone(),
            source,
        })?;
        state.take = Some(ActiveTake {
            writer,
            path: path.clone(),
            samples_written: 0,
        });
        state.finalize = false;
        self.enabled.store(true, Ordering::Release);
        tracing::info!(path = %path, "recording started");
        Ok(path)
    }

    /// Stop capturing: the writer thread drains the queue, finalizes the
    /// file, and this call returns (path, samples) once that completes.
    pub fn stop(&self) -> Result<(String, u64), RecordError> {
        self.enabled.store(false, Ordering::Release);
        {
            let mut state = self.state.lock();
            if state.take.is_none() {
                return Err(RecordError::NotRecording);
            }
            state.finalize = true;
        }
        let deadline = Instant::now() + Duration::from_millis(500);
        loop {
            {
                let state = self.state.lock();
                if state.take.is_none() {
                    return state.finished.clone().ok_or(RecordError::NotRecording);
                }
            }
            if Instant::now() > deadline {
                tracing::warn!("recorder finalize timed out");
                return Err(RecordError::NotRecording);
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    /// Current take, if any: (path, samples written so far).
    pub fn status(&self) -> Option<(String, u64)> {
        let state = self.state.lock();
        state
            .take
            .as_ref()
            .map(|t| (t.path.clone(), t.samples_written))
    }

    /// Stop the writer thread. Any open take is finalized first.
    pub fn shutdown(mut self) {
        if self.status().is_some() {
            let _ = self.stop();
        }
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn writer_loop(
    mut queue: rtrb::Consumer<f32>,
    state: Arc<Mutex<RecorderState>>,
    stop: Arc<AtomicBool>,
) {
    while !stop.load(Ordering::Acquire) {
        drain(&mut queue, &state);
        std::thread::sleep(Duration::from_millis(5));
    }
    drain(&mut queue, &state);
}

fn drain(queue: &mut rtrb::Consumer<f32>, state: &Arc<Mutex<RecorderState>>) {
    let mut state = state.lock();
    let mut failed = false;
    while let Ok(sample) = queue.pop() {
        if let Some(take) = &mut state.take {
            let quantized = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            if let Err(e) = take.writer.write_sample(quantized) {
                tracing::error!(error = %e, "wav write failed; dropping take");
                failed = true;
                break;
            }
            take.samples_written += 1;
        }
    }
    if failed {
        state.take = None;
        state.finalize = false;
        return;
    }
    if state.finalize && queue.is_empty() {
        if let Some(take) = state.take.take() {
            let ActiveTake {
                writer,
                path,
                samples_written,
            } = take;
            if let Err(e) = writer.finalize() {
                tracing::error!(error = %e, "wav finalize failed");
            } else {
                tracing::info!(path = %path, samples_written, "recording finalized");
                state.finished = Some((path, samples_written));
            }
        }
        state.finalize = false;
    }
}
