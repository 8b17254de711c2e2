//! Audio delivery: the real-time callback body and the cpal stream around it.
//!
//! [`Delivery`] is the callback's entire mutable state, bound once at
//! construction. Its `fill_device_buffer` is the only code that runs on the
//! audio thread and it obeys the hard rules: no allocation, no locks, no
//! logging, no syscalls. Every shared value it touches is an atomic or a
//! lock-free ring. Tests drive the same struct without a device.

use crate::ring::FrameConsumer;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// Callback-side counters observed by the monitor and status reporting.
pub struct Counters {
    /// Frames handed to the device (including underflow-filled ones).
    pub delivered_frames: AtomicU64,
    /// Frames filled from the last-known-good copy because the active ring
    /// was empty.
    pub underflows: AtomicU64,
    /// Samples dropped because the recorder queue was full.
    pub record_dropped: AtomicU64,
    /// Peak of the last delivered frame, stored as f32 bits.
    pub master_peak_bits: AtomicU32,
}

impl Counters {
    pub fn new() -> Self {
        Self {
            delivered_frames: AtomicU64::new(0),
            underflows: AtomicU64::new(0),
            record_dropped: AtomicU64::new(0),
            master_peak_bits: AtomicU32::new(0),
        }
    }

    pub fn master_peak(&self) -> f32 {
        f32::from_bits(self.master_peak_bits.load(Ordering::Relaxed))
    }
}

impl Default for Counters {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only taps fed from inside the callback. Both queues drop on full;
/// the consumers (recorder writer, visualizer) run on their own threads.
pub struct Taps {
    pub record_enabled: Arc<AtomicBool>,
    pub record_queue: rtrb::Producer<f32>,
    pub viz_enabled: Arc<AtomicBool>,
    pub viz_queue: rtrb::Producer<f32>,
}

/// The audio callback state: active-slot selection, per-slot ring
/// consumers, the carry buffer bridging engine frames to device request
/// sizes, and the last-known-good frame for underflow replay.
pub struct Delivery {
    consumers: [FrameConsumer; 2],
    active_idx: Arc<AtomicUsize>,
    buffer_size: usize,
    frame: Vec<f32>,
    last_good: Vec<f32>,
    /// Read position within `frame`; `buffer_size` means exhausted.
    pos: usize,
    /// Slot read last time; a change triggers a backlog discard.
    last_idx: usize,
    /// Frames kept when switching onto a slot's accumulated backlog.
    keep_on_switch: usize,
    counters: Arc<Counters>,
    sample_clock: Arc<AtomicU64>,
    taps: Taps,
}

impl Delivery {
    pub fn new(
        consumers: [FrameConsumer; 2],
        active_idx: Arc<AtomicUsize>,
        buffer_size: usize,
        keep_on_switch: usize,
        counters: Arc<Counters>,
        sample_clock: Arc<AtomicU64>,
        taps: Taps,
    ) -> Self {
        let last_idx = active_idx.load(Ordering::Acquire) & 1;
        Self {
            consumers,
            active_idx,
            buffer_size,
            frame: vec![0.0; buffer_size],
            last_good: vec![0.0; buffer_size],
            pos: buffer_size,
            last_idx,
            keep_on_switch: keep_on_switch.max(1),
            counters,
            sample_clock,
            taps,
        }
    }

    /// Pull the next engine frame into `self.frame`, falling back to the
    /// last-known-good copy on an empty ring.
    fn next_frame(&mut self) {
        let idx = self.active_idx.load(Ordering::Acquire) & 1;
        if idx != self.last_idx {
            // Commit swap or failover: skip the frames that piled up while
            // this slot was standby, keeping only a small fresh lead.
            self.consumers[idx].discard_to_latest(self.keep_on_switch);
            self.last_idx = idx;
        }
        match self.consumers[idx].read_into(&mut self.frame) {
            Ok(()) => {
                self.last_good.copy_from_slice(&self.frame);
            }
            Err(_) => {
                self.frame.copy_from_slice(&self.last_good);
                self.counters.underflows.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.counters.delivered_frames.fetch_add(1, Ordering::Relaxed);
        self.sample_clock
            .fetch_add(self.buffer_size as u64, Ordering::Release);

        let peak = self.frame.iter().fold(0.0f32, |a, b| a.max(b.abs()));
        self.counters
            .master_peak_bits
            .store(peak.to_bits(), Ordering::Relaxed);

        if self.taps.record_enabled.load(Ordering::Acquire) {
            for sample in &self.frame {
                if self.taps.record_queue.push(*sample).is_err() {
                    self.counters.record_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        if self.taps.viz_enabled.load(Ordering::Acquire) {
            for sample in &self.frame {
                // Visualization is lossy by design; drops are fine.
                let _ = self.taps.viz_queue.push(*sample);
            }
        }
        self.pos = 0;
    }

    /// Fill an interleaved device buffer, spreading the mono engine signal
    /// across all channels. Device request sizes need not match the engine
    /// frame size; the carry position bridges them.
    pub fn fill_device_buffer(&mut self, data: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        for device_frame in data.chunks_mut(channels) {
            if self.pos >= self.buffer_size {
                self.next_frame();
            }
            let sample = self.frame[self.pos];
            self.pos += 1;
            for out in device_frame.iter_mut() {
                *out = sample;
            }
        }
    }
}

/// Open the default output device and run [`Delivery`] inside its callback.
///
/// The returned stream must be kept alive for audio to flow.
pub fn start_stream(
    mut delivery: Delivery,
    sample_rate: u32,
    buffer_size: usize,
) -> Result<cpal::Stream, crate::error::EngineError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(crate::error::EngineError::NoOutputDevice)?;
    let default_config = device.default_output_config()?;
    let channels = default_config.channels().max(1) as usize;

    let config = cpal::StreamConfig {
        channels: channels as u16,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Fixed(buffer_size as u32),
    };

    let device_name = device.name().unwrap_or_else(|_| "unknown".into());
    tracing::info!(
        device = %device_name,
        sample_rate,
        buffer_size,
        channels,
        "opening output stream"
    );

    let stream = device.build_output_stream(
        &config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            delivery.fill_device_buffer(data, channels);
        },
        |err| tracing::error!(error = %err, "output stream error"),
        None,
    )?;
    stream.play()?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::frame_ring;

    const BLOCK: usize = 8;

    fn test_delivery() -> (Delivery, crate::ring::FrameProducer, Arc<Counters>) {
        let (tx0, rx0, _) = frame_ring(4, BLOCK);
        let (_tx1, rx1, _) = frame_ring(4, BLOCK);
        let counters = Arc::new(Counters::new());
        let (record_queue, _record_rx) = rtrb::RingBuffer::new(1024);
        let (viz_queue, _viz_rx) = rtrb::RingBuffer::new(1024);
        let delivery = Delivery::new(
            [rx0, rx1],
            Arc::new(AtomicUsize::new(0)),
            BLOCK,
            3,
            Arc::clone(&counters),
            Arc::new(AtomicU64::new(0)),
            Taps {
                record_enabled: Arc::new(AtomicBool::new(false)),
                record_queue,
                viz_enabled: Arc::new(AtomicBool::new(false)),
                viz_queue,
            },
        );
        (delivery, tx0, counters)
    }

    #[test]
    fn delivers_ring_frames_to_all_channels() {
        let (mut delivery, mut tx, _) = test_delivery();
        let frame: Vec<f32> = (0..BLOCK).map(|i| i as f32).collect();
        tx.write(&frame).expect("fits");

        let mut data = vec![0.0; BLOCK * 2];
        delivery.fill_device_buffer(&mut data, 2);
        for (i, pair) in data.chunks(2).enumerate() {
            assert_eq!(pair[0], i as f32);
            assert_eq!(pair[1], i as f32);
        }
    }

    #[test]
    fn empty_ring_replays_last_good_and_counts_underflow() {
        let (mut delivery, mut tx, counters) = test_delivery();
        let frame = vec![0.5; BLOCK];
        tx.write(&frame).expect("fits");

        let mut data = vec![0.0; BLOCK];
        delivery.fill_device_buffer(&mut data, 1);
        assert_eq!(counters.underflows.load(Ordering::Relaxed), 0);

        // Ring now empty: the same frame is replayed.
        delivery.fill_device_buffer(&mut data, 1);
        assert!(data.iter().all(|s| *s == 0.5));
        assert_eq!(counters.underflows.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn carry_bridges_mismatched_request_sizes() {
        let (mut delivery, mut tx, _) = test_delivery();
        let a: Vec<f32> = (0..BLOCK).map(|i| i as f32).collect();
        let b: Vec<f32> = (0..BLOCK).map(|i| (BLOCK + i) as f32).collect();
        tx.write(&a).expect("fits");
        tx.write(&b).expect("fits");

        // Pull 1.5 engine frames worth, then the remainder.
        let mut first = vec![0.0; BLOCK + BLOCK / 2];
        delivery.fill_device_buffer(&mut first, 1);
        let mut second = vec![0.0; BLOCK / 2];
        delivery.fill_device_buffer(&mut second, 1);

        let joined: Vec<f32> = first.into_iter().chain(second).collect();
        let expected: Vec<f32> = (0..2 * BLOCK).map(|i| i as f32).collect();
        assert_eq!(joined, expected);
    }

    #[test]
    fn sample_clock_advances_per_frame() {
        let (mut delivery, mut tx, _) = test_delivery();
        let clock = Arc::clone(&delivery.sample_clock);
        tx.write(&vec![0.0; BLOCK]).expect("fits");
        let mut data = vec![0.0; BLOCK];
        delivery.fill_device_buffer(&mut data, 1);
        assert_eq!(clock.load(Ordering::Acquire), BLOCK as u64);
    }

    #[test]
    fn master_peak_tracks_frame() {
        let (mut delivery, mut tx, counters) = test_delivery();
        let mut frame = vec![0.0; BLOCK];
        frame[3] = -0.75;
        tx.write(&frame).expect("fits");
        let mut data = vec![0.0; BLOCK];
        delivery.fill_device_buffer(&mut data, 1);
        assert_eq!(counters.master_peak(), 0.75);
    }
}
