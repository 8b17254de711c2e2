//! Visualizer broadcast: one-way UDP packets with voice levels and an
//! 8-band spectrum, roughly 10 times a second.

use crate::supervisor::Supervisor;
use rosc::{OscMessage, OscPacket, OscType, encoder};
use std::net::UdpSocket;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

/// Log-spaced analysis band centers in Hz.
const BAND_CENTERS: [f32; 8] = [
    60.0, 120.0, 250.0, 500.0, 1000.0, 2000.0, 4000.0, 8000.0,
];

/// Broadcast period (~10 Hz).
const PERIOD: Duration = Duration::from_millis(100);

pub struct BroadcastHandle {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl BroadcastHandle {
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Spawn the broadcast thread draining the callback's visualization tap.
pub fn spawn(
    supervisor: Arc<Supervisor>,
    mut tap: rtrb::Consumer<f32>,
    target: String,
) -> std::io::Result<BroadcastHandle> {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    let buffer_size = supervisor.config().audio.buffer_size;
    let sample_rate = supervisor.config().audio.sample_rate as f32;

    let join = std::thread::Builder::new()
        .name("chronus-broadcast".into())
        .spawn(move || {
            let mut frame = vec![0.0f32; buffer_size];
            while !stop_flag.load(Ordering::Acquire) {
                std::thread::sleep(PERIOD);

                // Keep only the most recent frame's worth of samples.
                let mut fresh = false;
                while !tap.is_empty() {
                    fresh = true;
                    for slot in frame.iter_mut() {
                        match tap.pop() {
                            Ok(s) => *slot = s,
                            Err(_) => break,
                        }
                    }
                }

                let peaks = supervisor.active_voice_peaks();
                let levels = OscPacket::Message(OscMessage {
                    addr: "/viz/levels".to_string(),
                    args: peaks.iter().map(|p| OscType::Float(*p)).collect(),
                });
                send(&socket, &target, &levels);

                if fresh {
                    let bands = spectrum_bands(&frame, sample_rate);
                    let spectrum = OscPacket::Message(OscMessage {
                        addr: "/viz/spectrum".to_string(),
                        args: bands.iter().map(|b| OscType::Float(*b)).collect(),
                    });
                    send(&socket, &target, &spectrum);
                }
            }
        })?;

    Ok(BroadcastHandle {
        stop,
        join: Some(join),
    })
}

fn send(socket: &UdpSocket, target: &str, packet: &OscPacket) {
    match encoder::encode(packet) {
        Ok(bytes) => {
            if let Err(e) = socket.send_to(&bytes, target) {
                tracing::debug!(error = %e, "viz send failed");
            }
        }
        Err(e) => tracing::debug!(error = %e, "viz encode failed"),
    }
}

/// Goertzel magnitude per band over one frame, normalized into [0, 1].
pub fn spectrum_bands(frame: &[f32], sample_rate: f32) -> [f32; 8] {
    let mut bands = [0.0f32; 8];
    if frame.is_empty() {
        return bands;
    }
    let n = frame.len() as f32;
    for (band, center) in bands.iter_mut().zip(BAND_CENTERS) {
        let w = std::f32::consts::TAU * center / sample_rate;
        let coeff = 2.0 * w.cos();
        let (mut s1, mut s2) = (0.0f32, 0.0f32);
        for x in frame {
            let s0 = x + coeff * s1 - s2;
            s2 = s1;
            s1 = s0;
        }
        let power = (s1 * s1 + s2 * s2 - coeff * s1 * s2).max(0.0);
        // A full-scale sine at the band center lands near 1.0.
        *band = (2.0 * power.sqrt() / n).clamp(0.0, 1.0);
    }
    bands
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn band_centered_sine_dominates_its_band() {
        let sr = 44100.0;
        let frame: Vec<f32> = (0..1024)
            .map(|i| (std::f32::consts::TAU * 1000.0 * i as f32 / sr).sin())
            .collect();
        let bands = spectrum_bands(&frame, sr);
        let (loudest, _) = bands
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .expect("eight bands");
        assert_eq!(loudest, 4, "1 kHz energy should land in band 4: {bands:?}");
        assert!(bands[4] > 0.5);
    }

    #[test]
    fn silence_is_all_zero_bands() {
        let frame = vec![0.0f32; 512];
        let bands = spectrum_bands(&frame, 44100.0);
        assert!(bands.iter().all(|b| *b == 0.0));
    }

    #[test]
    fn bands_are_clamped_to_unit_range() {
        let frame = vec![1.0f32; 512];
        let bands = spectrum_bands(&frame, 44100.0);
        assert!(bands.iter().all(|b| (0.0..=1.0).contains(b)));
    }
}
