//! End-to-end engine tests driven through the headless delivery path.
//!
//! These pump the same frame-delivery code the device callback runs, so
//! commit atomicity, failover continuity, clamping, and recording identity
//! are exercised without a sound card.

use chronus_engine::supervisor::PatchOp;
use chronus_engine::{Engine, HeadlessEngine};
use chronus_protocol::{EngineConfig, ModuleKind};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

const BLOCK: usize = 256;

fn test_config(osc_port: u16) -> EngineConfig {
    let mut cfg = EngineConfig::default();
    cfg.osc.port = osc_port;
    cfg.viz.enable = false;
    cfg
}

/// Pump `frames` engine frames at real-time pace, collecting mono output.
fn pump(engine: &mut HeadlessEngine, frames: usize) -> Vec<f32> {
    let period = Duration::from_secs_f64(BLOCK as f64 / 44100.0);
    let mut out = Vec::with_capacity(frames * BLOCK);
    let mut data = vec![0.0f32; BLOCK];
    for _ in 0..frames {
        let start = Instant::now();
        engine.delivery.fill_device_buffer(&mut data, 1);
        out.extend_from_slice(&data);
        let elapsed = start.elapsed();
        if period > elapsed {
            std::thread::sleep(period - elapsed);
        }
    }
    out
}

fn rms(samples: &[f32]) -> f32 {
    (samples.iter().map(|x| x * x).sum::<f32>() / samples.len() as f32).sqrt()
}

fn commit_sine(engine: &HeadlessEngine) {
    let supervisor = engine.engine.supervisor();
    supervisor.stage(PatchOp::Create {
        id: "osc1".into(),
        kind: ModuleKind::Sine,
    });
    supervisor.commit().expect("commit succeeds");
    supervisor.set_param("osc1", "freq", 440.0).expect("route");
    supervisor.set_param("osc1", "gain", 0.5).expect("route");
}

#[test]
fn clean_sine_reaches_expected_rms_without_underflow() {
    let mut engine = Engine::start_headless(test_config(0)).expect("start");
    commit_sine(&engine);

    let samples = pump(&mut engine, 120);
    // Skip the smoothing ramp-in, measure the steady tail.
    let tail = &samples[samples.len() / 2..];
    let expected = 0.5 / 2.0_f32.sqrt();
    let measured = rms(tail);
    assert!(
        (measured - expected).abs() < expected * 0.05,
        "rms {measured} vs expected {expected}"
    );

    let counters = engine.engine.counters();
    assert_eq!(counters.underflows.load(Ordering::Relaxed), 0);
    engine.engine.shutdown();
}

#[test]
fn out_of_range_parameter_is_clamped_and_output_bounded() {
    let mut engine = Engine::start_headless(test_config(0)).expect("start");
    commit_sine(&engine);
    let supervisor = engine.engine.supervisor();
    supervisor.set_param("osc1", "freq", 99_999.0).expect("route");
    supervisor.set_param("osc1", "gain", 5.0).expect("route");

    let samples = pump(&mut engine, 60);
    assert!(samples.iter().all(|s| s.abs() <= 1.0));
    assert!(rms(&samples[samples.len() / 2..]) > 0.1, "tone vanished");
    engine.engine.shutdown();
}

#[test]
fn unknown_targets_are_rejected() {
    let engine = Engine::start_headless(test_config(0)).expect("start");
    let supervisor = engine.engine.supervisor();
    assert!(supervisor.set_param("ghost", "freq", 100.0).is_err());
    assert!(supervisor.set_param("voice1", "bogus", 100.0).is_err());
    assert!(supervisor.gate("ghost", true).is_err());
    engine.engine.shutdown();
}

#[test]
fn gated_envelope_attacks_and_releases_to_silence() {
    let mut engine = Engine::start_headless(test_config(0)).expect("start");
    let supervisor = engine.engine.supervisor();
    supervisor.stage(PatchOp::Create {
        id: "osc1".into(),
        kind: ModuleKind::Sine,
    });
    supervisor.stage(PatchOp::Create {
        id: "env1".into(),
        kind: ModuleKind::Adsr,
    });
    supervisor.stage(PatchOp::Connect {
        src: "osc1".into(),
        dst: "env1".into(),
    });
    supervisor.commit().expect("commit");
    supervisor.set_param("osc1", "gain", 1.0).expect("route");
    supervisor.set_param("env1", "attack", 10.0).expect("route");
    supervisor.set_param("env1", "decay", 50.0).expect("route");
    supervisor.set_param("env1", "sustain", 0.7).expect("route");
    supervisor.set_param("env1", "release", 200.0).expect("route");

    // Quiet before the gate.
    let silent = pump(&mut engine, 20);
    assert!(rms(&silent[silent.len() / 2..]) < 1e-3);

    supervisor.gate("env1", true).expect("gate on");
    let held = pump(&mut engine, 90); // ~520 ms
    let peak = held.iter().copied().fold(0.0f32, |a, b| a.max(b.abs()));
    assert!((0.9..=1.01).contains(&peak), "attack peak {peak}");
    // Sustained tail sits near sustain * gain.
    let sustained = &held[held.len() / 4..];
    assert!(rms(sustained) > 0.3);

    supervisor.gate("env1", false).expect("gate off");
    // 200 ms release: after 300 ms the output is silent again.
    let tail = pump(&mut engine, 52);
    let late = &tail[tail.len() - 4 * BLOCK..];
    assert!(rms(late) < 1e-3, "release tail still audible: {}", rms(late));
    engine.engine.shutdown();
}

#[test]
fn worker_death_fails_over_with_at_most_one_underflow() {
    let mut engine = Engine::start_headless(test_config(0)).expect("start");
    commit_sine(&engine);
    pump(&mut engine, 40);

    let supervisor = engine.engine.supervisor();
    let counters = engine.engine.counters();
    let active_before = supervisor.active_idx().load(Ordering::Acquire) & 1;
    let underflows_before = counters.underflows.load(Ordering::Relaxed);

    // Kill the active worker; the monitor's sentinel must fail over.
    supervisor.request_worker_exit(active_before);

    let samples = pump(&mut engine, 120); // ~700 ms, plenty for respawn
    let active_after = supervisor.active_idx().load(Ordering::Acquire) & 1;
    assert_ne!(active_before, active_after, "no failover happened");
    assert!(supervisor.failover_count() >= 1);

    // Stream stayed continuous: the tail still carries the tone.
    assert!(rms(&samples[samples.len() / 2..]) > 0.1);
    let underflow_delta = counters.underflows.load(Ordering::Relaxed) - underflows_before;
    assert!(underflow_delta <= 1, "underflows during failover: {underflow_delta}");

    // The failed slot was respawned as the new standby and beats again.
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let (_, finished) = supervisor.slot_liveness(active_before);
        if !finished {
            break;
        }
        assert!(Instant::now() < deadline, "failed slot never respawned");
        std::thread::sleep(Duration::from_millis(10));
    }
    engine.engine.shutdown();
}

#[test]
fn commit_under_tone_is_click_free_and_routes_new_module() {
    let mut engine = Engine::start_headless(test_config(0)).expect("start");
    commit_sine(&engine);
    pump(&mut engine, 40);

    let supervisor = engine.engine.supervisor();
    supervisor.stage(PatchOp::Create {
        id: "filt1".into(),
        kind: ModuleKind::BiquadLp,
    });
    supervisor.stage(PatchOp::Connect {
        src: "osc1".into(),
        dst: "filt1".into(),
    });

    // Capture across the swap.
    let before = pump(&mut engine, 10);
    supervisor.commit().expect("commit under tone");
    let after = pump(&mut engine, 40);

    let joined: Vec<f32> = before.into_iter().chain(after).collect();
    // The swap is buffer-aligned: the worst artifact is a single bounded
    // sample step where the new graph's phase takes over. Garbage, gaps, or
    // partial frames would violate the bounds below.
    assert!(joined.iter().all(|s| s.is_finite() && s.abs() <= 1.0));
    for frame in joined.chunks(BLOCK).skip(2) {
        assert!(
            frame.iter().any(|s| s.abs() > 1e-4),
            "silent frame after swap: tone interrupted"
        );
    }
    // Tone continues and the new module accepts parameters.
    assert!(rms(&joined[joined.len() / 2..]) > 0.1);
    supervisor.set_param("filt1", "cutoff", 500.0).expect("new module routes");
    engine.engine.shutdown();
}

#[test]
fn failed_commit_leaves_active_graph_untouched() {
    let mut engine = Engine::start_headless(test_config(0)).expect("start");
    commit_sine(&engine);
    let supervisor = engine.engine.supervisor();

    // Connect to a module that does not exist: resolution fails.
    supervisor.stage(PatchOp::Connect {
        src: "osc1".into(),
        dst: "ghost".into(),
    });
    assert!(supervisor.commit().is_err());
    assert!(!supervisor.has_pending(), "failed commit left pending ops");

    // The tone set up before the failed commit still plays.
    let samples = pump(&mut engine, 60);
    assert!(rms(&samples[samples.len() / 2..]) > 0.1);
    engine.engine.shutdown();
}

#[test]
fn recording_captures_exactly_the_delivered_samples() {
    let mut engine = Engine::start_headless(test_config(0)).expect("start");
    commit_sine(&engine);
    pump(&mut engine, 20);

    let recorder = engine.engine.recorder().expect("recorder running");
    let path = std::env::temp_dir()
        .join("chronus_engine_capture.wav")
        .to_string_lossy()
        .into_owned();
    recorder.start(Some(path.clone())).expect("record start");

    let frames = 80;
    let delivered = pump(&mut engine, frames);
    let (out_path, samples) = recorder.stop().expect("record stop");
    assert_eq!(out_path, path);
    assert_eq!(samples, (frames * BLOCK) as u64);

    let mut reader = hound::WavReader::open(&path).expect("open wav");
    let decoded: Vec<i16> = reader.samples::<i16>().map(|s| s.expect("sample")).collect();
    assert_eq!(decoded.len(), delivered.len());
    for (orig, got) in delivered.iter().zip(&decoded) {
        let expected = (orig.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        assert_eq!(*got, expected);
    }

    engine.engine.shutdown();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn repeated_identical_commits_converge_to_the_same_graph() {
    let mut engine = Engine::start_headless(test_config(0)).expect("start");
    commit_sine(&engine);
    let supervisor = engine.engine.supervisor();

    supervisor.stage(PatchOp::Create {
        id: "filt1".into(),
        kind: ModuleKind::BiquadLp,
    });
    supervisor.stage(PatchOp::Connect {
        src: "osc1".into(),
        dst: "filt1".into(),
    });
    supervisor.commit().expect("first commit");

    // Re-stage the same shape under a different id and commit again; both
    // slots keep working and parameters still route.
    supervisor.stage(PatchOp::Remove { id: "filt1".into() });
    supervisor.stage(PatchOp::Create {
        id: "filt2".into(),
        kind: ModuleKind::BiquadLp,
    });
    supervisor.stage(PatchOp::Connect {
        src: "osc1".into(),
        dst: "filt2".into(),
    });
    supervisor.commit().expect("second commit");

    assert!(supervisor.set_param("filt2", "cutoff", 900.0).is_ok());
    assert!(supervisor.set_param("filt1", "cutoff", 900.0).is_err());
    let samples = pump(&mut engine, 60);
    assert!(rms(&samples[samples.len() / 2..]) > 0.05);
    engine.engine.shutdown();
}
