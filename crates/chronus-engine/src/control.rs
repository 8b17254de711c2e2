//! OSC control plane: the UDP server and address routing.
//!
//! OSC is the engine's sole control surface. Messages mutate state through
//! the supervisor (never directly); errors and status requests are answered
//! to the sender's source address.

use crate::recorder::Recorder;
use crate::sequencer::{self, SeqCore, SeqEvent, Track};
use crate::status::EngineStatus;
use crate::supervisor::{PatchOp, Supervisor};
use chronus_protocol::ModuleKind;
use parking_lot::Mutex;
use rosc::{OscMessage, OscPacket, OscType, decoder, encoder};
use std::net::UdpSocket;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

/// Shared handles the dispatcher needs.
pub struct ControlContext {
    pub supervisor: Arc<Supervisor>,
    pub seq: Arc<Mutex<SeqCore>>,
    pub recorder: Arc<Recorder>,
    pub sample_clock: Arc<AtomicU64>,
}

pub struct ControlHandle {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ControlHandle {
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Bind the control socket and spawn the receive loop.
pub fn spawn(ctx: ControlContext, host: &str, port: u16) -> std::io::Result<ControlHandle> {
    let socket = UdpSocket::bind((host, port))?;
    socket.set_read_timeout(Some(Duration::from_millis(100)))?;
    tracing::info!(host, port, "control plane listening");

    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);
    let join = std::thread::Builder::new()
        .name("chronus-control".into())
        .spawn(move || {
            let mut buf = [0u8; rosc::decoder::MTU];
            while !stop_flag.load(Ordering::Acquire) {
                let (len, from) = match socket.recv_from(&mut buf) {
                    Ok(ok) => ok,
                    Err(e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut =>
                    {
                        continue;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "control socket error");
                        continue;
                    }
                };
                let Ok((_, packet)) = decoder::decode_udp(&buf[..len]) else {
                    tracing::warn!(from = %from, "undecodable OSC packet");
                    continue;
                };
                for msg in flatten(packet) {
                    if let Some(reply) = dispatch(&ctx, &msg) {
                        match encoder::encode(&OscPacket::Message(reply)) {
                            Ok(bytes) => {
                                let _ = socket.send_to(&bytes, from);
                            }
                            Err(e) => tracing::warn!(error = %e, "reply encode failed"),
                        }
                    }
                }
            }
        })?;

    Ok(ControlHandle {
        stop,
        join: Some(join),
    })
}

fn flatten(packet: OscPacket) -> Vec<OscMessage> {
    match packet {
        OscPacket::Message(msg) => vec![msg],
        OscPacket::Bundle(bundle) => bundle.content.into_iter().flat_map(flatten).collect(),
    }
}

fn error_reply(addr: &str, message: String) -> OscMessage {
    tracing::warn!(addr, message = %message, "control error");
    OscMessage {
        addr: "/error".to_string(),
        args: vec![
            OscType::String(addr.to_string()),
            OscType::String(message),
        ],
    }
}

fn text_reply(addr: &str, text: String) -> OscMessage {
    OscMessage {
        addr: addr.to_string(),
        args: vec![OscType::String(text)],
    }
}

/// Coerce an OSC argument to f32, accepting ints and doubles.
pub fn float_arg(args: &[OscType], index: usize) -> Option<f32> {
    match args.get(index)? {
        OscType::Float(f) => Some(*f),
        OscType::Double(d) => Some(*d as f32),
        OscType::Int(i) => Some(*i as f32),
        OscType::Long(l) => Some(*l as f32),
        _ => None,
    }
}

/// Coerce an OSC argument to a string slice.
pub fn str_arg(args: &[OscType], index: usize) -> Option<&str> {
    match args.get(index)? {
        OscType::String(s) => Some(s.as_str()),
        _ => None,
    }
}

/// Route one message; `Some` is a reply for the sender.
pub fn dispatch(ctx: &ControlContext, msg: &OscMessage) -> Option<OscMessage> {
    let segments: Vec<&str> = msg.addr.split('/').filter(|s| !s.is_empty()).collect();
    match segments.as_slice() {
        ["mod", module, path @ ..] if !path.is_empty() => {
            let Some(value) = float_arg(&msg.args, 0) else {
                return Some(error_reply(&msg.addr, "missing float value".into()));
            };
            let path = path.join("/");
            match ctx.supervisor.set_param(module, &path, value) {
                Ok(()) => None,
                Err(e) => Some(error_reply(&msg.addr, e.to_string())),
            }
        }
        ["gate", module] => {
            let Some(value) = float_arg(&msg.args, 0) else {
                return Some(error_reply(&msg.addr, "missing gate value".into()));
            };
            match ctx.supervisor.gate(module, value != 0.0) {
                Ok(()) => None,
                Err(e) => Some(error_reply(&msg.addr, e.to_string())),
            }
        }
        ["patch", "create"] => {
            let (Some(id), Some(type_name)) = (str_arg(&msg.args, 0), str_arg(&msg.args, 1))
            else {
                return Some(error_reply(&msg.addr, "expected <id> <type>".into()));
            };
            let Some(kind) = ModuleKind::from_type_name(type_name) else {
                return Some(error_reply(
                    &msg.addr,
                    format!("unknown module type '{type_name}'"),
                ));
            };
            ctx.supervisor.stage(PatchOp::Create {
                id: id.to_string(),
                kind,
            });
            None
        }
        ["patch", "connect"] => {
            let (Some(src), Some(dst)) = (str_arg(&msg.args, 0), str_arg(&msg.args, 1)) else {
                return Some(error_reply(&msg.addr, "expected <src> <dst>".into()));
            };
            ctx.supervisor.stage(PatchOp::Connect {
                src: src.to_string(),
                dst: dst.to_string(),
            });
            None
        }
        ["patch", "remove"] => {
            let Some(id) = str_arg(&msg.args, 0) else {
                return Some(error_reply(&msg.addr, "expected <id>".into()));
            };
            ctx.supervisor.stage(PatchOp::Remove { id: id.to_string() });
            None
        }
        ["patch", "commit"] => match ctx.supervisor.commit() {
            Ok(()) => Some(text_reply("/patch/committed", "ok".into())),
            Err(e) => Some(error_reply(&msg.addr, e.to_string())),
        },
        ["patch", "abort"] => {
            ctx.supervisor.abort_pending();
            None
        }
        ["record", "start"] => {
            let name = str_arg(&msg.args, 0).map(|s| s.to_string());
            match ctx.recorder.start(name) {
                Ok(path) => Some(text_reply("/record/started", path)),
                Err(e) => Some(error_reply(&msg.addr, e.to_string())),
            }
        }
        ["record", "stop"] => match ctx.recorder.stop() {
            Ok((path, samples)) => Some(OscMessage {
                addr: "/record/stopped".to_string(),
                args: vec![OscType::String(path), OscType::Long(samples as i64)],
            }),
            Err(e) => Some(error_reply(&msg.addr, e.to_string())),
        },
        ["record", "status"] => {
            let text = match ctx.recorder.status() {
                Some((path, samples)) => format!("recording {path} ({samples} samples)"),
                None => "idle".to_string(),
            };
            Some(text_reply("/record/status", text))
        }
        ["engine", "status"] => {
            let recording = ctx.recorder.status().map(|(path, _)| path);
            let status = EngineStatus::gather(&ctx.supervisor, recording);
            Some(text_reply("/engine/status", status.to_text()))
        }
        ["seq", rest @ ..] => dispatch_seq(ctx, &msg.addr, rest, &msg.args),
        _ => Some(error_reply(&msg.addr, "unknown address".into())),
    }
}

fn dispatch_seq(
    ctx: &ControlContext,
    addr: &str,
    segments: &[&str],
    args: &[OscType],
) -> Option<OscMessage> {
    match segments {
        ["add"] => seq_add(ctx, addr, args),
        ["remove"] => {
            let Some(id) = str_arg(args, 0) else {
                return Some(error_reply(addr, "expected <track_id>".into()));
            };
            if !ctx.seq.lock().remove_track(id) {
                return Some(error_reply(addr, format!("unknown track '{id}'")));
            }
            None
        }
        ["clear"] => {
            ctx.seq.lock().clear();
            None
        }
        ["start"] => {
            let now = ctx.sample_clock.load(Ordering::Acquire);
            ctx.seq.lock().start(now);
            None
        }
        ["stop"] => {
            let events = ctx.seq.lock().stop();
            for event in events {
                if let SeqEvent::Gate { voice, on } = event {
                    let _ = ctx.supervisor.gate(&voice, on);
                }
            }
            None
        }
        ["bpm"] => {
            let Some(bpm) = float_arg(args, 0) else {
                return Some(error_reply(addr, "expected <bpm>".into()));
            };
            ctx.seq.lock().set_bpm(bpm);
            None
        }
        ["swing"] => {
            let Some(swing) = float_arg(args, 0) else {
                return Some(error_reply(addr, "expected <swing>".into()));
            };
            ctx.seq.lock().set_swing(swing);
            None
        }
        ["update", "pattern"] => {
            let (Some(id), Some(pattern)) = (str_arg(args, 0), str_arg(args, 1)) else {
                return Some(error_reply(addr, "expected <track_id> <pattern>".into()));
            };
            let steps = match sequencer::parse_pattern(pattern) {
                Ok(s) => s,
                Err(e) => return Some(error_reply(addr, e)),
            };
            let mut seq = ctx.seq.lock();
            match seq.track_mut(id) {
                Some(track) => {
                    track.steps = steps;
                    None
                }
                None => Some(error_reply(addr, format!("unknown track '{id}'"))),
            }
        }
        ["update", "notes"] => {
            let (Some(id), Some(list)) = (str_arg(args, 0), str_arg(args, 1)) else {
                return Some(error_reply(addr, "expected <track_id> <notes>".into()));
            };
            let notes = match parse_note_list(list) {
                Ok(n) => n,
                Err(e) => return Some(error_reply(addr, e)),
            };
            let mut seq = ctx.seq.lock();
            match seq.track_mut(id) {
                Some(track) => {
                    track.notes = notes;
                    None
                }
                None => Some(error_reply(addr, format!("unknown track '{id}'"))),
            }
        }
        _ => Some(error_reply(addr, "unknown address".into())),
    }
}

fn seq_add(ctx: &ControlContext, addr: &str, args: &[OscType]) -> Option<OscMessage> {
    let (Some(id), Some(voice), Some(pattern)) = (
        str_arg(args, 0),
        str_arg(args, 1),
        str_arg(args, 2),
    ) else {
        return Some(error_reply(
            addr,
            "expected <track_id> <voice_id> <pattern>".into(),
        ));
    };
    let steps = match sequencer::parse_pattern(pattern) {
        Ok(s) => s,
        Err(e) => return Some(error_reply(addr, e)),
    };

    let base_freq = float_arg(args, 3).unwrap_or(220.0);
    let mut track = Track::new(id.to_string(), voice.to_string(), steps, base_freq);

    if let Some(filter_freq) = float_arg(args, 4) {
        if let Err(e) = ctx.supervisor.set_param(voice, "filter/freq", filter_freq) {
            return Some(error_reply(addr, e.to_string()));
        }
    }
    if let Some(list) = str_arg(args, 5) {
        // A k=v option in this position means the notes list was omitted.
        if !list.contains('=') {
            match parse_note_list(list) {
                Ok(notes) => track.notes = notes,
                Err(e) => return Some(error_reply(addr, e)),
            }
        }
    }
    // Trailing k=v options.
    for arg in args.iter().skip(5) {
        let OscType::String(text) = arg else { continue };
        let Some((key, value)) = text.split_once('=') else {
            continue;
        };
        match key {
            "gate" => {
                if let Ok(frac) = value.parse::<f32>() {
                    track.gate_frac = frac.clamp(0.05, 1.0);
                }
            }
            other => tracing::debug!(option = other, "ignored sequencer option"),
        }
    }

    ctx.seq.lock().add_track(track);
    None
}

fn parse_note_list(list: &str) -> Result<Vec<f32>, String> {
    list.split(',')
        .filter(|t| !t.trim().is_empty())
        .map(sequencer::parse_note)
        .collect()
}
