//! Control-plane tests over a real UDP socket.

use chronus_engine::Engine;
use chronus_protocol::EngineConfig;
use rosc::{OscMessage, OscPacket, OscType, decoder, encoder};
use std::net::UdpSocket;
use std::time::{Duration, Instant};

/// Fixed port for this test binary; other test binaries use other ports.
const OSC_PORT: u16 = 7741;

fn send(socket: &UdpSocket, addr: &str, args: Vec<OscType>) {
    let packet = OscPacket::Message(OscMessage {
        addr: addr.to_string(),
        args,
    });
    let bytes = encoder::encode(&packet).expect("encode");
    socket
        .send_to(&bytes, ("127.0.0.1", OSC_PORT))
        .expect("send");
}

fn recv_reply(socket: &UdpSocket) -> OscMessage {
    let mut buf = [0u8; decoder::MTU];
    let (len, _) = socket.recv_from(&mut buf).expect("reply arrives");
    match decoder::decode_udp(&buf[..len]).expect("decode").1 {
        OscPacket::Message(msg) => msg,
        OscPacket::Bundle(_) => panic!("unexpected bundle reply"),
    }
}

#[test]
fn osc_surface_drives_patching_params_and_status() {
    let mut cfg = EngineConfig::default();
    cfg.osc.port = OSC_PORT;
    cfg.viz.enable = false;
    let engine = Engine::start_headless(cfg).expect("start");
    let supervisor = engine.engine.supervisor();

    let client = UdpSocket::bind("127.0.0.1:0").expect("client socket");
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .expect("timeout");

    // Stage and commit a patch entirely over OSC.
    send(
        &client,
        "/patch/create",
        vec![
            OscType::String("osc1".into()),
            OscType::String("sine".into()),
        ],
    );
    send(&client, "/patch/commit", vec![]);
    let reply = recv_reply(&client);
    assert_eq!(reply.addr, "/patch/committed");

    // Parameter and gate routing resolve against the new graph.
    send(&client, "/mod/osc1/freq", vec![OscType::Float(523.25)]);
    send(&client, "/gate/voice1", vec![OscType::Int(1)]);

    // An unknown module surfaces an error reply.
    send(&client, "/mod/ghost/freq", vec![OscType::Float(100.0)]);
    let reply = recv_reply(&client);
    assert_eq!(reply.addr, "/error");

    // One-shot status request.
    send(&client, "/engine/status", vec![]);
    let reply = recv_reply(&client);
    assert_eq!(reply.addr, "/engine/status");
    match &reply.args[0] {
        OscType::String(text) => assert!(text.contains("active_slot")),
        other => panic!("unexpected status payload {other:?}"),
    }

    // The /mod write above really landed in the supervisor's cache: a
    // repeated set through the public API succeeds on the same module.
    let deadline = Instant::now() + Duration::from_secs(1);
    loop {
        if supervisor.set_param("osc1", "gain", 0.4).is_ok() {
            break;
        }
        assert!(Instant::now() < deadline);
        std::thread::sleep(Duration::from_millis(10));
    }

    // Sequencer surface.
    send(&client, "/seq/bpm", vec![OscType::Float(120.0)]);
    send(
        &client,
        "/seq/add",
        vec![
            OscType::String("kick".into()),
            OscType::String("voice1".into()),
            OscType::String("X...X...X...X...".into()),
            OscType::Float(60.0),
            OscType::Float(200.0),
        ],
    );
    send(&client, "/seq/start", vec![]);
    // Bad pattern surfaces an error.
    send(
        &client,
        "/seq/add",
        vec![
            OscType::String("bad".into()),
            OscType::String("voice2".into()),
            OscType::String("X?Z".into()),
        ],
    );
    let reply = recv_reply(&client);
    assert_eq!(reply.addr, "/error");

    // Record status answers even when idle.
    send(&client, "/record/status", vec![]);
    let reply = recv_reply(&client);
    assert_eq!(reply.addr, "/record/status");

    engine.engine.shutdown();
}
