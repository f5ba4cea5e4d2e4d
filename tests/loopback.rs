//! End-to-end test against a scripted gateway: a TCP server that
//! speaks the real framed wire protocol, runs the real seed/key
//! handshake, and echoes commands back as status broadcasts.
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::{Sender, channel};
use std::time::Duration;

use anyhow::Result;

use idscan::cobs::{Deframer, encode};
use idscan::frame::CanFrame;
use idscan::message::{Address, Message, MessageType};
use idscan::session::{OP_HEARTBEAT, OP_REQUEST_SEED, OP_TRANSMIT_KEY, encrypt};
use idscan::{Bridge, Config, DeviceCommand, DeviceType, StateUpdate};

const DEVICE: u8 = 92;
const CONTROLLER: u8 = 1;
const SEED: u32 = 0x00c0_ffee;

fn send_msg(stream: &mut TcpStream, msg: &Message) {
    stream
        .write_all(&encode(&msg.to_frame().encode_wire()))
        .unwrap();
}

fn response(op: u8, payload: &[u8]) -> Message {
    Message::p2p(
        MessageType::Response,
        Address::new(DEVICE),
        Address::new(CONTROLLER),
        op,
        payload,
    )
    .unwrap()
}

/// A dimmer at address 92 behind a COBS gateway. Commands received
/// are forwarded to `commands` and mirrored as status broadcasts.
fn run_gateway(listener: TcpListener, commands: Sender<Message>) {
    let (stream, _) = listener.accept().unwrap();
    let mut writer = stream.try_clone().unwrap();
    let mut reader = stream;
    let mut deframer = Deframer::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        for &b in &buf[..n] {
            let Some(payload) = deframer.push(b) else {
                continue;
            };
            let frame = CanFrame::decode_wire(&payload).unwrap();
            let msg = Message::from_frame(&frame).unwrap();
            match (msg.msg_type(), msg.message_data()) {
                (MessageType::Request, Some(OP_REQUEST_SEED)) => {
                    let mut p = vec![0x00, 0x04];
                    p.extend_from_slice(&SEED.to_be_bytes());
                    send_msg(&mut writer, &response(OP_REQUEST_SEED, &p));
                }
                (MessageType::Request, Some(OP_TRANSMIT_KEY)) => {
                    let got = &msg.payload()[2..6];
                    if got == encrypt(SEED).to_be_bytes() {
                        send_msg(&mut writer, &response(OP_TRANSMIT_KEY, &[0x00, 0x04]));
                    } else {
                        // Key not correct.
                        send_msg(&mut writer, &response(OP_TRANSMIT_KEY, &[13]));
                    }
                }
                (MessageType::Request, Some(OP_HEARTBEAT)) => {
                    send_msg(&mut writer, &response(OP_HEARTBEAT, &[0x00, 0x04]));
                }
                (MessageType::Command, _) => {
                    let p = msg.payload().to_vec();
                    let _ = commands.send(msg);
                    // Dimmer status: mode, max, duration, current,
                    // then the cycle times.
                    let status = [p[0], p[1], p[2], p[1], p[3], p[4], p[5], p[6]];
                    send_msg(
                        &mut writer,
                        &Message::broadcast(
                            MessageType::DeviceStatus,
                            Address::new(DEVICE),
                            &status,
                        )
                        .unwrap(),
                    );
                }
                _ => {}
            }
        }
    }
}

#[test]
fn dimmer_end_to_end() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    let (cmd_tx, cmd_rx) = channel();
    std::thread::spawn(move || run_gateway(listener, cmd_tx));

    let (update_tx, update_rx) = channel();
    let mut config = Config::default();
    config.ip_address = Some("127.0.0.1".into());
    config.tcp_port = port;
    let bridge = Bridge::new(config, move |u| {
        let _ = update_tx.send(u);
    })?;
    bridge.connect()?;
    bridge.add_device(Address::new(DEVICE), DeviceType::DimmableLight)?;

    // This runs the whole handshake under the hood before the
    // command goes out.
    bridge.command(Address::new(DEVICE), DeviceCommand::Brightness(50))?;

    let cmd = cmd_rx.recv_timeout(Duration::from_secs(10))?;
    assert_eq!(cmd.source(), Address::new(CONTROLLER));
    assert_eq!(cmd.target(), Some(Address::new(DEVICE)));
    assert_eq!(cmd.message_data(), Some(0));
    assert_eq!(cmd.payload(), &[0x01, 0x7f, 0, 0, 0, 0, 0, 0]);

    let device = bridge.device(Address::new(DEVICE)).unwrap();
    assert!(device.waiting_for_status() || device.online());

    // The mirrored status comes back around as updates.
    let mut saw_power = false;
    let mut saw_brightness = false;
    let mut saw_online = false;
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while !(saw_power && saw_brightness && saw_online) {
        let remaining = deadline
            .checked_duration_since(std::time::Instant::now())
            .expect("timed out waiting for updates");
        let update = update_rx.recv_timeout(remaining)?;
        assert_eq!(update.address, Address::new(DEVICE));
        match update.update {
            StateUpdate::Power(true) => saw_power = true,
            // 0x7f scales back to 49.
            StateUpdate::Brightness(49) => saw_brightness = true,
            StateUpdate::Online(true) => saw_online = true,
            _ => {}
        }
    }
    assert!(device.online());

    bridge.close();
    Ok(())
}

#[test]
fn second_command_reuses_session() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    let (cmd_tx, cmd_rx) = channel();
    std::thread::spawn(move || run_gateway(listener, cmd_tx));

    let mut config = Config::default();
    config.ip_address = Some("127.0.0.1".into());
    config.tcp_port = port;
    let bridge = Bridge::new(config, |_| {})?;
    bridge.connect()?;
    bridge.add_device(Address::new(DEVICE), DeviceType::DimmableLight)?;

    bridge.command(Address::new(DEVICE), DeviceCommand::Power(true))?;
    let first = std::time::Instant::now();
    let _ = cmd_rx.recv_timeout(Duration::from_secs(10))?;

    // With the session open, the second command skips the handshake
    // and its polling waits.
    bridge.command(Address::new(DEVICE), DeviceCommand::Power(false))?;
    let cmd = cmd_rx.recv_timeout(Duration::from_secs(10))?;
    assert_eq!(cmd.payload()[0], 0x00);
    assert!(first.elapsed() < Duration::from_secs(4));

    bridge.close();
    Ok(())
}
