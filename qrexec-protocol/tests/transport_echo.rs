// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! End-to-end "Echo" scenario over a real vchan channel: one side frames and
//! sends a command line, the other echoes it back as STDOUT followed by
//! EXIT_CODE, and the first side reassembles both from whatever chunk sizes the
//! transport happened to deliver. Grounded on the same thread-pair setup as
//! `vchan::tests::handshake_then_echo`, exercised here through the framing layer
//! instead of raw bytes.

use std::thread;
use std::time::Duration;

use qrexec_protocol::{MsgType, TransportAssembler, TransportHeader, MAX_CHUNK};
use vchan::Channel;

fn test_dir() -> std::path::PathBuf {
    std::env::temp_dir().join(format!("qrexec-transport-echo-{}", std::process::id()))
}

fn send_frame(channel: &Channel, msg_type: MsgType, client_id: u32, payload: &[u8]) {
    let header = TransportHeader {
        msg_type,
        client_id,
        length: payload.len() as u32,
    };
    let mut frame = Vec::with_capacity(TransportHeader::WIRE_SIZE + payload.len());
    frame.extend_from_slice(&header.encode());
    frame.extend_from_slice(payload);

    let mut sent = 0;
    while sent < frame.len() {
        let n = channel.write(&frame[sent..]).unwrap();
        if n == 0 {
            thread::sleep(Duration::from_millis(1));
            continue;
        }
        sent += n;
    }
}

fn recv_frames(channel: &Channel, assembler: &mut TransportAssembler, want: usize) -> Vec<(TransportHeader, Vec<u8>)> {
    let mut got = Vec::new();
    let mut buf = [0u8; MAX_CHUNK as usize];
    while got.len() < want {
        let n = channel.read(&mut buf).unwrap();
        if n > 0 {
            assembler.feed(&buf[..n]);
        } else {
            channel.wait(Some(Duration::from_millis(200))).unwrap();
        }
        while let Some(frame) = assembler.try_take_frame().unwrap() {
            got.push(frame);
        }
    }
    got
}

#[test]
fn echo_round_trips_stdout_then_exit_code_over_vchan() {
    let dir = test_dir();
    std::fs::create_dir_all(&dir).unwrap();
    let port = 9500 + (std::process::id() % 500);

    let server_dir = dir.clone();
    let server = thread::spawn(move || Channel::server_init(&server_dir, port).unwrap());
    thread::sleep(Duration::from_millis(50));
    let client = Channel::client_init(&dir, port).unwrap();
    let server = server.join().unwrap();

    let client_id = 3u32;
    let cmdline = b"user:/bin/cat\0";

    // "Daemon" side sends EXEC_CMDLINE, the body the agent would parse via
    // parse_exec_payload.
    let client_thread = thread::spawn(move || {
        send_frame(&client, MsgType::ExecCmdline, client_id, cmdline);

        let mut assembler = TransportAssembler::new();
        let frames = recv_frames(&client, &mut assembler, 2);
        frames
    });

    // "Agent" side: reassemble the EXEC_CMDLINE, then reply as if the spawned
    // `cat` had echoed "HELLO\n" and exited 0 — this is the framing contract
    // Agent::handle_transport_frame and Agent::teardown produce, tested here
    // without an actual child process in the loop.
    let mut assembler = TransportAssembler::new();
    let frames = recv_frames(&server, &mut assembler, 1);
    let (header, payload) = &frames[0];
    assert_eq!(header.msg_type, MsgType::ExecCmdline);
    assert_eq!(payload.as_slice(), cmdline);

    send_frame(&server, MsgType::Stdout, client_id, b"HELLO\n");
    send_frame(&server, MsgType::ExitCode, client_id, &0i32.to_le_bytes());

    let frames = client_thread.join().unwrap();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].0.msg_type, MsgType::Stdout);
    assert_eq!(frames[0].1, b"HELLO\n");
    assert_eq!(frames[1].0.msg_type, MsgType::ExitCode);
    assert_eq!(i32::from_le_bytes(frames[1].1[..4].try_into().unwrap()), 0);
}
