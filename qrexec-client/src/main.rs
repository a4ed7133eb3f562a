// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Thin front-end for a client connection: wires local stdio (or a `-l` helper
//! process's stdio) to the per-VM daemon socket and propagates the remote exit
//! code. Grounded on `qrexec_client.c`'s `prepare_local_fds`/`select_loop`.

use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

use clap::Parser;
use log::error;

use qrexec_protocol::{ClientAssembler, ClientHeader, MsgType, MAX_CHUNK};

#[derive(Parser)]
#[command(about = "qrexec client: connects to a per-VM daemon socket and runs a remote command")]
struct Cli {
    /// Name of the VM whose daemon socket to connect to.
    #[arg(short = 'd', long = "domain")]
    domain: String,

    /// Local helper command whose stdio is wired to the remote command instead
    /// of this process's own stdin/stdout.
    #[arg(short = 'l', long = "local-cmd")]
    local_cmd: Option<String>,

    /// Send as JUST_EXEC: the remote command's output is discarded and this
    /// process exits immediately after sending the request.
    #[arg(short = 'e')]
    just_exec: bool,

    /// Send as CONNECT_EXISTING: the trailing argument is an ident for an
    /// already-running session rather than a command line.
    #[arg(short = 'c')]
    connect_existing: bool,

    /// Remote `user:command` line (or ident, with `-c`).
    cmdline: String,
}

fn main() {
    env_logger::init();
    let args = Cli::parse();
    if let Err(e) = run(args) {
        error!("{e}");
        std::process::exit(1);
    }
}

fn run(args: Cli) -> std::io::Result<()> {
    std::env::set_var("QREXEC_REMOTE_DOMAIN", &args.domain);

    let socket_path = client_socket_path(&args.domain);
    let mut stream = UnixStream::connect(&socket_path)?;

    let msg_type = if args.just_exec {
        MsgType::JustExec
    } else if args.connect_existing {
        MsgType::ConnectExisting
    } else {
        MsgType::ExecCmdline
    };

    let mut payload = args.cmdline.into_bytes();
    payload.push(0);
    let header = ClientHeader {
        msg_type,
        length: payload.len() as u32,
    };
    header.write_frame(&mut stream, &payload)?;

    if args.just_exec {
        return Ok(());
    }

    let mut helper = match &args.local_cmd {
        Some(cmd) => Some(spawn_local_helper(cmd)?),
        None => None,
    };

    let writer_stream = stream.try_clone()?;
    let input_source: Box<dyn Read + Send> = match &mut helper {
        Some(child) => Box::new(child.stdout.take().expect("helper stdout was piped")),
        None => Box::new(std::io::stdin()),
    };
    std::thread::spawn(move || forward_input(input_source, writer_stream));

    let output_sink: Box<dyn Write> = match &mut helper {
        Some(child) => Box::new(child.stdin.take().expect("helper stdin was piped")),
        None => Box::new(std::io::stdout()),
    };
    let exit_code = pump_daemon_frames(stream, output_sink)?;

    if let Some(mut child) = helper {
        let _ = child.wait();
    }
    std::process::exit(exit_code);
}

fn spawn_local_helper(cmd: &str) -> std::io::Result<Child> {
    Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
}

/// Reads from `input`, forwarding each chunk upward as an `INPUT` client frame.
/// Half-closes the socket's write side on EOF, mirroring the original's
/// `shutdown(s, SHUT_WR)` once the local input is exhausted.
fn forward_input(mut input: Box<dyn Read + Send>, mut stream: UnixStream) {
    let mut buf = [0u8; MAX_CHUNK as usize];
    loop {
        match input.read(&mut buf) {
            Ok(0) => {
                let _ = stream.shutdown(Shutdown::Write);
                return;
            }
            Ok(n) => {
                let header = ClientHeader {
                    msg_type: MsgType::Input,
                    length: n as u32,
                };
                if header.write_frame(&mut stream, &buf[..n]).is_err() {
                    return;
                }
            }
            Err(_) => {
                let _ = stream.shutdown(Shutdown::Write);
                return;
            }
        }
    }
}

/// Reads frames from the daemon until `EXIT_CODE` arrives, writing `STDOUT`
/// payloads to `output` and `STDERR` payloads to this process's own stderr.
fn pump_daemon_frames(mut stream: UnixStream, mut output: Box<dyn Write>) -> std::io::Result<i32> {
    let mut assembler = ClientAssembler::new();
    let mut buf = [0u8; MAX_CHUNK as usize];
    loop {
        loop {
            match assembler.try_take_frame() {
                Ok(Some((header, payload))) => match header.msg_type {
                    MsgType::Stdout => {
                        if payload.is_empty() {
                            // Remote stdout closed; keep draining stderr/exit code.
                        } else if output.write_all(&payload).is_err() {
                            return Ok(1);
                        }
                    }
                    MsgType::Stderr => {
                        let _ = std::io::stderr().write_all(&payload);
                    }
                    MsgType::ExitCode => {
                        if payload.len() == 4 {
                            let code = i32::from_le_bytes(payload[..4].try_into().unwrap());
                            return Ok(code);
                        }
                        return Ok(255);
                    }
                    other => {
                        error!("unexpected frame type {other:?} from daemon");
                        return Ok(1);
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    error!("malformed frame from daemon: {e}");
                    return Ok(1);
                }
            }
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            error!("daemon closed the connection without sending an exit code");
            return Ok(1);
        }
        assembler.feed(&buf[..n]);
    }
}

fn client_socket_path(domain: &str) -> PathBuf {
    PathBuf::from(qrexec_protocol::config::daemon_socket_dir()).join(format!("qrexec.{domain}"))
}
