// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The daemon's single-threaded `poll` loop: accepts local clients, multiplexes
//! their stdio over one vchan transport to the agent, and applies the flow
//! control and quarantine rules described alongside it. Grounded on
//! `qrexec_daemon.c`'s `main`/`handle_new_process_client`/select loop, replacing
//! its fd-indexed arrays and `select` call with the `ClientTable`/`libc::poll`
//! equivalents built up in the rest of this crate.

use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

use log::{debug, error, info, warn};

use qrexec_protocol::{
    config, ChildSignal, ClientHeader, ClientId, MsgType, TransportAssembler, TransportHeader,
    TriggerRecord, MAX_CHUNK,
};
use qrexec_protocol::ignore_sigpipe;
use vchan::Channel;

use crate::client::{ClientState, ClientTable};
use crate::flush::spawn_flush;
use crate::trigger::TriggerLauncher;

const DEFAULT_POLICY_PATH: &str = "/usr/lib/qubes/qrexec-policy-exec";
const POLL_TIMEOUT_MS: i32 = 1000;

/// Minimum transport receive-window the agent must have before we'll read
/// more from a client socket: enough for one full-size frame plus its header,
/// so a frame we decide to send never has to wait mid-write for room.
const TRANSPORT_RESERVE: usize = TransportHeader::WIRE_SIZE + MAX_CHUNK as usize;

pub struct Daemon {
    vm_name: String,
    listener: UnixListener,
    channel: Channel,
    clients: ClientTable,
    agent_assembler: TransportAssembler,
    child_signal: ChildSignal,
    trigger: TriggerLauncher,
    default_user: String,
    /// Encoded frames waiting for room in the transport ring. Appended to by
    /// `forward_to_agent`, drained a bit at a time by `flush_agent_outbox` so a
    /// full ring never blocks the poll loop.
    agent_outbox: Vec<u8>,
}

impl Daemon {
    pub fn new(vm_name: String, vchan_port: u32, default_user: Option<String>) -> io::Result<Self> {
        ignore_sigpipe()?;
        let child_signal = ChildSignal::install()?;

        let socket_path = client_socket_path(&vm_name);
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let _ = std::fs::remove_file(&socket_path);
        let listener = UnixListener::bind(&socket_path)?;
        listener.set_nonblocking(true)?;
        info!("listening for local clients on {}", socket_path.display());

        let channel = establish_channel(&vm_name, vchan_port)?;

        Ok(Daemon {
            vm_name,
            listener,
            channel,
            clients: ClientTable::new(),
            agent_assembler: TransportAssembler::new(),
            child_signal,
            trigger: TriggerLauncher::new(DEFAULT_POLICY_PATH),
            default_user: default_user.unwrap_or_else(config::default_user),
            agent_outbox: Vec::new(),
        })
    }

    pub fn run(&mut self) -> io::Result<()> {
        loop {
            self.clients.advance_quarantine();
            self.child_signal.drain();
            self.trigger.reap_finished();

            self.poll_once()?;
            self.drain_agent_frames()?;
            self.flush_agent_outbox()?;
        }
    }

    fn poll_once(&mut self) -> io::Result<()> {
        let mut pollfds = Vec::new();
        pollfds.push(libc::pollfd {
            fd: self.listener.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        pollfds.push(libc::pollfd {
            fd: self.child_signal.fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        pollfds.push(libc::pollfd {
            fd: self.channel.fd_for_poll(),
            events: libc::POLLIN,
            revents: 0,
        });

        // §4.3 step 2: a saturated transport ring excludes every client read
        // fd from the poll set, not just the one whose turn it would be next —
        // we don't know ahead of time which client would fill the rest of the
        // window, so we stop reading from all of them until the agent drains.
        let transport_congested =
            !self.agent_outbox.is_empty() || self.channel.buffer_space() < TRANSPORT_RESERVE;

        let ids = self.clients.ids();
        for id in &ids {
            let client = self.clients.get(*id).expect("id came from ids()");
            let mut events = 0;
            if !client.flags.dont_read && !client.flags.eof && !transport_congested {
                events |= libc::POLLIN;
            }
            if !client.out_buffer.is_empty() {
                events |= libc::POLLOUT;
            }
            pollfds.push(libc::pollfd {
                fd: client.stream.as_raw_fd(),
                events,
                revents: 0,
            });
        }

        let n = unsafe {
            libc::poll(
                pollfds.as_mut_ptr(),
                pollfds.len() as libc::nfds_t,
                POLL_TIMEOUT_MS,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        if pollfds[0].revents & libc::POLLIN != 0 {
            self.accept_client();
        }
        // child_signal and the vchan wake are both handled unconditionally at the
        // top/bottom of the loop; their poll entries exist only to make `poll`
        // return promptly when either becomes ready.
        let _ = self.channel.wait(Some(Duration::from_millis(0)));

        for (pfd, id) in pollfds[3..].iter().zip(ids.iter()) {
            if pfd.revents & libc::POLLIN != 0 {
                self.read_from_client(*id);
            }
            if pfd.revents & libc::POLLOUT != 0 {
                self.write_to_client(*id);
            }
        }
        Ok(())
    }

    fn accept_client(&mut self) {
        match self.listener.accept() {
            Ok((stream, _)) => {
                if let Some(id) = self.clients.accept(stream) {
                    debug!("accepted local client {id}");
                } else {
                    warn!("rejecting new client: MAX_FDS concurrent clients reached");
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => error!("accept failed: {e}"),
        }
    }

    fn read_from_client(&mut self, id: ClientId) {
        let mut buf = [0u8; MAX_CHUNK as usize];
        let n = {
            let client = match self.clients.get_mut(id) {
                Some(c) => c,
                None => return,
            };
            match client.stream.read(&mut buf) {
                Ok(0) => {
                    client.flags.eof = true;
                    0
                }
                Ok(n) => {
                    client.assembler.feed(&buf[..n]);
                    n
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(_) => {
                    client.flags.eof = true;
                    0
                }
            }
        };

        if n > 0 {
            self.drain_client_frames(id);
        } else {
            self.handle_client_eof(id);
        }
    }

    fn drain_client_frames(&mut self, id: ClientId) {
        loop {
            let taken = {
                let client = match self.clients.get_mut(id) {
                    Some(c) => c,
                    None => return,
                };
                match client.assembler.try_take_frame() {
                    Ok(Some(frame)) => frame,
                    Ok(None) => return,
                    Err(e) => {
                        warn!("client {id} sent a malformed frame: {e}");
                        self.retire_client(id);
                        return;
                    }
                }
            };
            self.handle_client_frame(id, taken.0, taken.1);
        }
    }

    fn handle_client_frame(
        &mut self,
        id: ClientId,
        header: ClientHeader,
        payload: Vec<u8>,
    ) {
        let state = match self.clients.get(id) {
            Some(c) => c.state,
            None => return,
        };

        match (state, header.msg_type) {
            (ClientState::AwaitCmdline, MsgType::TriggerConnectExisting) => {
                if payload.len() == TriggerRecord::WIRE_SIZE {
                    let mut raw = [0u8; TriggerRecord::WIRE_SIZE];
                    raw.copy_from_slice(&payload);
                    let record = TriggerRecord::decode(&raw);
                    if let Err(e) = self.trigger.launch(&self.vm_name, &record) {
                        error!("failed to launch policy evaluator: {e}");
                    }
                } else {
                    warn!("client {id} sent an ill-sized trigger record");
                }
                self.retire_client(id);
            }
            (ClientState::AwaitCmdline, MsgType::ExecCmdline) => {
                if let Some(client) = self.clients.get_mut(id) {
                    client.state = ClientState::Streaming;
                }
                let payload = rewrite_default_user(&payload, &self.default_user);
                self.forward_to_agent(id, header.msg_type, &payload);
            }
            (ClientState::AwaitCmdline, MsgType::JustExec) => {
                // §4.2: the client record is closed immediately after
                // transmission. Nothing will ever read a reply for this id.
                let payload = rewrite_default_user(&payload, &self.default_user);
                self.forward_to_agent(id, header.msg_type, &payload);
                self.retire_client(id);
            }
            (ClientState::AwaitCmdline, MsgType::ConnectExisting) => {
                if let Some(client) = self.clients.get_mut(id) {
                    client.state = ClientState::Streaming;
                }
                self.forward_to_agent(id, header.msg_type, &payload);
            }
            (ClientState::Streaming, _) => {
                self.forward_to_agent(id, MsgType::Input, &payload);
            }
            (ClientState::AwaitCmdline, other) => {
                warn!("client {id} sent unexpected message type {other:?} before a command");
                self.retire_client(id);
            }
        }
    }

    /// Queues a frame for the agent transport outbox, splitting `payload` into
    /// `MAX_CHUNK`-sized pieces (always at least one, even for an empty
    /// payload, since e.g. `CLIENT_END` and `XOFF`/`XON` carry no body).
    /// Encoding only ever appends to a `Vec`, so unlike a direct write to the
    /// ring this can't block or fail on a full transport window.
    fn forward_to_agent(&mut self, id: ClientId, msg_type: MsgType, payload: &[u8]) {
        for chunk in payload.chunks(MAX_CHUNK as usize).chain(if payload.is_empty() {
            Some(&payload[..])
        } else {
            None
        }) {
            let header = TransportHeader {
                msg_type,
                client_id: id.0,
                length: chunk.len() as u32,
            };
            self.agent_outbox.extend_from_slice(&header.encode());
            self.agent_outbox.extend_from_slice(chunk);
        }
    }

    /// Writes as much of `agent_outbox` as the ring currently accepts in one
    /// non-blocking attempt, leaving any remainder queued for the next loop
    /// iteration instead of spinning until the peer drains.
    fn flush_agent_outbox(&mut self) -> io::Result<()> {
        if self.agent_outbox.is_empty() {
            return Ok(());
        }
        let n = self
            .channel
            .write(&self.agent_outbox)
            .map_err(|e| io::Error::new(ErrorKind::Other, e.to_string()))?;
        if n > 0 {
            self.agent_outbox.drain(..n);
        }
        Ok(())
    }

    fn handle_client_eof(&mut self, id: ClientId) {
        let streaming = matches!(
            self.clients.get(id).map(|c| c.state),
            Some(ClientState::Streaming)
        );
        if streaming {
            self.forward_to_agent(id, MsgType::ClientEnd, &[]);
        } else {
            self.retire_client(id);
        }
    }

    /// Writes what it can of `client`'s pending output, then emits `XOFF`/`XON`
    /// to the agent on each transition into/out of a backed-up local socket,
    /// backing up the per-process 50MB buffer cap with real flow control.
    fn write_to_client(&mut self, id: ClientId) {
        let was_full = match self.clients.get(id) {
            Some(c) => c.flags.outq_full,
            None => return,
        };

        let retire = {
            let client = match self.clients.get_mut(id) {
                Some(c) => c,
                None => return,
            };
            let pending = client.out_buffer.drain(client.out_buffer.len());
            match client.stream.write(&pending) {
                Ok(written) if written < pending.len() => {
                    let _ = client.out_buffer.append(&pending[written..]);
                    false
                }
                Ok(_) => false,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    let _ = client.out_buffer.append(&pending);
                    false
                }
                Err(_) => true,
            }
        };
        if retire {
            self.retire_client(id);
            return;
        }

        let now_full = match self.clients.get(id) {
            Some(c) => !c.out_buffer.is_empty(),
            None => return,
        };
        if now_full && !was_full {
            if let Some(c) = self.clients.get_mut(id) {
                c.flags.outq_full = true;
            }
            self.forward_to_agent(id, MsgType::Xoff, &[]);
        } else if !now_full && was_full {
            if let Some(c) = self.clients.get_mut(id) {
                c.flags.outq_full = false;
            }
            self.forward_to_agent(id, MsgType::Xon, &[]);
        }
    }

    fn drain_agent_frames(&mut self) -> io::Result<()> {
        let mut buf = [0u8; MAX_CHUNK as usize];
        loop {
            let n = match self.channel.read(&mut buf) {
                Ok(n) => n,
                Err(e) => return Err(io::Error::new(ErrorKind::Other, e.to_string())),
            };
            if n == 0 {
                break;
            }
            self.agent_assembler.feed(&buf[..n]);
        }
        loop {
            match self.agent_assembler.try_take_frame() {
                Ok(Some((header, payload))) => self.route_agent_frame(header, payload),
                Ok(None) => break,
                Err(e) => {
                    error!("malformed frame from agent transport: {e}");
                    return Err(io::Error::new(ErrorKind::InvalidData, e));
                }
            }
        }
        Ok(())
    }

    fn route_agent_frame(&mut self, header: TransportHeader, payload: Vec<u8>) {
        let id = ClientId(header.client_id);
        match header.msg_type {
            MsgType::Stdout | MsgType::Stderr | MsgType::ExitCode => {
                if let Some(client) = self.clients.get_mut(id) {
                    if client.out_buffer.append(&payload).is_err() {
                        error!("buffer limit exceeded relaying data to client {id}");
                        self.retire_client(id);
                        return;
                    }
                }
                if header.msg_type == MsgType::ExitCode {
                    self.begin_teardown(id);
                }
            }
            MsgType::ClientEnd => {
                self.begin_teardown(id);
            }
            MsgType::Xoff => {
                if let Some(client) = self.clients.get_mut(id) {
                    client.flags.dont_read = true;
                }
            }
            MsgType::Xon => {
                if let Some(client) = self.clients.get_mut(id) {
                    client.flags.dont_read = false;
                }
            }
            other => {
                debug!("ignoring unexpected frame type {other:?} from agent");
            }
        }
    }

    fn begin_teardown(&mut self, id: ClientId) {
        if let Some(record) = self.clients.retire(id) {
            if !record.out_buffer.is_empty() {
                let fd = std::os::fd::OwnedFd::from(record.stream);
                let remaining = {
                    let mut buf = record.out_buffer;
                    buf.drain(buf.len())
                };
                spawn_flush(fd, remaining);
            }
        }
    }

    fn retire_client(&mut self, id: ClientId) {
        self.clients.retire(id);
    }
}

/// Rewrites a leading literal `DEFAULT:` user token to the daemon's configured
/// default user, uniformly for every client, before the command line ever
/// reaches the agent. Anything else is passed through unchanged.
fn rewrite_default_user(payload: &[u8], default_user: &str) -> Vec<u8> {
    const TOKEN: &[u8] = b"DEFAULT";
    if payload.len() > TOKEN.len() && &payload[..TOKEN.len()] == TOKEN && payload[TOKEN.len()] == b':' {
        let mut out = Vec::with_capacity(payload.len() - TOKEN.len() + default_user.len());
        out.extend_from_slice(default_user.as_bytes());
        out.extend_from_slice(&payload[TOKEN.len()..]);
        out
    } else {
        payload.to_vec()
    }
}

fn client_socket_path(vm_name: &str) -> PathBuf {
    PathBuf::from(config::daemon_socket_dir()).join(format!("qrexec.{vm_name}"))
}

/// Performs the vchan server handshake on a background thread and waits for it
/// for at most `QREXEC_STARTUP_TIMEOUT` seconds. The historical daemon prompts a
/// human at a terminal while waiting for the peer; in the absence of one, it logs
/// and exits once the timeout expires.
fn establish_channel(vm_name: &str, port: u32) -> io::Result<Channel> {
    let dir = PathBuf::from(config::daemon_socket_dir());
    let (tx, rx) = mpsc::channel();
    let dir_clone = dir.clone();
    std::thread::spawn(move || {
        let result = Channel::server_init(&dir_clone, port);
        let _ = tx.send(result);
    });

    match rx.recv_timeout(config::startup_timeout()) {
        Ok(Ok(channel)) => {
            info!("vchan handshake with agent for {vm_name} completed");
            Ok(channel)
        }
        Ok(Err(e)) => Err(io::Error::new(ErrorKind::Other, e)),
        Err(_) => {
            error!(
                "no agent connected for {vm_name} within the startup timeout; exiting"
            );
            Err(io::Error::new(ErrorKind::TimedOut, "vchan handshake timed out"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_socket_path_is_namespaced_by_vm_name() {
        std::env::remove_var("QREXEC_DAEMON_SOCKET_DIR");
        let path = client_socket_path("work");
        assert!(path.to_string_lossy().ends_with("qrexec.work"));
    }
}
