// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The *vchan* transport: a shared-memory byte ring plus a cross-domain wake-up,
//! providing a reliable byte stream in each direction between two cooperating
//! processes.
//!
//! Ported from the historical `vchan/init.c` and `vchan/io.c`. Since this
//! implementation has no hypervisor to publish a ring-ref/event-channel pair
//! through xenstore, the "well-known directory entry" is a short-lived Unix
//! handshake socket and the "event-channel handle" is a pair of `eventfd`s
//! exchanged over it via `SCM_RIGHTS` — see [`handshake`] for the exact exchange.

mod handshake;
mod ring;

use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::time::Duration;

use log::debug;

use ring::{Ring, Role};

/// Errors that are fatal to the owning process per §4.1 / §7: the transport has no
/// retry, so every variant here is meant to propagate straight to process exit.
#[derive(Debug)]
pub enum Error {
    Handshake(io::Error),
    Io(io::Error),
    /// A ring index was observed violating `producer − consumer ≤ buffer_size` —
    /// a corrupt or malicious peer.
    InvariantViolation,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Handshake(e) => write!(f, "vchan handshake failed: {e}"),
            Error::Io(e) => write!(f, "vchan I/O error: {e}"),
            Error::InvariantViolation => write!(f, "vchan ring invariant violated by peer"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// A single shared-memory byte-ring channel, the Rust analogue of `struct
/// libvchan`. Owns the mapped region and the two event-channel fds.
pub struct Channel {
    ring: Ring,
    shm_ptr: *mut u8,
    wait_fd: OwnedFd,
    notify_fd: OwnedFd,
    owns_shm: bool,
    port: u32,
}

unsafe impl Send for Channel {}

impl Channel {
    /// Runs the server half of the handshake: allocates the shared ring, creates
    /// both event-channel fds, publishes them at `dir/<port>.sock`, and blocks for
    /// exactly one client to bind.
    pub fn server_init(dir: &Path, port: u32) -> Result<Self, Error> {
        let (shm_fd, shm_ptr) = handshake::create_shm(port).map_err(Error::Handshake)?;
        unsafe { ring::RawRing::init_in_place(shm_ptr as *mut _) };

        let to_client = handshake::create_eventfd().map_err(Error::Handshake)?;
        let to_server = handshake::create_eventfd().map_err(Error::Handshake)?;

        let path = handshake::handshake_path(dir, port);
        handshake::server_exchange(&path, port, to_client.as_raw_fd(), to_server.as_raw_fd())
            .map_err(Error::Handshake)?;
        debug!("vchan server bound on port {port}");

        // The server keeps its own copies of the fds it just passed: it writes to
        // `to_client` to wake the peer and waits on `to_server` for the peer's wake.
        drop(shm_fd);
        let ring = unsafe { Ring::from_raw(shm_ptr as *mut _, Role::Server) };
        Ok(Channel {
            ring,
            shm_ptr,
            wait_fd: to_server,
            notify_fd: to_client,
            owns_shm: true,
            port,
        })
    }

    /// Runs the client half: connects to `dir/<port>.sock`, receives the shm name
    /// and both event-channel fds, maps the page, and signals once.
    pub fn client_init(dir: &Path, port: u32) -> Result<Self, Error> {
        let path = handshake::handshake_path(dir, port);
        let (shm_port, wait_fd, notify_fd) =
            handshake::client_exchange(&path).map_err(Error::Handshake)?;
        let (shm_fd, shm_ptr) = handshake::open_shm(shm_port).map_err(Error::Handshake)?;
        drop(shm_fd);

        let ring = unsafe { Ring::from_raw(shm_ptr as *mut _, Role::Client) };
        let channel = Channel {
            ring,
            shm_ptr,
            wait_fd,
            notify_fd,
            owns_shm: false,
            port,
        };
        channel.notify()?;
        debug!("vchan client bound on port {port}");
        Ok(channel)
    }

    /// Copies as many bytes of `data` as will fit into the producer region without
    /// blocking, advances the producer index, and notifies the peer if anything was
    /// written. Returns the number of bytes actually written (may be zero).
    pub fn write(&self, data: &[u8]) -> Result<usize, Error> {
        let n = self.ring.write(data);
        if n > 0 {
            self.notify()?;
        }
        Ok(n)
    }

    /// Symmetric to [`Channel::write`] on the consumer side. Does not notify the
    /// peer on success; callers drain until empty, then notify once via `XON`-style
    /// protocol framing at a higher layer (§4.2/§4.3), mirroring the historical
    /// `libvchan_read`'s per-call notify only where flow-control requires it.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let n = self.ring.read(buf);
        if n > 0 {
            self.notify()?;
        }
        Ok(n)
    }

    pub fn data_ready(&self) -> usize {
        self.ring.data_ready()
    }

    pub fn buffer_space(&self) -> usize {
        self.ring.buffer_space()
    }

    /// `true` once the peer has observed our own close or vice versa. Mirrors
    /// `libvchan_is_eof`: on the client side, observing the server's `closed` flag
    /// also sets the client's own flag and notifies, completing the handshake.
    pub fn is_eof(&self) -> bool {
        if self.ring.peer_closed() {
            if self.ring.role() == Role::Client && !self.ring.own_closed() {
                self.ring.set_own_closed();
                let _ = self.notify();
            }
            true
        } else {
            false
        }
    }

    /// Checks the shared ring's index invariants; a caller should treat `false` as
    /// fatal (§4.1, §8).
    pub fn check_invariants(&self) -> bool {
        self.ring.check_invariants()
    }

    /// Blocks on the event channel until a wake-up or `timeout` elapses. Returns
    /// `true` if woken, `false` on timeout. A `None` timeout blocks indefinitely.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool, Error> {
        let timeout_ms: libc::c_int = match timeout {
            Some(d) => d.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
            None => -1,
        };
        let mut pfd = libc::pollfd {
            fd: self.wait_fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let n = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(Error::Io(err));
        }
        if n == 0 {
            return Ok(false);
        }
        // eventfd semantics: read the counter to re-arm it for the next wake-up.
        let mut counter = [0u8; 8];
        let _ = nix::unistd::read(self.wait_fd.as_raw_fd(), &mut counter);
        Ok(true)
    }

    /// Writes to the peer's wake-up fd. Idempotent from the caller's perspective:
    /// multiple notifies before the peer drains just accumulate in the eventfd
    /// counter, collapsing to a single wake-up.
    pub fn notify(&self) -> Result<(), Error> {
        let one: u64 = 1;
        match nix::unistd::write(&self.notify_fd, &one.to_ne_bytes()) {
            Ok(_) => Ok(()),
            Err(nix::errno::Errno::EAGAIN) => Ok(()),
            Err(e) => Err(Error::Io(e.into())),
        }
    }

    /// The fd a caller's own `poll`/`select` loop should include to be woken by
    /// this channel (§5's "union of ... the transport event fd").
    pub fn fd_for_poll(&self) -> RawFd {
        self.wait_fd.as_raw_fd()
    }

    /// Orderly close: drains the write side, sets the local closed flag and
    /// notifies, and — only on the server — waits (bounded) for the peer's own
    /// closed flag before returning.
    pub fn close(&self) -> Result<(), Error> {
        let mut rounds = 0;
        while !self.ring.write_side_drained() {
            if !self.wait(Some(Duration::from_millis(200)))? {
                rounds += 1;
                if rounds > 25 {
                    break;
                }
            }
        }
        self.ring.set_own_closed();
        self.notify()?;
        if self.ring.role() == Role::Server {
            let mut rounds = 0;
            while !self.ring.peer_closed() && rounds < 25 {
                self.wait(Some(Duration::from_millis(200)))?;
                rounds += 1;
            }
        }
        Ok(())
    }

    pub fn port(&self) -> u32 {
        self.port
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        unsafe { handshake::unmap_shm(self.shm_ptr) };
        if self.owns_shm {
            handshake::unlink_shm(self.port);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn test_dir() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("vchan-test-{}", std::process::id()))
    }

    #[test]
    fn handshake_then_echo() {
        let dir = test_dir();
        std::fs::create_dir_all(&dir).unwrap();
        let port = 9000 + (std::process::id() % 1000);

        let server_dir = dir.clone();
        let server = thread::spawn(move || Channel::server_init(&server_dir, port).unwrap());
        // Give the server a moment to start listening; client_init retries are the
        // daemon's job (§4.3 startup timeout), not this low-level primitive's.
        thread::sleep(Duration::from_millis(50));
        let client = Channel::client_init(&dir, port).unwrap();
        let server = server.join().unwrap();

        assert!(server.wait(Some(Duration::from_millis(500))).unwrap());

        let n = server.write(b"ping").unwrap();
        assert_eq!(n, 4);
        assert!(client.wait(Some(Duration::from_millis(500))).unwrap());
        let mut buf = [0u8; 4];
        assert_eq!(client.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"ping");

        assert!(!server.is_eof());
        assert!(!client.is_eof());
    }
}
