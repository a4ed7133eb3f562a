// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The agent's fd-passing socket: local tools connect, hand over one file
//! descriptor via `SCM_RIGHTS`, and get back the numeric id it now lives under
//! (the accepted connection's own fd — the same "id equals fd at the accept
//! boundary" convention the daemon's local socket uses). Grounded on
//! `qrexec_agent.c`'s `handle_server_exec_request_do`/`get_server_socket` fd
//! hand-off path for `MSG_CONNECT_EXISTING`.

use std::io::{self, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;

use nix::cmsg_space;
use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags};

pub struct FdPassListener {
    listener: UnixListener,
}

impl FdPassListener {
    pub fn bind(path: &Path) -> io::Result<Self> {
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        let perms = std::fs::Permissions::from_mode(0o666);
        std::fs::set_permissions(path, perms)?;
        Ok(FdPassListener { listener })
    }

    pub fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.listener.as_raw_fd()
    }

    /// Accepts one pending connection, if any, and completes the fd hand-off.
    /// This blocks briefly on the freshly accepted connection itself (not on the
    /// listener) since the protocol here is a short fixed rendezvous, not a
    /// long-lived stream. Returns the 32-byte ident the caller tagged its
    /// descriptor with, alongside the descriptor itself — later used to match a
    /// `MSG_CONNECT_EXISTING` request to the fd it should attach to.
    pub fn accept_one(&self) -> io::Result<Option<([u8; 32], OwnedFd)>> {
        let (conn, _) = match self.listener.accept() {
            Ok(pair) => pair,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(e),
        };
        receive_one_fd(&conn).map(Some)
    }
}

fn receive_one_fd(conn: &UnixStream) -> io::Result<([u8; 32], OwnedFd)> {
    let mut cmsg_buf = cmsg_space!([std::os::fd::RawFd; 1]);
    let mut ident = [0u8; 32];
    let mut iov = [IoSliceMut::new(&mut ident)];
    let msg = recvmsg::<()>(
        conn.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buf),
        MsgFlags::empty(),
    )
    .map_err(io::Error::from)?;

    for cmsg in msg
        .cmsgs()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "malformed control message"))?
    {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(&raw) = fds.first() {
                return Ok((ident, unsafe { OwnedFd::from_raw_fd(raw) }));
            }
        }
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "fd-passing connection did not carry a descriptor",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{sendmsg, ControlMessage};
    use std::io::IoSlice;
    use std::os::fd::IntoRawFd;

    #[test]
    fn accept_one_receives_the_passed_descriptor() {
        let dir = std::env::temp_dir().join(format!("qrexec-fdpass-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("fdpass.sock");
        let listener = FdPassListener::bind(&path).unwrap();

        let client = UnixStream::connect(&path).unwrap();
        let (dummy_r, dummy_w) = nix::unistd::pipe().unwrap();
        drop(dummy_w);
        let raw = dummy_r.into_raw_fd();

        let mut payload = [0u8; 32];
        payload[..3].copy_from_slice(b"id1");
        let iov = [IoSlice::new(&payload)];
        let cmsg = [ControlMessage::ScmRights(&[raw])];
        sendmsg::<()>(client.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None).unwrap();
        unsafe { libc::close(raw) };

        std::thread::sleep(std::time::Duration::from_millis(50));
        let (ident, _fd) = listener.accept_one().unwrap().expect("a connection was pending");
        assert_eq!(&ident[..3], b"id1");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
