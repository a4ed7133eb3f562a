// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Terminate-and-flush: when a client socket is going away but still has unsent
//! bytes queued, those bytes are handed to a detached thread that finishes
//! writing them in the background instead of forking a throwaway process to do
//! it (§9's redesign flag — grounded on `qrexec_daemon.c`'s `flush_client_data`,
//! which forks so the parent can carry on serving everyone else).

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};

/// Spawns a thread that best-effort writes `data` to `fd` and then drops it,
/// closing the socket. Errors are not reported anywhere further up; a flush that
/// fails partway through is no worse than the client having already gone away.
pub fn spawn_flush(fd: OwnedFd, data: Vec<u8>) {
    std::thread::spawn(move || {
        let _ = set_blocking(&fd);
        let mut offset = 0;
        while offset < data.len() {
            match nix::unistd::write(&fd, &data[offset..]) {
                Ok(0) => break,
                Ok(n) => offset += n,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(_) => break,
            }
        }
    });
}

fn set_blocking(fd: &OwnedFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags & !libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::fd::FromRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn spawned_flush_delivers_all_bytes_then_closes() {
        let (a, mut b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let fd = unsafe { OwnedFd::from_raw_fd(std::os::fd::IntoRawFd::into_raw_fd(a)) };
        let payload = vec![42u8; 4096];
        spawn_flush(fd, payload.clone());

        let mut received = Vec::new();
        b.read_to_end(&mut received).unwrap();
        assert_eq!(received, payload);
    }
}
