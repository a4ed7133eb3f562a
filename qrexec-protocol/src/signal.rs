// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Turns `SIGCHLD` into a readable fd instead of a `volatile sig_atomic_t` flag
//! polled between `select` calls (§9's redesign flag — grounded on
//! `qrexec_daemon.c`'s `sigchld_handler`/`child_exited`). Shared by the daemon and
//! the agent, since both fork children whose exit they must notice promptly.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::OnceLock;

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

static WRITE_FD: AtomicI32 = AtomicI32::new(-1);
static WRITE_END: OnceLock<OwnedFd> = OnceLock::new();

extern "C" fn on_sigchld(_: libc::c_int) {
    let fd = WRITE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte: u8 = 1;
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

/// The read end of a self-pipe written to by the `SIGCHLD` handler. Belongs in the
/// event loop's poll set exactly where the old code consulted its global flag.
pub struct ChildSignal {
    read_end: OwnedFd,
}

impl ChildSignal {
    /// Installs the `SIGCHLD` handler. Only one `ChildSignal` may usefully exist
    /// per process — the handler always writes to whichever pipe was installed
    /// most recently.
    pub fn install() -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let read_end = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let write_end = unsafe { OwnedFd::from_raw_fd(fds[1]) };
        set_nonblocking(&read_end)?;
        set_nonblocking(&write_end)?;

        WRITE_FD.store(write_end.as_raw_fd(), Ordering::Relaxed);
        let _ = WRITE_END.set(write_end);

        let action = SigAction::new(
            SigHandler::Handler(on_sigchld),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        unsafe { signal::sigaction(Signal::SIGCHLD, &action) }
            .map_err(|e| io::Error::from_raw_os_error(e as i32))?;

        Ok(ChildSignal { read_end })
    }

    pub fn fd(&self) -> RawFd {
        self.read_end.as_raw_fd()
    }

    /// Drains every pending wake-up byte. Call once at the top of the loop,
    /// before the non-blocking `waitpid` sweep that reaps finished children.
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            match nix::unistd::read(self.read_end.as_raw_fd(), &mut buf) {
                Ok(n) if n == buf.len() => continue,
                _ => break,
            }
        }
    }
}

/// `SIGPIPE` defaults to terminating the process; every qrexec process writes to
/// sockets and pipes that the far end may have already closed, so this is called
/// once at startup in both the daemon and the agent.
pub fn ignore_sigpipe() -> io::Result<()> {
    let action = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    unsafe { signal::sigaction(Signal::SIGPIPE, &action) }
        .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
    Ok(())
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fork_child_exit_wakes_the_self_pipe() {
        let sig = ChildSignal::install().unwrap();
        sig.drain();

        match unsafe { libc::fork() } {
            0 => unsafe { libc::_exit(0) },
            pid if pid > 0 => {
                let mut pfd = libc::pollfd {
                    fd: sig.fd(),
                    events: libc::POLLIN,
                    revents: 0,
                };
                let n = unsafe { libc::poll(&mut pfd, 1, 2000) };
                assert_eq!(n, 1, "self-pipe did not become readable after fork exit");
                sig.drain();
                let mut status = 0;
                unsafe { libc::waitpid(pid, &mut status, 0) };
            }
            _ => panic!("fork failed"),
        }
    }
}
