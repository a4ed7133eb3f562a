// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Per-client child-process bookkeeping, keyed by the [`ClientId`] assigned by
//! the daemon rather than by file descriptor. Grounded on `qrexec_agent.c`'s
//! `struct process_fd process_fds[MAX_FDS]`, which stores a client's pid
//! alongside its own fd table entry (a cyclic reference §9 flags for removal):
//! here the id is the only key, and nothing points back from the `Child` to its
//! table slot.

use std::collections::HashMap;
use std::io::Write;
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout};

use qrexec_protocol::{ClientId, StreamBuffer};

#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessFlags {
    /// The daemon asked us to stop sending more stdout/stderr for now (it sent
    /// `MSG_XOFF` for this client; cleared again on `MSG_XON`).
    pub dont_send: bool,
    /// `MSG_CLIENT_END` was received: the client's stdin has no more data, but
    /// stdout/stderr may still be flowing until the child actually exits.
    pub input_closed: bool,
    /// Our own write to the child's stdin is backed up: `MSG_XOFF` has been
    /// sent to the daemon and an `MSG_XON` is owed once `stdin_buffer` drains.
    pub input_blocked: bool,
    /// This record was spawned from `JUST_EXEC` rather than `EXEC_CMDLINE`: no
    /// one is listening for its stdout/stderr/exit code, so `teardown` must not
    /// send any of them.
    pub just_exec: bool,
    /// Set once `waitpid` reports this child has exited. Actual removal is
    /// deferred until `stdout` and `stderr` are both drained to `None`, so the
    /// daemon never sees an `EXIT_CODE` followed by more output for this id.
    pub pending_exit: Option<i32>,
}

pub struct ProcessRecord {
    pub id: ClientId,
    /// Absent for a `CONNECT_EXISTING` session backed by a descriptor handed in
    /// over the fd-passing socket rather than a freshly spawned command — there
    /// is no child to wait on in that case.
    pub child: Option<Child>,
    pub stdin: Option<ChildStdin>,
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,
    /// Bytes received from the daemon, not yet written to the child's stdin.
    pub stdin_buffer: StreamBuffer,
    pub flags: ProcessFlags,
}

impl ProcessRecord {
    /// A reaped child is ready to retire once its exit status is known and both
    /// of its output streams have been fully drained (read to EOF, or failed).
    pub fn ready_to_retire(&self) -> bool {
        self.flags.pending_exit.is_some() && self.stdout.is_none() && self.stderr.is_none()
    }

    /// Drains as much of `stdin_buffer` into the child's stdin as a single
    /// non-blocking write accepts, re-buffering anything left over. Returns
    /// `Some(true)` if this call newly blocked on a full stdin (an `MSG_XOFF`
    /// is owed to the daemon), `Some(false)` if it newly drained (an `MSG_XON`
    /// is owed), or `None` if the blocked state didn't change.
    pub fn flush_stdin(&mut self) -> Option<bool> {
        let Some(stdin) = self.stdin.as_mut() else {
            return None;
        };
        if self.stdin_buffer.is_empty() {
            return None;
        }
        let was_blocked = self.flags.input_blocked;
        let pending = self.stdin_buffer.drain(self.stdin_buffer.len());
        match stdin.write(&pending) {
            Ok(written) if written < pending.len() => {
                let _ = self.stdin_buffer.append(&pending[written..]);
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                let _ = self.stdin_buffer.append(&pending);
            }
            Err(_) => {
                self.stdin = None;
            }
        }
        let now_blocked = !self.stdin_buffer.is_empty();
        self.flags.input_blocked = now_blocked;
        if now_blocked == was_blocked {
            None
        } else {
            Some(now_blocked)
        }
    }
}

/// The full set of live child processes, keyed by client id.
#[derive(Default)]
pub struct ProcessArena {
    processes: HashMap<ClientId, ProcessRecord>,
}

impl ProcessArena {
    pub fn new() -> Self {
        ProcessArena {
            processes: HashMap::new(),
        }
    }

    pub fn insert(&mut self, record: ProcessRecord) {
        self.processes.insert(record.id, record);
    }

    pub fn get(&self, id: ClientId) -> Option<&ProcessRecord> {
        self.processes.get(&id)
    }

    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut ProcessRecord> {
        self.processes.get_mut(&id)
    }

    pub fn remove(&mut self, id: ClientId) -> Option<ProcessRecord> {
        self.processes.remove(&id)
    }

    pub fn ids(&self) -> Vec<ClientId> {
        self.processes.keys().copied().collect()
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.processes.contains_key(&id)
    }

    /// Finds the client id whose child has the given pid, used when the
    /// self-pipe wakes the loop for a `waitpid` sweep and only the pid is known.
    pub fn find_by_pid(&self, pid: u32) -> Option<ClientId> {
        self.processes
            .values()
            .find(|p| p.child.as_ref().map(|c| c.id()) == Some(pid))
            .map(|p| p.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};

    fn spawn_cat() -> Child {
        Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .expect("cat must be available in the test environment")
    }

    #[test]
    fn insert_then_find_by_pid_round_trips() {
        let mut arena = ProcessArena::new();
        let child = spawn_cat();
        let pid = child.id();
        let record = ProcessRecord {
            id: ClientId(1),
            child: Some(child),
            stdin: None,
            stdout: None,
            stderr: None,
            stdin_buffer: StreamBuffer::new(),
            flags: ProcessFlags::default(),
        };
        arena.insert(record);
        assert_eq!(arena.find_by_pid(pid), Some(ClientId(1)));
        let mut removed = arena.remove(ClientId(1)).unwrap();
        if let Some(child) = removed.child.as_mut() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
