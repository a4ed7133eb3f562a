// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Launches the policy-evaluation child for each `MSG_TRIGGER_CONNECT_EXISTING`
//! request, rate-limited to `MAX_CHILDREN` concurrent evaluators. Grounded on
//! `qrexec_daemon.c`'s `handle_trigger_connect` and its `children_count` guard.

use std::io;
use std::process::{Child, Command};

use qrexec_protocol::config::MAX_CHILDREN;
use qrexec_protocol::TriggerRecord;

/// Spawns the policy-evaluating child that decides whether a trigger request may
/// proceed, blocking to reap an existing child if `MAX_CHILDREN` are already
/// outstanding rather than letting the fork count grow without bound.
pub struct TriggerLauncher {
    policy_path: String,
    in_flight: Vec<Child>,
}

impl TriggerLauncher {
    pub fn new(policy_path: impl Into<String>) -> Self {
        TriggerLauncher {
            policy_path: policy_path.into(),
            in_flight: Vec::new(),
        }
    }

    /// Launches the policy evaluator for `record`, arriving from `source_vm`.
    /// Blocks in `wait` on the oldest still-tracked child if the concurrency
    /// limit has been reached.
    pub fn launch(&mut self, source_vm: &str, record: &TriggerRecord) -> io::Result<()> {
        self.reap_finished();
        if self.in_flight.len() >= MAX_CHILDREN {
            let mut oldest = self.in_flight.remove(0);
            let _ = oldest.wait();
        }
        let child = Command::new(&self.policy_path)
            .arg(source_vm)
            .arg(record.target_vm_str())
            .arg(record.service_str())
            .arg(record.ident_str())
            .spawn()?;
        self.in_flight.push(child);
        Ok(())
    }

    /// Opportunistic non-blocking reap, called once per event-loop iteration so
    /// finished evaluators don't sit around until the next `launch` call.
    pub fn reap_finished(&mut self) {
        self.in_flight.retain_mut(|child| match child.try_wait() {
            Ok(Some(_)) => false,
            _ => true,
        });
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> TriggerRecord {
        let mut raw = [0u8; TriggerRecord::WIRE_SIZE];
        raw[..4].copy_from_slice(b"qrun");
        raw[64..68].copy_from_slice(b"vm1\0");
        raw[96..97].copy_from_slice(b"5");
        TriggerRecord::decode(&raw)
    }

    #[test]
    fn launch_passes_four_positional_arguments() {
        // Uses `true`, always present, instead of a fake evaluator binary, since
        // the test only checks that a process is actually spawned and reaped.
        let mut launcher = TriggerLauncher::new("true");
        launcher.launch("sys-net", &sample_record()).unwrap();
        assert_eq!(launcher.in_flight_count(), 1);
        std::thread::sleep(std::time::Duration::from_millis(50));
        launcher.reap_finished();
        assert_eq!(launcher.in_flight_count(), 0);
    }

    #[test]
    fn blocks_and_reaps_when_concurrency_limit_is_reached() {
        let mut launcher = TriggerLauncher::new("true");
        for _ in 0..MAX_CHILDREN {
            launcher.launch("sys-net", &sample_record()).unwrap();
        }
        // One more launch must reap the oldest rather than growing unbounded.
        launcher.launch("sys-net", &sample_record()).unwrap();
        assert!(launcher.in_flight_count() <= MAX_CHILDREN);
    }
}
