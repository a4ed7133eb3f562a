// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Environment-driven configuration shared by the daemon, agent, and client
//! binaries. The historical system is itself environment/argv driven rather than
//! config-file driven, so this follows suit (SPEC_FULL.md §3 "Configuration").

use std::env;
use std::time::Duration;

pub const MAX_CHILDREN: usize = 10;

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

pub fn daemon_socket_dir() -> String {
    env_or("QREXEC_DAEMON_SOCKET_DIR", "/var/run/qubes")
}

pub fn startup_timeout() -> Duration {
    let secs: u64 = env_or("QREXEC_STARTUP_TIMEOUT", "60")
        .parse()
        .unwrap_or(60);
    Duration::from_secs(secs)
}

pub fn default_user() -> String {
    env_or("QREXEC_DEFAULT_USER", "user")
}

pub fn rpc_magic_cmd() -> Option<String> {
    env::var("QUBES_RPC_MAGIC_CMD").ok()
}

pub fn rpc_multiplexer_path() -> String {
    env_or(
        "QUBES_RPC_MULTIPLEXER_PATH",
        "/usr/lib/qubes/qubes-rpc-multiplexer",
    )
}

pub fn meminfo_writer_pidfile() -> String {
    env_or("MEMINFO_WRITER_PIDFILE", "/var/run/meminfo-writer.pid")
}
