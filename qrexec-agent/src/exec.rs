// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Turns an `MSG_EXEC_CMDLINE`/`MSG_JUST_EXEC` payload into a running child
//! process. Grounded on `qrexec_agent.c`'s `do_exec`/`do_fork_exec`/`fix_fds`, and
//! on its `QUBES_RPC_MAGIC_CMD` rewrite for predefined RPC services.

use std::io;
use std::process::{Child, Command, Stdio};

use qrexec_protocol::config;

/// Splits a `"user:command line"` payload into its two parts, as sent by the
/// daemon for `MSG_EXEC_CMDLINE`/`MSG_JUST_EXEC`. Falls back to the configured
/// default user if no `:` separator is present.
pub fn parse_exec_payload(payload: &[u8]) -> (String, String) {
    let text = String::from_utf8_lossy(payload);
    let text = text.trim_end_matches('\0');
    match text.split_once(':') {
        Some((user, cmd)) => (user.to_string(), cmd.to_string()),
        None => (config::default_user(), text.to_string()),
    }
}

/// Rewrites `cmdline` if it begins with the configured RPC magic command,
/// substituting the multiplexer binary and leaving the rest of the line (the
/// requested service name and caller identity) as its arguments. A command that
/// doesn't match the magic prefix is run as-is, exactly as the user asked.
fn rewrite_magic_cmd(cmdline: &str) -> String {
    if let Some(magic) = config::rpc_magic_cmd() {
        if let Some(rest) = cmdline.strip_prefix(&magic) {
            return format!("{} {}", config::rpc_multiplexer_path(), rest.trim_start());
        }
    }
    cmdline.to_string()
}

/// Spawns `cmdline` as `user` via `su`, wiring up pipes for stdin always and for
/// stdout/stderr only when `capture` is set (`MSG_JUST_EXEC` fires the command
/// and never looks at its output again).
pub fn do_exec(user: &str, cmdline: &str, capture: bool) -> io::Result<Child> {
    let actual_cmd = rewrite_magic_cmd(cmdline);
    let stdout = if capture { Stdio::piped() } else { Stdio::null() };
    let stderr = if capture { Stdio::piped() } else { Stdio::null() };
    Command::new("su")
        .arg("-")
        .arg(user)
        .arg("-c")
        .arg(&actual_cmd)
        .stdin(Stdio::piped())
        .stdout(stdout)
        .stderr(stderr)
        .spawn()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_exec_payload_splits_user_and_command() {
        let (user, cmd) = parse_exec_payload(b"alice:ls -la /tmp");
        assert_eq!(user, "alice");
        assert_eq!(cmd, "ls -la /tmp");
    }

    #[test]
    fn parse_exec_payload_without_separator_uses_default_user() {
        std::env::remove_var("QREXEC_DEFAULT_USER");
        let (user, cmd) = parse_exec_payload(b"ls -la /tmp");
        assert_eq!(user, "user");
        assert_eq!(cmd, "ls -la /tmp");
    }

    #[test]
    fn rewrite_magic_cmd_leaves_ordinary_commands_untouched() {
        std::env::remove_var("QUBES_RPC_MAGIC_CMD");
        assert_eq!(rewrite_magic_cmd("ls -la"), "ls -la");
    }

    #[test]
    fn rewrite_magic_cmd_substitutes_the_multiplexer() {
        std::env::set_var("QUBES_RPC_MAGIC_CMD", "QUBESRPC ");
        std::env::set_var("QUBES_RPC_MULTIPLEXER_PATH", "/usr/lib/qubes/rpc-mux");
        let rewritten = rewrite_magic_cmd("QUBESRPC qubes.Filecopy other-vm");
        assert_eq!(rewritten, "/usr/lib/qubes/rpc-mux qubes.Filecopy other-vm");
        std::env::remove_var("QUBES_RPC_MAGIC_CMD");
        std::env::remove_var("QUBES_RPC_MULTIPLEXER_PATH");
    }
}
