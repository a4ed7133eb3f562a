// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The per-VM qrexec agent: runs inside the VM, spawns requested commands,
//! and relays their stdio to the daemon over one vchan transport.

pub mod event_loop;
pub mod exec;
pub mod fdpass;
pub mod process;
pub mod trigger_fifo;

pub use event_loop::Agent;
