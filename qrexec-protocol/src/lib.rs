// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Typed, length-prefixed messages layered over the vchan transport, plus the
//! building blocks both the daemon and the agent need on top of raw frames: a
//! bounded stream buffer, trigger-record sanitization, allocated client ids, and
//! environment-driven configuration.

pub mod config;
pub mod frame;
pub mod ident;
pub mod sanitize;
pub mod signal;
pub mod stream_buffer;

pub use frame::{
    ClientAssembler, ClientHeader, FrameError, MsgType, TransportAssembler, TransportHeader,
    MAX_CHUNK, MAX_FDS,
};
pub use ident::{ClientId, IdAllocator};
pub use sanitize::{sanitize_name, TriggerRecord};
pub use signal::{ignore_sigpipe, ChildSignal};
pub use stream_buffer::{BufferLimitExceeded, StreamBuffer, BUFFER_LIMIT};
