// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Bounded per-endpoint byte queue, grounded on `qrexec/buffer.c`'s
//! `buffer_append`/`buffer_remove` and its process-wide `limited_malloc` accounting.
//!
//! The original calls `exit(1)` the instant the cap is exceeded; a library is not
//! allowed to terminate its caller's process, so `append` here returns an `Err`
//! instead and leaves it to the daemon/agent event loop to treat that as the fatal
//! resource-exhaustion condition §7 describes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Total bytes across every `StreamBuffer` in this process must stay below this.
pub const BUFFER_LIMIT: usize = 50_000_000;

static TOTAL_BUFFERED: AtomicUsize = AtomicUsize::new(0);

/// Returns the current process-wide total across all live `StreamBuffer`s.
pub fn total_buffered() -> usize {
    TOTAL_BUFFERED.load(Ordering::Relaxed)
}

#[derive(Debug)]
pub struct BufferLimitExceeded;

impl std::fmt::Display for BufferLimitExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "process-wide stream buffer total exceeded BUFFER_LIMIT ({BUFFER_LIMIT} bytes)")
    }
}

impl std::error::Error for BufferLimitExceeded {}

/// An append-only-then-drain FIFO of unsent bytes owed to one endpoint (a local
/// client socket on the daemon side, a child's stdin on the agent side).
#[derive(Debug, Default)]
pub struct StreamBuffer {
    data: VecDeque<u8>,
}

impl StreamBuffer {
    pub fn new() -> Self {
        StreamBuffer {
            data: VecDeque::new(),
        }
    }

    /// Appends `bytes` and charges them against the process-wide total. Fails
    /// without mutating state if doing so would exceed `BUFFER_LIMIT`.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), BufferLimitExceeded> {
        if bytes.is_empty() {
            return Ok(());
        }
        let prev = TOTAL_BUFFERED.fetch_add(bytes.len(), Ordering::SeqCst);
        if prev + bytes.len() > BUFFER_LIMIT {
            TOTAL_BUFFERED.fetch_sub(bytes.len(), Ordering::SeqCst);
            return Err(BufferLimitExceeded);
        }
        self.data.extend(bytes.iter().copied());
        Ok(())
    }

    /// Removes and returns up to `n` of the oldest bytes.
    pub fn drain(&mut self, n: usize) -> Vec<u8> {
        let n = n.min(self.data.len());
        let out: Vec<u8> = self.data.drain(..n).collect();
        TOTAL_BUFFERED.fetch_sub(out.len(), Ordering::SeqCst);
        out
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Drop for StreamBuffer {
    fn drop(&mut self) {
        TOTAL_BUFFERED.fetch_sub(self.data.len(), Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // The process-wide counter is a real global, so serialize the tests that
    // depend on its exact value.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn append_then_drain_tracks_total() {
        let _guard = TEST_LOCK.lock().unwrap();
        let before = total_buffered();
        let mut buf = StreamBuffer::new();
        buf.append(b"hello").unwrap();
        assert_eq!(total_buffered(), before + 5);
        assert_eq!(buf.drain(3), b"hel");
        assert_eq!(buf.len(), 2);
        assert_eq!(total_buffered(), before + 2);
        drop(buf);
        assert_eq!(total_buffered(), before);
    }

    #[test]
    fn append_past_limit_is_rejected_and_not_applied() {
        let _guard = TEST_LOCK.lock().unwrap();
        let before = total_buffered();
        let mut buf = StreamBuffer::new();
        let huge = vec![0u8; BUFFER_LIMIT - before + 1];
        assert!(buf.append(&huge).is_err());
        assert_eq!(buf.len(), 0);
        assert_eq!(total_buffered(), before);
    }
}
