// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Shared-memory ring buffer transport.
//!
//! Mirrors `vchan/io.c` and `vchan/libvchan.h` from the historical implementation:
//! a shared region holding two fixed-size byte buffers (one per direction) and four
//! monotonic `u32` producer/consumer indices, plus a closed-flag per side. Indices
//! never wrap down; only the low bits (modulo buffer size) select a byte offset.

use std::sync::atomic::{AtomicU32, Ordering};

/// Size of the server's outbound buffer (`buf_in` in the historical struct).
pub const RING_IN_SIZE: usize = 1024;
/// Size of the client's outbound buffer (`buf_out` in the historical struct).
pub const RING_OUT_SIZE: usize = 2048;

const DEBUG_MARK: u32 = 0xaabbccdd;

/// The layout placed in the shared memory segment. Both peers map the exact same
/// bytes; this struct's field order and sizes are the wire contract between them.
#[repr(C)]
pub(crate) struct RawRing {
    buf_in: [u8; RING_IN_SIZE],
    buf_out: [u8; RING_OUT_SIZE],
    cons_in: AtomicU32,
    prod_in: AtomicU32,
    cons_out: AtomicU32,
    prod_out: AtomicU32,
    debug: AtomicU32,
    client_closed: AtomicU32,
    server_closed: AtomicU32,
}

pub(crate) const RAW_RING_SIZE: usize = std::mem::size_of::<RawRing>();

impl RawRing {
    /// Zeroes every index and flag, as `ring_init` does in the original. Only the
    /// side that creates the segment (the server) calls this.
    pub(crate) unsafe fn init_in_place(ptr: *mut RawRing) {
        let raw = &mut *ptr;
        raw.buf_in = [0; RING_IN_SIZE];
        raw.buf_out = [0; RING_OUT_SIZE];
        raw.cons_in.store(0, Ordering::Relaxed);
        raw.prod_in.store(0, Ordering::Relaxed);
        raw.cons_out.store(0, Ordering::Relaxed);
        raw.prod_out.store(0, Ordering::Relaxed);
        raw.debug.store(DEBUG_MARK, Ordering::Relaxed);
        raw.client_closed.store(0, Ordering::Release);
        raw.server_closed.store(0, Ordering::Release);
    }
}

/// Which end of the ring a process occupies. Fixed for the lifetime of a [`Ring`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// A direction-aware view over a shared [`RawRing`].
///
/// `Role::Server` writes into `buf_in` and reads `buf_out`; `Role::Client` is the
/// mirror image. This plays the part of the `dir_select` macro in `vchan/init.c`:
/// the read/write code below never names `buf_in`/`buf_out` directly, only
/// `wr_*`/`rd_*`, so the same logic serves both roles.
pub(crate) struct Ring {
    raw: *mut RawRing,
    role: Role,
}

// SAFETY: every access goes through atomics or through byte ranges whose producer/
// consumer discipline is exactly the synchronization primitive (see §4.1); there is
// no process-local aliasing concern since `Ring` is only ever owned by the one
// `vchan::Channel` that wraps it.
unsafe impl Send for Ring {}

impl Ring {
    /// # Safety
    /// `ptr` must point to a valid, mapped `RawRing` for the entire lifetime of the
    /// returned `Ring`.
    pub(crate) unsafe fn from_raw(ptr: *mut RawRing, role: Role) -> Self {
        Ring { raw: ptr, role }
    }

    fn raw(&self) -> &RawRing {
        unsafe { &*self.raw }
    }

    fn wr_cons(&self) -> &AtomicU32 {
        match self.role {
            Role::Server => &self.raw().cons_in,
            Role::Client => &self.raw().cons_out,
        }
    }

    fn wr_prod(&self) -> &AtomicU32 {
        match self.role {
            Role::Server => &self.raw().prod_in,
            Role::Client => &self.raw().prod_out,
        }
    }

    fn rd_cons(&self) -> &AtomicU32 {
        match self.role {
            Role::Server => &self.raw().cons_out,
            Role::Client => &self.raw().cons_in,
        }
    }

    fn rd_prod(&self) -> &AtomicU32 {
        match self.role {
            Role::Server => &self.raw().prod_out,
            Role::Client => &self.raw().prod_in,
        }
    }

    fn wr_buf(&self) -> *mut u8 {
        match self.role {
            Role::Server => self.raw().buf_in.as_ptr() as *mut u8,
            Role::Client => self.raw().buf_out.as_ptr() as *mut u8,
        }
    }

    fn rd_buf(&self) -> *const u8 {
        match self.role {
            Role::Server => self.raw().buf_out.as_ptr(),
            Role::Client => self.raw().buf_in.as_ptr(),
        }
    }

    fn wr_ring_size(&self) -> u32 {
        match self.role {
            Role::Server => RING_IN_SIZE as u32,
            Role::Client => RING_OUT_SIZE as u32,
        }
    }

    fn rd_ring_size(&self) -> u32 {
        match self.role {
            Role::Server => RING_OUT_SIZE as u32,
            Role::Client => RING_IN_SIZE as u32,
        }
    }

    /// How much data is immediately available for reading.
    pub(crate) fn data_ready(&self) -> usize {
        let prod = self.rd_prod().load(Ordering::Acquire);
        let cons = self.rd_cons().load(Ordering::Acquire);
        prod.wrapping_sub(cons) as usize
    }

    /// How much space is available for writing, without blocking.
    pub(crate) fn buffer_space(&self) -> usize {
        let prod = self.wr_prod().load(Ordering::Acquire);
        let cons = self.wr_cons().load(Ordering::Acquire);
        self.wr_ring_size().wrapping_sub(prod.wrapping_sub(cons)) as usize
    }

    /// Copies up to `data.len()` bytes into the producer region, respecting
    /// wraparound, and advances the producer index. Returns the number of bytes
    /// actually written — zero if there is no space. Never blocks.
    pub(crate) fn write(&self, data: &[u8]) -> usize {
        let avail = self.buffer_space();
        if avail == 0 || data.is_empty() {
            return 0;
        }
        let mut avail = avail.min(data.len());
        let ring_size = self.wr_ring_size() as usize;
        let prod = self.wr_prod().load(Ordering::Relaxed);
        let real_idx = (prod & (ring_size as u32 - 1)) as usize;
        let avail_contig = ring_size - real_idx;
        if avail_contig < avail {
            avail = avail_contig;
        }
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.wr_buf().add(real_idx), avail);
        }
        self.wr_prod()
            .store(prod.wrapping_add(avail as u32), Ordering::Release);
        avail
    }

    /// Symmetric to [`Ring::write`] on the consumer side.
    pub(crate) fn read(&self, data: &mut [u8]) -> usize {
        let avail = self.data_ready();
        if avail == 0 || data.is_empty() {
            return 0;
        }
        let mut avail = avail.min(data.len());
        let ring_size = self.rd_ring_size() as usize;
        let cons = self.rd_cons().load(Ordering::Relaxed);
        let real_idx = (cons & (ring_size as u32 - 1)) as usize;
        let avail_contig = ring_size - real_idx;
        if avail_contig < avail {
            avail = avail_contig;
        }
        unsafe {
            std::ptr::copy_nonoverlapping(self.rd_buf().add(real_idx), data.as_mut_ptr(), avail);
        }
        self.rd_cons()
            .store(cons.wrapping_add(avail as u32), Ordering::Release);
        avail
    }

    /// Whether this writer's producer has fully drained (consumer caught up).
    pub(crate) fn write_side_drained(&self) -> bool {
        self.wr_prod().load(Ordering::Acquire) == self.wr_cons().load(Ordering::Acquire)
    }

    /// `0 ≤ producer − consumer ≤ buffer_size` for both directions — the invariant
    /// every observation must satisfy (§8). A violation indicates a corrupt or
    /// malicious peer.
    pub(crate) fn check_invariants(&self) -> bool {
        let wr_diff = self
            .wr_prod()
            .load(Ordering::Acquire)
            .wrapping_sub(self.wr_cons().load(Ordering::Acquire));
        let rd_diff = self
            .rd_prod()
            .load(Ordering::Acquire)
            .wrapping_sub(self.rd_cons().load(Ordering::Acquire));
        wr_diff <= self.wr_ring_size() && rd_diff <= self.rd_ring_size()
    }

    pub(crate) fn role(&self) -> Role {
        self.role
    }

    pub(crate) fn set_own_closed(&self) {
        match self.role {
            Role::Server => self.raw().server_closed.store(1, Ordering::Release),
            Role::Client => self.raw().client_closed.store(1, Ordering::Release),
        }
    }

    pub(crate) fn set_peer_closed(&self) {
        match self.role {
            Role::Server => self.raw().client_closed.store(1, Ordering::Release),
            Role::Client => self.raw().server_closed.store(1, Ordering::Release),
        }
    }

    pub(crate) fn peer_closed(&self) -> bool {
        match self.role {
            Role::Server => self.raw().client_closed.load(Ordering::Acquire) != 0,
            Role::Client => self.raw().server_closed.load(Ordering::Acquire) != 0,
        }
    }

    pub(crate) fn own_closed(&self) -> bool {
        match self.role {
            Role::Server => self.raw().server_closed.load(Ordering::Acquire) != 0,
            Role::Client => self.raw().client_closed.load(Ordering::Acquire) != 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_pair() -> (Box<RawRing>, *mut RawRing) {
        let mut boxed: Box<RawRing> = unsafe { Box::new(std::mem::zeroed()) };
        let ptr: *mut RawRing = &mut *boxed;
        unsafe { RawRing::init_in_place(ptr) };
        (boxed, ptr)
    }

    #[test]
    fn write_then_read_round_trips() {
        let (_owner, ptr) = make_pair();
        let server = unsafe { Ring::from_raw(ptr, Role::Server) };
        let client = unsafe { Ring::from_raw(ptr, Role::Client) };

        let n = server.write(b"hello");
        assert_eq!(n, 5);
        assert_eq!(client.data_ready(), 5);

        let mut buf = [0u8; 5];
        let n = client.read(&mut buf);
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(client.data_ready(), 0);
    }

    #[test]
    fn write_reports_zero_when_full() {
        let (_owner, ptr) = make_pair();
        let server = unsafe { Ring::from_raw(ptr, Role::Server) };
        let filler = vec![7u8; RING_IN_SIZE];
        let n = server.write(&filler);
        assert_eq!(n, RING_IN_SIZE);
        assert_eq!(server.write(b"more"), 0);
    }

    #[test]
    fn wraps_around_contiguous_boundary() {
        let (_owner, ptr) = make_pair();
        let server = unsafe { Ring::from_raw(ptr, Role::Server) };
        let client = unsafe { Ring::from_raw(ptr, Role::Client) };

        let half = vec![1u8; RING_IN_SIZE - 4];
        assert_eq!(server.write(&half), half.len());
        let mut drain = vec![0u8; half.len()];
        assert_eq!(client.read(&mut drain), half.len());

        let wrapping = vec![2u8; 16];
        assert_eq!(server.write(&wrapping), wrapping.len());
        let mut out = vec![0u8; wrapping.len()];
        assert_eq!(client.read(&mut out), wrapping.len());
        assert_eq!(out, wrapping);
    }

    #[test]
    fn invariants_hold_after_partial_drain() {
        let (_owner, ptr) = make_pair();
        let server = unsafe { Ring::from_raw(ptr, Role::Server) };
        let client = unsafe { Ring::from_raw(ptr, Role::Client) };
        server.write(&[9u8; 100]);
        let mut buf = [0u8; 40];
        client.read(&mut buf);
        assert!(server.check_invariants());
        assert!(client.check_invariants());
    }

    #[test]
    fn closed_flags_are_per_side() {
        let (_owner, ptr) = make_pair();
        let server = unsafe { Ring::from_raw(ptr, Role::Server) };
        let client = unsafe { Ring::from_raw(ptr, Role::Client) };
        assert!(!server.peer_closed());
        client.set_own_closed();
        assert!(server.peer_closed());
        assert!(!server.own_closed());
    }
}
