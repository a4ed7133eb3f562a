// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Establishment of a vchan [`crate::Channel`] over POSIX shared memory plus a
//! short-lived Unix handshake socket.
//!
//! Grounded on `vchan/init.c`'s `server_interface_init`/`client_interface_init`: the
//! server allocates the shared page and an event-channel handle, publishes both
//! under a well-known directory entry indexed by a logical port number, and blocks
//! for the client to bind. Here the "well-known directory entry" is a Unix socket
//! path, and the "event-channel handle" is a pair of `eventfd`s exchanged via
//! `SCM_RIGHTS`, since there is no hypervisor to publish a ring-ref/event-channel
//! pair through xenstore.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use nix::sys::uio::IoSlice;

use crate::ring::RAW_RING_SIZE;

pub(crate) fn handshake_path(dir: &Path, port: u32) -> PathBuf {
    dir.join(format!("{port}.sock"))
}

fn shm_name(port: u32) -> std::ffi::CString {
    std::ffi::CString::new(format!("/qrexec-vchan-{port}")).expect("no interior NUL")
}

/// Creates and sizes a fresh POSIX shared-memory object, returning the owning fd and
/// a pointer to the mapped region. The caller is responsible for running
/// [`crate::ring::RawRing::init_in_place`] before anyone else maps the same name.
pub(crate) fn create_shm(port: u32) -> io::Result<(OwnedFd, *mut u8)> {
    let name = shm_name(port);
    let fd = unsafe {
        libc::shm_open(
            name.as_ptr(),
            libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
            0o600,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    if unsafe { libc::ftruncate(fd.as_raw_fd(), RAW_RING_SIZE as libc::off_t) } != 0 {
        let _ = unsafe { libc::shm_unlink(name.as_ptr()) };
        return Err(io::Error::last_os_error());
    }
    let ptr = map_shm(&fd)?;
    Ok((fd, ptr))
}

/// Opens an already-created shared-memory object by its logical port number.
pub(crate) fn open_shm(port: u32) -> io::Result<(OwnedFd, *mut u8)> {
    let name = shm_name(port);
    let fd = unsafe { libc::shm_open(name.as_ptr(), libc::O_RDWR, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    let ptr = map_shm(&fd)?;
    Ok((fd, ptr))
}

pub(crate) fn unlink_shm(port: u32) {
    let name = shm_name(port);
    unsafe {
        libc::shm_unlink(name.as_ptr());
    }
}

fn map_shm(fd: &OwnedFd) -> io::Result<*mut u8> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            RAW_RING_SIZE,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd.as_raw_fd(),
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(ptr as *mut u8)
}

pub(crate) unsafe fn unmap_shm(ptr: *mut u8) {
    libc::munmap(ptr as *mut libc::c_void, RAW_RING_SIZE);
}

/// Creates a Linux `eventfd`, non-blocking, close-on-exec — the stand-in for the
/// hypervisor's inter-domain event channel.
pub(crate) fn create_eventfd() -> io::Result<OwnedFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Server half: listens once at `path`, accepts a single peer, and hands it the shm
/// name plus both event-channel fds via `SCM_RIGHTS`.
pub(crate) fn server_exchange(
    path: &Path,
    port: u32,
    to_client: RawFd,
    to_server: RawFd,
) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let _ = std::fs::remove_file(path);
    let listener = UnixListener::bind(path)?;
    let (stream, _) = listener.accept()?;
    drop(listener);
    let _ = std::fs::remove_file(path);

    let payload = port.to_le_bytes();
    let fds = [to_client, to_server];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    sendmsg::<()>(
        stream.as_raw_fd(),
        &[IoSlice::new(&payload)],
        &cmsg,
        MsgFlags::empty(),
        None,
    )
    .map_err(io::Error::from)?;
    Ok(())
}

/// Client half: connects to `path` and receives the shm port and the two
/// event-channel fds the server just created.
///
/// Returns `(port, wait_fd, notify_fd)`: `wait_fd` is the fd the server writes to in
/// order to wake the client, `notify_fd` is the fd the client writes to in order to
/// wake the server — the same two roles `ctrl->evfd` plays for each side in the
/// historical implementation.
pub(crate) fn client_exchange(path: &Path) -> io::Result<(u32, OwnedFd, OwnedFd)> {
    let stream = UnixStream::connect(path)?;
    let mut cmsg_space = nix::cmsg_space!([RawFd; 2]);
    let mut payload = [0u8; 4];
    let mut iov = [std::io::IoSliceMut::new(&mut payload)];
    let msg = recvmsg::<()>(
        stream.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_space),
        MsgFlags::empty(),
    )
    .map_err(io::Error::from)?;
    let port = u32::from_le_bytes(payload);

    let mut received: Vec<OwnedFd> = Vec::new();
    for cmsg in msg
        .cmsgs()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "malformed control message"))?
    {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            for fd in fds {
                received.push(unsafe { OwnedFd::from_raw_fd(fd) });
            }
        }
    }
    if received.len() != 2 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "expected exactly two passed file descriptors during vchan handshake",
        ));
    }
    let notify_fd = received.remove(1);
    let wait_fd = received.remove(0);
    Ok((port, wait_fd, notify_fd))
}
