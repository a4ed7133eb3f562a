// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The agent's trigger FIFO: local tools write one fixed-size
//! `{service[64], target_vm[32], ident[32]}` record at a time, and each record
//! becomes a `MSG_TRIGGER_CONNECT_EXISTING` frame sent upward to the daemon.
//! Grounded on `qrexec_agent.c`'s `handle_agent_trigger`/the `qrexec_agent` named
//! pipe it opens with `mkfifo(..., 0666)`.

use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use qrexec_protocol::TriggerRecord;

pub struct TriggerFifo {
    file: File,
    buf: Vec<u8>,
}

impl TriggerFifo {
    /// Creates the FIFO at `path` (mode `0666`, matching local tools' historical
    /// expectations) and opens it for non-blocking reads.
    pub fn create(path: &Path) -> io::Result<Self> {
        let _ = std::fs::remove_file(path);
        let rc = unsafe {
            libc::mkfifo(
                std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
                    .expect("no interior NUL")
                    .as_ptr(),
                0o666,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)?;
        Ok(TriggerFifo {
            file,
            buf: Vec::new(),
        })
    }

    pub fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.file.as_raw_fd()
    }

    /// Drains whatever bytes are currently available and returns every
    /// complete `TriggerRecord` found. A FIFO writer writing in one go still
    /// might get split across reads, so partial records are held over.
    pub fn poll_records(&mut self) -> io::Result<Vec<TriggerRecord>> {
        let mut chunk = [0u8; 256];
        loop {
            match self.file.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }

        let mut records = Vec::new();
        while self.buf.len() >= TriggerRecord::WIRE_SIZE {
            let mut raw = [0u8; TriggerRecord::WIRE_SIZE];
            raw.copy_from_slice(&self.buf[..TriggerRecord::WIRE_SIZE]);
            records.push(TriggerRecord::decode(&raw));
            self.buf.drain(..TriggerRecord::WIRE_SIZE);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn records_are_split_out_of_a_single_write() {
        let dir = std::env::temp_dir().join(format!("qrexec-fifo-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("qrexec_agent");
        let mut fifo = TriggerFifo::create(&path).unwrap();

        let writer = std::thread::spawn({
            let path = path.clone();
            move || {
                let mut raw = [0u8; TriggerRecord::WIRE_SIZE * 2];
                raw[..4].copy_from_slice(b"svc1");
                raw[64..68].copy_from_slice(b"vm1\0");
                let second = TriggerRecord::WIRE_SIZE;
                raw[second..second + 4].copy_from_slice(b"svc2");
                let mut writer = OpenOptions::new().write(true).open(&path).unwrap();
                writer.write_all(&raw).unwrap();
            }
        });

        let mut records = Vec::new();
        for _ in 0..50 {
            records.extend(fifo.poll_records().unwrap());
            if records.len() == 2 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        writer.join().unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].service_str(), "svc1");
        assert_eq!(records[1].service_str(), "svc2");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
