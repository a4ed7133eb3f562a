// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Trigger-record sanitization and the §9-mandated move from fixed-size NUL-padded
//! C structs to explicitly-sized byte arrays with a declared alphabet.
//!
//! Grounded on `qrexec/qrexec_daemon.c`'s `sanitize_name` and
//! `handle_execute_predefined_command`, and on `qrexec.h`'s
//! `struct trigger_connect_params`.

/// Replaces any byte not in `[A-Za-z0-9$_.\- ]` with `_`, in place. Mirrors
/// `sanitize_name` exactly, including which bytes are left alone.
pub fn sanitize_name(bytes: &mut [u8]) {
    for b in bytes.iter_mut() {
        let allowed = b.is_ascii_alphanumeric()
            || matches!(*b, b'$' | b'_' | b'.' | b'-' | b' ');
        if !allowed {
            *b = b'_';
        }
    }
}

/// Sanitizes only the occupied prefix of a fixed-width, NUL-padded field (up to
/// the first NUL, or the whole field if there is none), leaving the padding
/// alone. `sanitize_name` itself has no notion of NUL-termination — `\0` is not
/// in the allowed alphabet, so running it over the full field would stamp every
/// padding byte to `_` and leave `field_to_string` nothing to trim on. Mirrors
/// `sanitize_name`'s own NUL-bounded loop in the original.
fn sanitize_occupied(field: &mut [u8]) {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    sanitize_name(&mut field[..end]);
}

/// A `{service, target_vm, fd_ident}` trigger payload read from the agent's trigger
/// FIFO (§6). Historically three fixed-size NUL-padded C char arrays; here each
/// field is an explicitly-sized byte array so the declared alphabet and length are
/// part of the type, not a convention callers must remember.
#[derive(Debug, Clone)]
pub struct TriggerRecord {
    pub service: [u8; 64],
    pub target_vm: [u8; 32],
    pub ident: [u8; 32],
}

impl TriggerRecord {
    pub const WIRE_SIZE: usize = 64 + 32 + 32;

    /// Parses a raw on-wire record and sanitizes every field before returning it —
    /// callers never see an unsanitized `TriggerRecord`.
    pub fn decode(buf: &[u8; Self::WIRE_SIZE]) -> Self {
        let mut service = [0u8; 64];
        let mut target_vm = [0u8; 32];
        let mut ident = [0u8; 32];
        service.copy_from_slice(&buf[0..64]);
        target_vm.copy_from_slice(&buf[64..96]);
        ident.copy_from_slice(&buf[96..128]);
        sanitize_occupied(&mut service);
        sanitize_occupied(&mut target_vm);
        sanitize_occupied(&mut ident);
        TriggerRecord {
            service,
            target_vm,
            ident,
        }
    }

    /// Trims trailing NULs and converts to an argv-ready `String`. Sanitization has
    /// already removed every byte that isn't in the declared alphabet, so this is
    /// always a valid (if possibly empty) ASCII string.
    pub fn service_str(&self) -> String {
        field_to_string(&self.service)
    }

    pub fn target_vm_str(&self) -> String {
        field_to_string(&self.target_vm)
    }

    pub fn ident_str(&self) -> String {
        field_to_string(&self.ident)
    }
}

fn field_to_string(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_disallowed_bytes() {
        let mut name = b"foo;rm -rf /".to_vec();
        sanitize_name(&mut name);
        assert_eq!(&name, b"foo_rm_-rf__");
    }

    #[test]
    fn sanitize_leaves_allowed_alphabet_untouched() {
        let mut name = b"vm1_test-2.3$ ok".to_vec();
        let before = name.clone();
        sanitize_name(&mut name);
        assert_eq!(name, before);
    }

    #[test]
    fn trigger_record_round_trip_sanitizes_each_field() {
        let mut raw = [0u8; TriggerRecord::WIRE_SIZE];
        raw[..11].copy_from_slice(b"foo;rm -rf ");
        raw[64..68].copy_from_slice(b"vm1\0");
        raw[96..101].copy_from_slice(b"0 1 2");
        let record = TriggerRecord::decode(&raw);
        assert_eq!(record.service_str(), "foo_rm_-rf_");
        assert_eq!(record.target_vm_str(), "vm1");
        assert_eq!(record.ident_str(), "0 1 2");
    }
}
