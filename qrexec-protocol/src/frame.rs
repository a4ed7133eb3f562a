// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Wire framing: header shapes and message types shared by the daemon, agent, and
//! client. All header fields are little-endian `u32`s (bit-exact, §6) — this is a
//! plain fixed-layout header, not an XDR-encoded message, so encoding is a direct
//! `to_le_bytes`/`from_le_bytes` round trip rather than a generated codec.

use std::io::{self, Read, Write};

/// Maximum payload size for any single frame, transport or client. Grounded on
/// `qrexec.h`'s `MAX_DATA_CHUNK`.
pub const MAX_CHUNK: u32 = 4096;

/// Upper bound on the number of concurrently live client ids. Grounded on
/// `qrexec.h`'s `MAX_FDS`.
pub const MAX_FDS: u32 = 256;

/// One wire message type. Numeric values match the historical `MSG_*` enum in
/// `qrexec.h` exactly (several logical names share a discriminant because the same
/// byte travels unchanged between hops — e.g. `MSG_AGENT_TO_SERVER_STDOUT` and
/// `MSG_SERVER_TO_CLIENT_STDOUT` are both `MsgType::Stdout`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MsgType {
    ExecCmdline = 0x100,
    JustExec = 0x101,
    ConnectExisting = 0x102,
    Input = 0x103,
    ClientEnd = 0x104,
    Xoff = 0x105,
    Xon = 0x106,
    Stdout = 0x107,
    Stderr = 0x108,
    ExitCode = 0x109,
    TriggerConnectExisting = 0x10a,
}

impl MsgType {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0x100 => MsgType::ExecCmdline,
            0x101 => MsgType::JustExec,
            0x102 => MsgType::ConnectExisting,
            0x103 => MsgType::Input,
            0x104 => MsgType::ClientEnd,
            0x105 => MsgType::Xoff,
            0x106 => MsgType::Xon,
            0x107 => MsgType::Stdout,
            0x108 => MsgType::Stderr,
            0x109 => MsgType::ExitCode,
            0x10a => MsgType::TriggerConnectExisting,
            _ => return None,
        })
    }
}

/// `{ type, client_id, length }` header used on the multiplexed daemon↔agent
/// transport (§3).
#[derive(Debug, Clone, Copy)]
pub struct TransportHeader {
    pub msg_type: MsgType,
    pub client_id: u32,
    pub length: u32,
}

impl TransportHeader {
    pub const WIRE_SIZE: usize = 12;

    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..4].copy_from_slice(&(self.msg_type as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&self.client_id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.length.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; Self::WIRE_SIZE]) -> Result<Self, FrameError> {
        let ty = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let client_id = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let length = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let msg_type = MsgType::from_u32(ty).ok_or(FrameError::UnknownType(ty))?;
        if length > MAX_CHUNK {
            return Err(FrameError::LengthTooLarge(length));
        }
        if client_id >= MAX_FDS {
            return Err(FrameError::ClientIdOutOfRange(client_id));
        }
        Ok(TransportHeader {
            msg_type,
            client_id,
            length,
        })
    }

    /// Reads one header plus its payload from `r`. Rejects oversized/garbage
    /// headers per §7's frame-sanitization taxonomy instead of trying to recover.
    pub fn read_frame<R: Read>(r: &mut R) -> Result<(Self, Vec<u8>), FrameError> {
        let mut hdr_buf = [0u8; Self::WIRE_SIZE];
        r.read_exact(&mut hdr_buf)?;
        let header = Self::decode(&hdr_buf)?;
        let mut payload = vec![0u8; header.length as usize];
        r.read_exact(&mut payload)?;
        Ok((header, payload))
    }

    pub fn write_frame<W: Write>(&self, w: &mut W, payload: &[u8]) -> io::Result<()> {
        debug_assert_eq!(payload.len() as u32, self.length);
        w.write_all(&self.encode())?;
        w.write_all(payload)
    }
}

/// `{ type, length }` header used on the local, unmultiplexed client↔daemon socket
/// (§3) — the socket itself stands in for the client id.
#[derive(Debug, Clone, Copy)]
pub struct ClientHeader {
    pub msg_type: MsgType,
    pub length: u32,
}

impl ClientHeader {
    pub const WIRE_SIZE: usize = 8;

    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..4].copy_from_slice(&(self.msg_type as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&self.length.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; Self::WIRE_SIZE]) -> Result<Self, FrameError> {
        let ty = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let length = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let msg_type = MsgType::from_u32(ty).ok_or(FrameError::UnknownType(ty))?;
        if length > MAX_CHUNK {
            return Err(FrameError::LengthTooLarge(length));
        }
        Ok(ClientHeader { msg_type, length })
    }

    pub fn read_frame<R: Read>(r: &mut R) -> Result<(Self, Vec<u8>), FrameError> {
        let mut hdr_buf = [0u8; Self::WIRE_SIZE];
        r.read_exact(&mut hdr_buf)?;
        let header = Self::decode(&hdr_buf)?;
        let mut payload = vec![0u8; header.length as usize];
        r.read_exact(&mut payload)?;
        Ok((header, payload))
    }

    pub fn write_frame<W: Write>(&self, w: &mut W, payload: &[u8]) -> io::Result<()> {
        debug_assert_eq!(payload.len() as u32, self.length);
        w.write_all(&self.encode())?;
        w.write_all(payload)
    }
}

/// Incrementally reassembles `TransportHeader` frames out of bytes arriving in
/// arbitrary-sized chunks off a non-blocking channel. Feed it whatever `read`
/// returns, then drain complete frames with `try_take_frame` — a header split
/// across two non-blocking reads is the common case here, not an edge case.
#[derive(Debug, Default)]
pub struct TransportAssembler {
    buf: Vec<u8>,
}

impl TransportAssembler {
    pub fn new() -> Self {
        TransportAssembler { buf: Vec::new() }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Returns the next complete frame, if the buffer holds one yet. A malformed
    /// header is reported once and does not need to be asked for again — the
    /// caller is expected to treat it as fatal per §7 rather than keep polling.
    pub fn try_take_frame(&mut self) -> Result<Option<(TransportHeader, Vec<u8>)>, FrameError> {
        if self.buf.len() < TransportHeader::WIRE_SIZE {
            return Ok(None);
        }
        let mut hdr_buf = [0u8; TransportHeader::WIRE_SIZE];
        hdr_buf.copy_from_slice(&self.buf[..TransportHeader::WIRE_SIZE]);
        let header = TransportHeader::decode(&hdr_buf)?;
        let total = TransportHeader::WIRE_SIZE + header.length as usize;
        if self.buf.len() < total {
            return Ok(None);
        }
        let payload = self.buf[TransportHeader::WIRE_SIZE..total].to_vec();
        self.buf.drain(..total);
        Ok(Some((header, payload)))
    }
}

/// Same idea as [`TransportAssembler`] but for the unmultiplexed client↔daemon
/// socket, which uses `ClientHeader` instead.
#[derive(Debug, Default)]
pub struct ClientAssembler {
    buf: Vec<u8>,
}

impl ClientAssembler {
    pub fn new() -> Self {
        ClientAssembler { buf: Vec::new() }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn try_take_frame(&mut self) -> Result<Option<(ClientHeader, Vec<u8>)>, FrameError> {
        if self.buf.len() < ClientHeader::WIRE_SIZE {
            return Ok(None);
        }
        let mut hdr_buf = [0u8; ClientHeader::WIRE_SIZE];
        hdr_buf.copy_from_slice(&self.buf[..ClientHeader::WIRE_SIZE]);
        let header = ClientHeader::decode(&hdr_buf)?;
        let total = ClientHeader::WIRE_SIZE + header.length as usize;
        if self.buf.len() < total {
            return Ok(None);
        }
        let payload = self.buf[ClientHeader::WIRE_SIZE..total].to_vec();
        self.buf.drain(..total);
        Ok(Some((header, payload)))
    }
}

/// Frame-sanitization failures (§7): these are always treated as malicious input,
/// never recovered from.
#[derive(Debug)]
pub enum FrameError {
    Io(io::Error),
    UnknownType(u32),
    LengthTooLarge(u32),
    ClientIdOutOfRange(u32),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Io(e) => write!(f, "I/O error reading frame: {e}"),
            FrameError::UnknownType(t) => write!(f, "unknown message type 0x{t:x}"),
            FrameError::LengthTooLarge(l) => {
                write!(f, "frame length {l} exceeds MAX_CHUNK ({MAX_CHUNK})")
            }
            FrameError::ClientIdOutOfRange(id) => {
                write!(f, "client_id {id} is out of range (MAX_FDS = {MAX_FDS})")
            }
        }
    }
}

impl std::error::Error for FrameError {}

impl From<io::Error> for FrameError {
    fn from(e: io::Error) -> Self {
        FrameError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_header_round_trips() {
        let hdr = TransportHeader {
            msg_type: MsgType::Input,
            client_id: 7,
            length: 3,
        };
        let encoded = hdr.encode();
        let decoded = TransportHeader::decode(&encoded).unwrap();
        assert_eq!(decoded.client_id, 7);
        assert_eq!(decoded.length, 3);
        assert_eq!(decoded.msg_type, MsgType::Input);
    }

    #[test]
    fn rejects_length_over_max_chunk() {
        let mut buf = [0u8; TransportHeader::WIRE_SIZE];
        buf[0..4].copy_from_slice(&(MsgType::Stdout as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&0u32.to_le_bytes());
        buf[8..12].copy_from_slice(&(MAX_CHUNK + 1).to_le_bytes());
        assert!(matches!(
            TransportHeader::decode(&buf),
            Err(FrameError::LengthTooLarge(_))
        ));
    }

    #[test]
    fn rejects_client_id_out_of_range() {
        let mut buf = [0u8; TransportHeader::WIRE_SIZE];
        buf[0..4].copy_from_slice(&(MsgType::Stdout as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&MAX_FDS.to_le_bytes());
        buf[8..12].copy_from_slice(&0u32.to_le_bytes());
        assert!(matches!(
            TransportHeader::decode(&buf),
            Err(FrameError::ClientIdOutOfRange(_))
        ));
    }

    #[test]
    fn rejects_unknown_type() {
        let mut buf = [0u8; TransportHeader::WIRE_SIZE];
        buf[0..4].copy_from_slice(&0xdeadu32.to_le_bytes());
        assert!(matches!(
            TransportHeader::decode(&buf),
            Err(FrameError::UnknownType(_))
        ));
    }

    #[test]
    fn frame_length_0xffffffff_is_rejected() {
        let mut buf = [0u8; TransportHeader::WIRE_SIZE];
        buf[0..4].copy_from_slice(&(MsgType::Stdout as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&0u32.to_le_bytes());
        buf[8..12].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        assert!(matches!(
            TransportHeader::decode(&buf),
            Err(FrameError::LengthTooLarge(_))
        ));
    }

    #[test]
    fn client_header_round_trips_via_stream() {
        let hdr = ClientHeader {
            msg_type: MsgType::JustExec,
            length: 5,
        };
        let mut buf = Vec::new();
        hdr.write_frame(&mut buf, b"hello").unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let (decoded, payload) = ClientHeader::read_frame(&mut cursor).unwrap();
        assert_eq!(decoded.msg_type, MsgType::JustExec);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn transport_assembler_reassembles_a_header_split_across_feeds() {
        let hdr = TransportHeader {
            msg_type: MsgType::Stdout,
            client_id: 3,
            length: 4,
        };
        let mut wire = Vec::new();
        hdr.write_frame(&mut wire, b"abcd").unwrap();

        let mut assembler = TransportAssembler::new();
        assembler.feed(&wire[..5]);
        assert!(assembler.try_take_frame().unwrap().is_none());
        assembler.feed(&wire[5..]);
        let (got, payload) = assembler.try_take_frame().unwrap().unwrap();
        assert_eq!(got.client_id, 3);
        assert_eq!(payload, b"abcd");
        assert!(assembler.try_take_frame().unwrap().is_none());
    }

    #[test]
    fn transport_assembler_yields_back_to_back_frames_fed_at_once() {
        let a = TransportHeader {
            msg_type: MsgType::Input,
            client_id: 1,
            length: 1,
        };
        let b = TransportHeader {
            msg_type: MsgType::Input,
            client_id: 2,
            length: 1,
        };
        let mut wire = Vec::new();
        a.write_frame(&mut wire, b"x").unwrap();
        b.write_frame(&mut wire, b"y").unwrap();

        let mut assembler = TransportAssembler::new();
        assembler.feed(&wire);
        let (h1, p1) = assembler.try_take_frame().unwrap().unwrap();
        assert_eq!(h1.client_id, 1);
        assert_eq!(p1, b"x");
        let (h2, p2) = assembler.try_take_frame().unwrap().unwrap();
        assert_eq!(h2.client_id, 2);
        assert_eq!(p2, b"y");
    }
}
