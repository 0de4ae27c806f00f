// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Frame codec for the shared chip bus.
//!
//! Every frame is `preamble | header | length | payload | checksum`.
//! Command frames close with a 1-byte CRC5, job frames with a 2-byte
//! big-endian CRC16; both checksums cover `header | length | payload`.
//! The length byte counts everything after the preamble, checksum
//! included. Chip responses have no header/length, only a fixed-size
//! payload with a CRC5 in the low 5 bits of the last byte.

use failure::Fail;
use packed_struct::prelude::*;

use crate::crc;
use crate::error::{self, ErrorKind};

/// Preamble on frames sent towards the chips
pub const TX_PREAMBLE: [u8; 2] = [0x55, 0xaa];
/// Preamble on frames received from the chips
pub const RX_PREAMBLE: [u8; 2] = [0xaa, 0x55];

/// Length byte overhead of a command frame (header + length + crc5)
const CMD_OVERHEAD: usize = 3;
/// Length byte overhead of a job frame (header + length + crc16)
const JOB_OVERHEAD: usize = 4;

/// Largest payload that still fits the 8-bit length field of a job frame
pub const MAX_PAYLOAD: usize = 0xff - JOB_OVERHEAD;

/// Command codes in the low nibble of the header byte
#[derive(PrimitiveEnum_u8, Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmdCode {
    SetAddress = 0,
    Write = 1,
    Read = 2,
    Inactive = 3,
}

/// Header byte of a bus frame. `cmd` and `job` select the packet kind
/// (exactly one must be set), `broadcast` addresses the whole chain.
#[derive(PackedStruct, Clone, Copy, Debug, PartialEq)]
#[packed_struct(size_bytes = "1", bit_numbering = "msb0")]
pub struct FrameHeader {
    #[packed_field(bits = "1")]
    pub cmd: bool,
    #[packed_field(bits = "2")]
    pub job: bool,
    #[packed_field(bits = "3")]
    pub broadcast: bool,
    #[packed_field(bits = "4..=7", ty = "enum")]
    pub code: CmdCode,
}

impl FrameHeader {
    pub fn cmd(code: CmdCode, broadcast: bool) -> Self {
        Self {
            cmd: true,
            job: false,
            broadcast,
            code,
        }
    }

    pub fn job() -> Self {
        Self {
            cmd: false,
            job: true,
            broadcast: false,
            code: CmdCode::Write,
        }
    }

    pub fn to_byte(&self) -> u8 {
        self.pack().expect("BUG: header pack failed")[0]
    }
}

#[derive(Debug, Clone, PartialEq, Fail)]
pub enum FrameError {
    #[fail(display = "bad preamble")]
    BadPreamble,
    #[fail(display = "length mismatch: got {} bytes, header says {}", _0, _1)]
    LengthMismatch(usize, usize),
    #[fail(display = "checksum mismatch")]
    ChecksumMismatch,
    #[fail(display = "payload too long: {} bytes", _0)]
    Oversize(usize),
    #[fail(display = "bad header byte {:#04x}", _0)]
    BadHeader(u8),
}

impl From<FrameError> for error::Error {
    fn from(e: FrameError) -> Self {
        ErrorKind::Frame(e.to_string()).into()
    }
}

/// Frame parsed back from raw bytes
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFrame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
}

/// Build a complete frame ready for the wire. The checksum width is
/// selected by the packet-kind bit in the header.
pub fn encode(header: FrameHeader, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(FrameError::Oversize(payload.len()));
    }
    let overhead = if header.job { JOB_OVERHEAD } else { CMD_OVERHEAD };
    let mut frame = Vec::with_capacity(2 + payload.len() + overhead);
    frame.extend_from_slice(&TX_PREAMBLE);
    frame.push(header.to_byte());
    frame.push((payload.len() + overhead) as u8);
    frame.extend_from_slice(payload);
    if header.job {
        let crc = crc::crc16(&frame[2..]);
        frame.extend_from_slice(&crc.to_be_bytes());
    } else {
        let crc = crc::crc5(&frame[2..]);
        frame.push(crc);
    }
    Ok(frame)
}

/// Parse and verify a full frame. Accepts both preamble directions so
/// locally encoded frames round-trip. Any error here means the bus is
/// desynchronized and the caller must flush its receive buffer.
pub fn decode(bytes: &[u8]) -> Result<ParsedFrame, FrameError> {
    if bytes.len() < 2 + CMD_OVERHEAD {
        return Err(FrameError::LengthMismatch(bytes.len(), 2 + CMD_OVERHEAD));
    }
    if bytes[0..2] != TX_PREAMBLE && bytes[0..2] != RX_PREAMBLE {
        return Err(FrameError::BadPreamble);
    }
    let header =
        FrameHeader::unpack(&[bytes[2]]).map_err(|_| FrameError::BadHeader(bytes[2]))?;
    if header.cmd == header.job {
        return Err(FrameError::BadHeader(bytes[2]));
    }
    let expected = bytes[3] as usize + 2;
    if bytes.len() != expected {
        return Err(FrameError::LengthMismatch(bytes.len(), expected));
    }
    let crc_len = if header.job { 2 } else { 1 };
    let checked = &bytes[2..bytes.len() - crc_len];
    if header.job {
        let crc = crc::crc16(checked);
        if crc.to_be_bytes() != bytes[bytes.len() - 2..] {
            return Err(FrameError::ChecksumMismatch);
        }
    } else {
        if crc::crc5(checked) != bytes[bytes.len() - 1] {
            return Err(FrameError::ChecksumMismatch);
        }
    }
    Ok(ParsedFrame {
        header,
        payload: bytes[4..bytes.len() - crc_len].to_vec(),
    })
}

/// Verify a fixed-size chip response and return its payload (the bytes
/// between the preamble and the CRC byte). Response CRC5 lives in the
/// low 5 bits of the last byte.
pub fn check_response(bytes: &[u8]) -> Result<&[u8], FrameError> {
    if bytes.len() < 4 {
        return Err(FrameError::LengthMismatch(bytes.len(), 4));
    }
    if bytes[0..2] != RX_PREAMBLE {
        return Err(FrameError::BadPreamble);
    }
    let data = &bytes[2..bytes.len() - 1];
    if crc::crc5(data) != bytes[bytes.len() - 1] & 0x1f {
        return Err(FrameError::ChecksumMismatch);
    }
    Ok(data)
}
