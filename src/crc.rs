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

//! Checksums used by the chip bus: CRC5 for command frames and
//! CRC-16/CCITT-FALSE for job frames.

/// 5-bit CRC as implemented by the chip's command engine. Init 0x1f,
/// polynomial 0x05, input bits processed MSB first, no reflection.
pub fn crc5(data: &[u8]) -> u8 {
    let mut crc = 0x1fu8;
    for byte in data {
        for i in 0..8 {
            let bit = (byte >> (7 - i)) & 1;
            let top = (crc >> 4) & 1;
            crc = (crc << 1) & 0x1f;
            if top != bit {
                crc ^= 0x05;
            }
        }
    }
    crc
}

/// CRC-16/CCITT-FALSE: polynomial 0x1021, init 0xffff, no reflection,
/// no final xor. The chip expects it big-endian after the job payload.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = 0xffffu16;
    for byte in data {
        crc ^= (*byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}
