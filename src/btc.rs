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

//! Bitcoin primitives: block header serialization, double SHA-256,
//! midstate computation and version rolling.

use bitcoin_hashes::{sha256, sha256d, Hash, HashEngine};
use byteorder::{ByteOrder, LittleEndian};

/// Bitcoin block header size in bytes
pub const BLOCK_HEADER_SIZE: usize = 80;
/// Size of the header chunk covered by a midstate
pub const MIDSTATE_INPUT_SIZE: usize = 64;
/// SHA-256 digest size in bytes
pub const SHA256_DIGEST_SIZE: usize = 32;

/// Version bits the BIP320 rolling convention allows a miner to use
pub const BIP320_VERSION_MASK: u32 = 0x1fffe000;
/// Bit position of the rolled chunk within the version word
pub const BIP320_VERSION_SHIFT: u32 = 13;

/// Difficulty 1 target as a float, used to express share difficulty
/// as `DIFF_ONE_TARGET / hash`.
const DIFF_ONE_TARGET: f64 = 2.695953529101131e67;

/// Bitcoin block header with fields in host byte order. Hash byte
/// arrays are kept in the internal (little-endian) hash order.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BlockHeader {
    pub version: u32,
    pub previous_hash: [u8; 32],
    pub merkle_root: [u8; 32],
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    /// Serialize to the 80-byte wire representation
    pub fn into_bytes(&self) -> [u8; BLOCK_HEADER_SIZE] {
        let mut bytes = [0u8; BLOCK_HEADER_SIZE];
        LittleEndian::write_u32(&mut bytes[0..4], self.version);
        bytes[4..36].copy_from_slice(&self.previous_hash);
        bytes[36..68].copy_from_slice(&self.merkle_root);
        LittleEndian::write_u32(&mut bytes[68..72], self.time);
        LittleEndian::write_u32(&mut bytes[72..76], self.bits);
        LittleEndian::write_u32(&mut bytes[76..80], self.nonce);
        bytes
    }

    /// Double SHA-256 of the serialized header
    pub fn hash(&self) -> sha256d::Hash {
        sha256d::Hash::hash(&self.into_bytes())
    }

    /// SHA-256 state after compressing the first 64 header bytes,
    /// in the canonical big-endian word order.
    pub fn midstate(&self) -> [u8; SHA256_DIGEST_SIZE] {
        let mut engine = sha256::Hash::engine();
        engine.input(&self.into_bytes()[..MIDSTATE_INPUT_SIZE]);
        engine.midstate().into_inner()
    }
}

/// Double SHA-256 over arbitrary bytes, result in internal hash order
pub fn sha256d(data: &[u8]) -> [u8; SHA256_DIGEST_SIZE] {
    sha256d::Hash::hash(data).into_inner()
}

/// Reverse each 32-bit word of a hash in place. Pool job fields come
/// word-swapped relative to the header serialization.
pub fn reverse_words(hash: &mut [u8]) {
    for chunk in hash.chunks_exact_mut(4) {
        chunk.reverse();
    }
}

/// Difficulty of a share with the given header hash, relative to
/// difficulty 1. The hash is interpreted as a 256-bit little-endian
/// integer, as everywhere in the header hashing domain.
pub fn share_difficulty(hash: &sha256d::Hash) -> f64 {
    DIFF_ONE_TARGET / le256_to_f64(hash.as_inner())
}

fn le256_to_f64(bytes: &[u8; 32]) -> f64 {
    let mut value = 0.0;
    for chunk in bytes.chunks_exact(8).rev() {
        value = value * 18_446_744_073_709_551_616.0 + LittleEndian::read_u64(chunk) as f64;
    }
    value
}

/// Advance `version` to the next value within `mask`: increment the
/// lowest group of mask bits and propagate carries upward through the
/// remaining groups. Bits outside the mask are preserved except where
/// a carry overflows past the top of a group, matching the rolling
/// scheme the chips implement in hardware.
///
/// The walk is iterative; each step moves the active mask strictly
/// upward, so it terminates within the word width for any mask.
pub fn roll_version(version: u32, mask: u32) -> u32 {
    let mut value = version;
    let mut mask = mask;
    while mask != 0 {
        let lowest_bit = mask & mask.wrapping_neg();
        let carry = (value & mask).wrapping_add(lowest_bit);
        let overflow = carry & !mask;
        value = (value & !mask) | (carry & mask);
        if overflow == 0 {
            break;
        }
        mask = overflow << 1;
    }
    value
}

#[cfg(test)]
mod test {
    use super::*;

    fn hash32(hex: &str) -> [u8; 32] {
        let mut out = [0u8; 32];
        out.copy_from_slice(&hex::decode(hex).unwrap());
        out
    }

    #[test]
    fn test_header_serialization() {
        let header = BlockHeader {
            version: 0x20000004,
            previous_hash: [0x11; 32],
            merkle_root: [0x22; 32],
            time: 0x646ff1a9,
            bits: 0x1705ae3a,
            nonce: 0x276e8947,
        };
        let bytes = header.into_bytes();
        assert_eq!(&bytes[0..4], &[0x04, 0x00, 0x00, 0x20]);
        assert_eq!(&bytes[68..72], &[0xa9, 0xf1, 0x6f, 0x64]);
        assert_eq!(&bytes[76..80], &[0x47, 0x89, 0x6e, 0x27]);
    }

    #[test]
    fn test_known_share_difficulty() {
        // testnet-grade share observed on a BM1366 devkit
        let mut prev = hash32("d02b10fc0d4711eae1a805af50a8a83312a2215e00017f2b0000000000000000");
        reverse_words(&mut prev);
        let header = BlockHeader {
            version: 0x20000004,
            previous_hash: prev,
            merkle_root: hash32("c459036d054643519c5a2ac50b3474e0632c7ce4f93107843fdbf1edd9cdb126"),
            time: 0x646ff1a9,
            bits: 0x1705ae3a,
            nonce: 0x276e8947,
        };
        let difficulty = share_difficulty(&header.hash());
        assert_eq!(difficulty as u32, 18);
    }

    #[test]
    fn test_midstate_known_vector() {
        let mut prev = hash32("bf44fd3513dc7b837d60e5c628b572b448d204a8000007490000000000000000");
        reverse_words(&mut prev);
        let header = BlockHeader {
            version: 0x20000004,
            previous_hash: prev,
            merkle_root: hash32("cd1be82132ef0d12053dcece1fa0247fcfdb61d4dbd3eb32ea9ef9b4c604a846"),
            ..Default::default()
        };
        let mut expected =
            hash32("91dfea528a9f73683d0d495dd6dd7415e1ca21cb411759e3e05d7d5ff285314d");
        // the vector is a raw little-endian state dump
        reverse_words(&mut expected);
        assert_eq!(header.midstate(), expected);
    }

    #[test]
    fn test_roll_version_contiguous_mask() {
        let mut version = 0x20000000;
        for i in 1..=16u32 {
            version = roll_version(version, BIP320_VERSION_MASK);
            assert_eq!(version, 0x20000000 | (i << BIP320_VERSION_SHIFT));
        }
    }

    #[test]
    fn test_roll_version_split_mask() {
        // two disjoint single-bit groups: 0b101 at bits 4 and 6
        let mask = 0x50;
        let mut value = 0;
        let expected = [0x10, 0x40, 0x50, 0x00];
        for want in expected {
            value = roll_version(value, mask);
            assert_eq!(value & mask, want);
        }
    }

    #[test]
    fn test_roll_version_zero_mask() {
        assert_eq!(roll_version(0x20000000, 0), 0x20000000);
    }

    #[test]
    fn test_roll_version_full_mask_terminates() {
        // wraps to zero on a saturated full-word mask
        assert_eq!(roll_version(u32::MAX, u32::MAX), 0);
    }
}
