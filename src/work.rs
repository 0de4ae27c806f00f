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

//! Job builder: expands a pool job template and an extranonce pair
//! into a chip-ready `Job` with coinbase, Merkle root and midstates.

use crate::btc;
use crate::error::{self, ErrorKind};
use crate::job::Job;

/// Longest Merkle branch list a template may carry
pub const MAX_MERKLE_BRANCHES: usize = 32;

/// Midstates per job when version rolling is negotiated
pub const ROLLED_MIDSTATES: usize = 4;

/// Everything `mining.notify` tells us about one job
#[derive(Debug, Clone, PartialEq)]
pub struct JobTemplate {
    pub job_id: String,
    pub prev_hash: String,
    pub coinbase1: String,
    pub coinbase2: String,
    pub merkle_branches: Vec<String>,
    pub version: u32,
    pub nbits: u32,
    pub ntime: u32,
    pub clean_jobs: bool,
}

/// Render an extranonce2 counter value as the fixed-width hex string
/// the coinbase embeds: little-endian bytes, `size` bytes wide.
pub fn extranonce2_hex(value: u64, size: usize) -> String {
    let bytes = value.to_le_bytes();
    let mut out = String::with_capacity(size * 2);
    for i in 0..size {
        let byte = bytes.get(i).copied().unwrap_or(0);
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

fn hash_from_hex(hex_str: &str) -> error::Result<[u8; 32]> {
    let bytes = hex::decode(hex_str)?;
    if bytes.len() != 32 {
        Err(ErrorKind::Job(format!(
            "hash field has {} bytes, expected 32",
            bytes.len()
        )))?;
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Assemble the raw coinbase transaction from the pool-provided parts
/// and the extranonce pair. All four inputs are hex strings; malformed
/// hex fails the build.
pub fn build_coinbase(
    coinbase1: &str,
    coinbase2: &str,
    extranonce1: &str,
    extranonce2: &str,
) -> error::Result<Vec<u8>> {
    let mut tx = hex::decode(coinbase1)?;
    tx.extend(hex::decode(extranonce1)?);
    tx.extend(hex::decode(extranonce2)?);
    tx.extend(hex::decode(coinbase2)?);
    Ok(tx)
}

/// Merkle root of the coinbase combined with the pool-supplied branch
/// hashes, in the order the pool listed them.
pub fn calculate_merkle_root(
    coinbase: &[u8],
    merkle_branches: &[String],
) -> error::Result<[u8; 32]> {
    if merkle_branches.len() > MAX_MERKLE_BRANCHES {
        Err(ErrorKind::Job(format!(
            "{} merkle branches exceed the limit of {}",
            merkle_branches.len(),
            MAX_MERKLE_BRANCHES
        )))?;
    }
    let mut root = btc::sha256d(coinbase);
    let mut buf = [0u8; 64];
    for branch in merkle_branches {
        buf[..32].copy_from_slice(&root);
        buf[32..].copy_from_slice(&hash_from_hex(branch)?);
        root = btc::sha256d(&buf);
    }
    Ok(root)
}

/// Build a complete job from a template. `extranonce2_value` is the
/// caller's counter; one value, one unique coinbase.
pub fn build(
    template: &JobTemplate,
    extranonce1: &str,
    extranonce2_value: u64,
    extranonce2_size: usize,
    version_mask: u32,
    pool_difficulty: u32,
    generation: u64,
) -> error::Result<Job> {
    let extranonce2 = extranonce2_hex(extranonce2_value, extranonce2_size);
    let coinbase = build_coinbase(
        &template.coinbase1,
        &template.coinbase2,
        extranonce1,
        &extranonce2,
    )?;
    let merkle_root = calculate_merkle_root(&coinbase, &template.merkle_branches)?;
    from_merkle_root(
        template,
        merkle_root,
        extranonce2,
        version_mask,
        pool_difficulty,
        generation,
    )
}

/// Finish job construction once the Merkle root is known. Split out so
/// a known root can be injected directly.
pub fn from_merkle_root(
    template: &JobTemplate,
    merkle_root: [u8; 32],
    extranonce2: String,
    version_mask: u32,
    pool_difficulty: u32,
    generation: u64,
) -> error::Result<Job> {
    let prev_raw = hash_from_hex(&template.prev_hash)?;

    let mut prev_hash = prev_raw;
    btc::reverse_words(&mut prev_hash);

    let mut prev_hash_be = prev_raw;
    prev_hash_be.reverse();

    // wire form keeps the words, reverses their order
    let mut merkle_root_be = [0u8; 32];
    for (dst, src) in merkle_root_be
        .chunks_exact_mut(4)
        .zip(merkle_root.chunks_exact(4).rev())
    {
        dst.copy_from_slice(src);
    }

    let midstate_count = if version_mask != 0 { ROLLED_MIDSTATES } else { 1 };
    let mut midstates = Vec::with_capacity(midstate_count);
    let mut version = template.version;
    for i in 0..midstate_count {
        if i > 0 {
            version = btc::roll_version(version, version_mask);
        }
        let header = btc::BlockHeader {
            version,
            previous_hash: prev_hash,
            merkle_root,
            ..Default::default()
        };
        midstates.push(header.midstate());
    }

    Ok(Job {
        pool_job_id: template.job_id.clone(),
        extranonce2,
        version: template.version,
        version_mask,
        prev_hash,
        prev_hash_be,
        merkle_root,
        merkle_root_be,
        ntime: template.ntime,
        nbits: template.nbits,
        starting_nonce: 0,
        pool_difficulty,
        midstates,
        generation,
    })
}

/// Difficulty achieved by a candidate nonce for `job`
pub fn nonce_difficulty(job: &Job, nonce: u32, rolled_version: u32) -> f64 {
    btc::share_difficulty(&job.header(nonce, rolled_version).hash())
}
