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

//! Mining jobs and the in-flight job table.

use crate::btc;

/// Number of job-id slots the chips can distinguish
pub const JOB_TABLE_SIZE: usize = 128;

/// One unit of work ready for a chip, with everything needed to
/// validate and submit whatever nonce comes back for it.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    /// Pool's opaque job identifier, echoed back on submit
    pub pool_job_id: String,
    /// Locally chosen extranonce2 this job's coinbase was built with
    pub extranonce2: String,
    /// Base block version from the notify
    pub version: u32,
    /// Negotiated rolling mask, zero when rolling is off
    pub version_mask: u32,
    /// Previous block hash in header order (notify words swapped)
    pub prev_hash: [u8; 32],
    /// Previous block hash byte-reversed, as some families want it on
    /// the wire
    pub prev_hash_be: [u8; 32],
    /// Merkle root in header order
    pub merkle_root: [u8; 32],
    /// Merkle root with word order reversed, wire form
    pub merkle_root_be: [u8; 32],
    pub ntime: u32,
    pub nbits: u32,
    pub starting_nonce: u32,
    /// Share acceptance threshold at construction time
    pub pool_difficulty: u32,
    /// One midstate, or four when version rolling is active, in the
    /// canonical big-endian word order
    pub midstates: Vec<[u8; 32]>,
    /// Pipeline generation this job belongs to; bumped on work abandon
    pub generation: u64,
}

impl Job {
    /// Header this job resolves to for a candidate result
    pub fn header(&self, nonce: u32, rolled_version: u32) -> btc::BlockHeader {
        btc::BlockHeader {
            version: rolled_version,
            previous_hash: self.prev_hash,
            merkle_root: self.merkle_root,
            time: self.ntime,
            bits: self.nbits,
            nonce,
        }
    }
}

/// Candidate nonce decoded from a chip response. The version is the
/// full 32-bit rolled value, reconstructed from the wire bits and the
/// job's base version.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NonceResult {
    pub job_id: u8,
    pub nonce: u32,
    pub version: u32,
}

/// Fixed arena of in-flight jobs keyed by chip job id. A chip result
/// for an id is only meaningful while the slot is valid; ids are
/// reused cyclically, so installing a job hands back any previous
/// occupant for the caller to drop.
pub struct JobTable {
    slots: Vec<Option<Job>>,
    valid: [bool; JOB_TABLE_SIZE],
}

impl JobTable {
    pub fn new() -> Self {
        Self {
            slots: (0..JOB_TABLE_SIZE).map(|_| None).collect(),
            valid: [false; JOB_TABLE_SIZE],
        }
    }

    /// Install a job and mark its slot valid, returning the evicted
    /// occupant. The job is stored before the valid flag flips so a
    /// concurrent reader never sees a valid slot without its job.
    pub fn insert(&mut self, id: u8, job: Job) -> Option<Job> {
        let idx = id as usize % JOB_TABLE_SIZE;
        let evicted = self.slots[idx].replace(job);
        self.valid[idx] = true;
        evicted
    }

    /// Job currently live under `id`, if the slot is valid
    pub fn get(&self, id: u8) -> Option<&Job> {
        let idx = id as usize % JOB_TABLE_SIZE;
        if self.valid[idx] {
            self.slots[idx].as_ref()
        } else {
            None
        }
    }

    /// Mass invalidation on work abandon. Occupants stay allocated
    /// until their slots are reused, but no result can match them.
    pub fn invalidate_all(&mut self) {
        self.valid = [false; JOB_TABLE_SIZE];
    }

    pub fn valid_count(&self) -> usize {
        self.valid.iter().filter(|v| **v).count()
    }
}


#[cfg(test)]
mod test {
    use super::test_utils::sample_job;
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let mut table = JobTable::new();
        assert!(table.get(12).is_none());
        assert!(table.insert(12, sample_job("a")).is_none());
        assert_eq!(table.get(12).unwrap().pool_job_id, "a");
        assert_eq!(table.valid_count(), 1);
    }

    #[test]
    fn test_insert_evicts_previous_occupant() {
        let mut table = JobTable::new();
        table.insert(8, sample_job("old"));
        let evicted = table.insert(8, sample_job("new")).expect("nothing evicted");
        assert_eq!(evicted.pool_job_id, "old");
        assert_eq!(table.get(8).unwrap().pool_job_id, "new");
        assert_eq!(table.valid_count(), 1);
    }

    #[test]
    fn test_invalidate_all() {
        let mut table = JobTable::new();
        for id in [0u8, 24, 48, 72, 96, 120] {
            table.insert(id, sample_job("x"));
        }
        assert_eq!(table.valid_count(), 6);
        table.invalidate_all();
        assert_eq!(table.valid_count(), 0);
        assert!(table.get(24).is_none());
        // a fresh install revalidates just that slot
        table.insert(24, sample_job("y"));
        assert_eq!(table.valid_count(), 1);
        assert_eq!(table.get(24).unwrap().pool_job_id, "y");
    }

    #[test]
    fn test_job_id_stride_bijection() {
        // no two concurrently valid slots may share an id before the
        // id space wraps, for every family stride
        for stride in [4usize, 8, 24] {
            let mut table = JobTable::new();
            let mut id = 0usize;
            for issued in 0..(JOB_TABLE_SIZE / stride) {
                assert!(
                    table.insert(id as u8, sample_job("j")).is_none(),
                    "stride {} collided after {} jobs",
                    stride,
                    issued
                );
                id = (id + stride) % JOB_TABLE_SIZE;
            }
        }
    }
}
