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

//! BM1397 driver. The oldest supported chip: no chip-side version
//! rolling, so the host precomputes up to 4 midstates per job and the
//! chip reports which one a nonce belongs to in the low job-id bits.

use super::pll;
use super::{BARE_RESPONSE_SIZE, CORE_REGISTER_CONTROL_REG, FAST_UART_REG, MISC_CONTROL_REG};
use crate::btc;
use crate::error::{self, ErrorKind};
use crate::io::Uart;
use crate::job::{Job, JobTable, NonceResult, JOB_TABLE_SIZE};
use crate::{info, warn};

use async_trait::async_trait;
use tokio::time;

use std::time::Duration;

pub const BIG_CORES: usize = 168;
pub const SMALL_CORES: usize = 672;

/// Job ids move in steps of 4 so the two low bits stay free for the
/// midstate index in responses
const JOB_ID_STRIDE: u8 = 4;

/// Registers specific to this chip
const CLOCK_ORDER_CONTROL_0_REG: u8 = 0x80;
const CLOCK_ORDER_CONTROL_1_REG: u8 = 0x84;
const ORDERED_CLOCK_ENABLE_REG: u8 = 0x20;
const PLL3_PARAMETER_REG: u8 = 0x68;

const MAX_BAUD: u32 = 3_125_000;

/// Fraction of a chip's nonce slice swept before fresh work goes out
const JOB_TIMEOUT_PERCENT: f64 = 0.9;
const JOB_INTERVAL_MIN_MS: f64 = 500.0;
const JOB_INTERVAL_MAX_MS: f64 = 10_000.0;

const REGISTER_WRITE_DELAY: Duration = Duration::from_millis(10);

pub struct Bm1397 {
    uart: Box<dyn Uart>,
    chips: usize,
    address_interval: usize,
    job_id: u8,
    frequency: f64,
    /// Last nonce returned; the chip occasionally repeats itself
    prev_nonce: u32,
}

impl Bm1397 {
    pub fn new(uart: Box<dyn Uart>) -> Self {
        Self {
            uart,
            chips: 0,
            address_interval: 256,
            job_id: 0,
            frequency: pll::POST_RESET_MHZ,
            prev_nonce: 0,
        }
    }

    /// The divider registers take effect in pairs; the pre-divider
    /// frame opens the PLL for reprogramming
    async fn send_hash_frequency(&mut self, mhz: f64) -> error::Result<()> {
        let prefreq = [0x00, 0x70, 0x0f, 0x0f, 0x0f, 0x00];
        let (payload, achieved) = pll::solve_bm1397(mhz);

        for _ in 0..2 {
            time::sleep(REGISTER_WRITE_DELAY).await;
            super::write_all(&mut *self.uart, prefreq).await?;
        }
        for _ in 0..2 {
            time::sleep(REGISTER_WRITE_DELAY).await;
            super::write_all(&mut *self.uart, payload).await?;
        }
        time::sleep(REGISTER_WRITE_DELAY).await;

        info!("BM1397: frequency set to {:.2} MHz ({:.2} requested)", achieved, mhz);
        self.frequency = achieved;
        Ok(())
    }
}

#[async_trait]
impl super::ChipDriver for Bm1397 {
    async fn init(
        &mut self,
        frequency: f64,
        expected_chips: usize,
        probe_timeout: Duration,
    ) -> error::Result<usize> {
        let chips =
            super::probe_chips(&mut *self.uart, BARE_RESPONSE_SIZE, probe_timeout).await?;
        info!("BM1397: {} chip(s) detected, {} expected", chips, expected_chips);
        if chips != expected_chips {
            return Err(ErrorKind::Hashchip(format!(
                "detected {} chips, expected {}",
                chips, expected_chips
            ))
            .into());
        }
        self.chips = chips;
        self.address_interval = super::address_interval(chips);

        time::sleep(REGISTER_WRITE_DELAY).await;
        super::chain_inactive(&mut *self.uart).await?;
        for i in 0..chips {
            super::set_chip_address(&mut *self.uart, (i * self.address_interval) as u8).await?;
        }

        super::write_all(
            &mut *self.uart,
            [0x00, CLOCK_ORDER_CONTROL_0_REG, 0x00, 0x00, 0x00, 0x00],
        )
        .await?;
        super::write_all(
            &mut *self.uart,
            [0x00, CLOCK_ORDER_CONTROL_1_REG, 0x00, 0x00, 0x00, 0x00],
        )
        .await?;
        super::write_all(
            &mut *self.uart,
            [0x00, ORDERED_CLOCK_ENABLE_REG, 0x00, 0x00, 0x00, 0x01],
        )
        .await?;
        super::write_all(
            &mut *self.uart,
            [0x00, CORE_REGISTER_CONTROL_REG, 0x80, 0x00, 0x80, 0x74],
        )
        .await?;

        self.set_difficulty_mask(self.default_difficulty()).await?;

        super::write_all(
            &mut *self.uart,
            [0x00, PLL3_PARAMETER_REG, 0xc0, 0x70, 0x01, 0x11],
        )
        .await?;
        super::write_all(&mut *self.uart, [0x00, FAST_UART_REG, 0x06, 0x00, 0x00, 0x0f])
            .await?;
        // default baud divider of 26 for 115,749
        super::write_all(
            &mut *self.uart,
            [0x00, MISC_CONTROL_REG, 0x00, 0x00, 0b0111_1010, 0b0011_0001],
        )
        .await?;

        self.send_hash_frequency(frequency).await?;
        Ok(chips)
    }

    fn chip_count(&self) -> usize {
        self.chips
    }

    fn small_core_count(&self) -> usize {
        SMALL_CORES
    }

    fn job_interval(&self) -> Duration {
        // time for one chip to sweep its slice of the nonce space
        let slice = (u32::MAX as f64 / 256.0) * self.address_interval as f64;
        let ms = slice / (self.frequency * 1e6) * 1000.0 * JOB_TIMEOUT_PERCENT;
        Duration::from_millis(ms.max(JOB_INTERVAL_MIN_MS).min(JOB_INTERVAL_MAX_MS) as u64)
    }

    fn default_difficulty(&self) -> usize {
        256
    }

    async fn set_max_baud(&mut self) -> error::Result<u32> {
        // baud divider of 0 for 3,125,000
        super::write_all(
            &mut *self.uart,
            [0x00, MISC_CONTROL_REG, 0x00, 0x00, 0b0110_0000, 0b0011_0001],
        )
        .await?;
        self.uart.set_baud(MAX_BAUD)?;
        Ok(MAX_BAUD)
    }

    async fn set_difficulty_mask(&mut self, difficulty: usize) -> error::Result<()> {
        super::write_all(&mut *self.uart, super::ticket_mask_payload(difficulty)).await
    }

    async fn set_version_mask(&mut self, _mask: u32) -> error::Result<()> {
        // version rolling happens host-side across the 4 midstates
        Ok(())
    }

    async fn send_work(&mut self, table: &mut JobTable, job: Job) -> error::Result<u8> {
        self.job_id = (self.job_id + JOB_ID_STRIDE) % JOB_TABLE_SIZE as u8;
        let id = self.job_id;

        let mut payload = Vec::with_capacity(14 + 32 * job.midstates.len());
        payload.push(id);
        payload.push(job.midstates.len() as u8);
        payload.extend_from_slice(&job.starting_nonce.to_le_bytes());
        payload.extend_from_slice(&job.nbits.to_le_bytes());
        payload.extend_from_slice(&job.ntime.to_le_bytes());
        payload.extend_from_slice(&job.merkle_root[28..32]);
        for midstate in &job.midstates {
            let mut wire = *midstate;
            btc::reverse_words(&mut wire);
            payload.extend_from_slice(&wire);
        }

        table.insert(id, job);
        super::send_job(&mut *self.uart, &payload).await?;
        Ok(id)
    }

    async fn process_work(
        &mut self,
        table: &JobTable,
        timeout: Duration,
    ) -> error::Result<Option<NonceResult>> {
        let response =
            match super::receive_response(&mut *self.uart, BARE_RESPONSE_SIZE, timeout).await? {
                Some(response) => response,
                None => return Ok(None),
            };

        let rx_id = response.job_id & 0xfc;
        let midstate_idx = response.job_id & 0x03;

        let job = match table.get(rx_id) {
            Some(job) => job,
            None => {
                warn!("BM1397: nonce for stale job id {:#04x}", rx_id);
                return Ok(None);
            }
        };

        if response.nonce == self.prev_nonce {
            return Ok(None);
        }
        self.prev_nonce = response.nonce;

        let mut rolled = job.version;
        for _ in 0..midstate_idx {
            rolled = btc::roll_version(rolled, job.version_mask);
        }

        Ok(Some(NonceResult {
            job_id: rx_id,
            nonce: response.nonce,
            version: rolled,
        }))
    }

    async fn set_frequency(&mut self, _mhz: f64) -> error::Result<()> {
        Err(ErrorKind::Unsupported(
            "BM1397 does not support retuning after init".to_string(),
        )
        .into())
    }
}
