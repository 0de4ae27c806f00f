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

//! BM1368 driver. Version-rolling chip with a wider internal job id
//! space than the BM1366: ids step by 24 and the chip reports the
//! table slot in the high nibble of the result id.

use super::pll;
use super::{FAST_UART_REG, VERSIONED_RESPONSE_SIZE};
use crate::btc;
use crate::error::{self, ErrorKind};
use crate::io::Uart;
use crate::job::{Job, JobTable, NonceResult, JOB_TABLE_SIZE};
use crate::{info, warn};

use async_trait::async_trait;

use std::time::Duration;

pub const BIG_CORES: usize = 80;
pub const SMALL_CORES: usize = 1276;

const JOB_ID_STRIDE: u8 = 24;

const MAX_BAUD: u32 = 1_000_000;

const JOB_INTERVAL: Duration = Duration::from_millis(500);

/// Feedback divider range accepted by this chip's PLL
const FBDIV_RANGE: (u16, u16) = (144, 235);

/// Settle time between ramp steps and after per-chip register setup
const RAMP_STEP_DELAY: Duration = Duration::from_millis(100);
const CHIP_SETUP_DELAY: Duration = Duration::from_millis(500);

/// Registers touched once during init, broadcast to the whole chain
const INIT_CMDS: [[u8; 6]; 7] = [
    [0x00, 0xa8, 0x00, 0x07, 0x00, 0x00],
    [0x00, 0x18, 0xff, 0x0f, 0xc1, 0x00],
    [0x00, 0x3c, 0x80, 0x00, 0x8b, 0x00],
    [0x00, 0x3c, 0x80, 0x00, 0x80, 0x18],
    [0x00, 0x14, 0x00, 0x00, 0x00, 0xff],
    [0x00, 0x54, 0x00, 0x00, 0x00, 0x03],
    [0x00, 0x58, 0x02, 0x11, 0x11, 0x11],
];

pub struct Bm1368 {
    uart: Box<dyn Uart>,
    chips: usize,
    address_interval: usize,
    job_id: u8,
    frequency: f64,
}

impl Bm1368 {
    pub fn new(uart: Box<dyn Uart>) -> Self {
        Self {
            uart,
            chips: 0,
            address_interval: 256,
            job_id: 0,
            frequency: pll::POST_RESET_MHZ,
        }
    }

    async fn send_hash_frequency(&mut self, mhz: f64) -> error::Result<()> {
        let solution = pll::solve(mhz, FBDIV_RANGE).ok_or_else(|| {
            ErrorKind::PLL(format!("no divider setting for {:.2} MHz", mhz))
        })?;
        super::write_all(&mut *self.uart, solution.payload()).await?;
        self.frequency = mhz;
        Ok(())
    }

    async fn ramp_to(&mut self, target: f64) -> error::Result<()> {
        info!(
            "BM1368: ramping from {:.2} MHz to {:.2} MHz",
            self.frequency, target
        );
        for step in pll::ramp_steps(self.frequency, target) {
            self.send_hash_frequency(step).await?;
            tokio::time::sleep(RAMP_STEP_DELAY).await;
        }
        Ok(())
    }
}

#[async_trait]
impl super::ChipDriver for Bm1368 {
    async fn init(
        &mut self,
        frequency: f64,
        expected_chips: usize,
        probe_timeout: Duration,
    ) -> error::Result<usize> {
        for _ in 0..4 {
            self.set_version_mask(btc::BIP320_VERSION_MASK).await?;
        }

        let chips =
            super::probe_chips(&mut *self.uart, VERSIONED_RESPONSE_SIZE, probe_timeout).await?;
        info!("BM1368: {} chip(s) detected, {} expected", chips, expected_chips);
        if chips != expected_chips {
            return Err(ErrorKind::Hashchip(format!(
                "detected {} chips, expected {}",
                chips, expected_chips
            ))
            .into());
        }
        self.chips = chips;
        self.address_interval = super::address_interval(chips);

        super::chain_inactive(&mut *self.uart).await?;
        for cmd in INIT_CMDS.iter() {
            super::write_all(&mut *self.uart, *cmd).await?;
        }

        for i in 0..chips {
            super::set_chip_address(&mut *self.uart, (i * self.address_interval) as u8).await?;
        }

        for i in 0..chips {
            let chip = (i * self.address_interval) as u8;
            super::write_one(&mut *self.uart, [chip, 0xa8, 0x00, 0x07, 0x01, 0xf0]).await?;
            super::write_one(&mut *self.uart, [chip, 0x18, 0xf0, 0x00, 0xc1, 0x00]).await?;
            super::write_one(&mut *self.uart, [chip, 0x3c, 0x80, 0x00, 0x8b, 0x00]).await?;
            super::write_one(&mut *self.uart, [chip, 0x3c, 0x80, 0x00, 0x80, 0x18]).await?;
            super::write_one(&mut *self.uart, [chip, 0x3c, 0x80, 0x00, 0x82, 0xaa]).await?;
            tokio::time::sleep(CHIP_SETUP_DELAY).await;
        }

        self.set_difficulty_mask(self.default_difficulty()).await?;

        self.ramp_to(frequency).await?;

        super::write_all(&mut *self.uart, [0x00, 0x10, 0x00, 0x00, 0x15, 0xa4]).await?;
        self.set_version_mask(btc::BIP320_VERSION_MASK).await?;

        Ok(chips)
    }

    fn chip_count(&self) -> usize {
        self.chips
    }

    fn small_core_count(&self) -> usize {
        SMALL_CORES
    }

    fn job_interval(&self) -> Duration {
        JOB_INTERVAL
    }

    fn default_difficulty(&self) -> usize {
        256
    }

    async fn set_max_baud(&mut self) -> error::Result<u32> {
        super::write_all(&mut *self.uart, [0x00, FAST_UART_REG, 0x11, 0x30, 0x02, 0x00])
            .await?;
        self.uart.set_baud(MAX_BAUD)?;
        Ok(MAX_BAUD)
    }

    async fn set_difficulty_mask(&mut self, difficulty: usize) -> error::Result<()> {
        super::write_all(&mut *self.uart, super::ticket_mask_payload(difficulty)).await
    }

    async fn set_version_mask(&mut self, mask: u32) -> error::Result<()> {
        super::write_all(&mut *self.uart, super::version_mask_payload(mask)).await
    }

    async fn send_work(&mut self, table: &mut JobTable, job: Job) -> error::Result<u8> {
        self.job_id = (self.job_id + JOB_ID_STRIDE) % JOB_TABLE_SIZE as u8;
        let id = self.job_id;

        let payload = super::bm1366::versioned_job_payload(id, &job);
        table.insert(id, job);
        super::send_job(&mut *self.uart, &payload).await?;
        Ok(id)
    }

    async fn process_work(
        &mut self,
        table: &JobTable,
        timeout: Duration,
    ) -> error::Result<Option<NonceResult>> {
        let response = match super::receive_response(
            &mut *self.uart,
            VERSIONED_RESPONSE_SIZE,
            timeout,
        )
        .await?
        {
            Some(response) => response,
            None => return Ok(None),
        };

        // high nibble selects the table slot, low nibble is the small core
        let rx_id = (response.job_id & 0xf0) >> 1;
        let job = match table.get(rx_id) {
            Some(job) => job,
            None => {
                warn!("BM1368: nonce for stale job id {:#04x}", rx_id);
                return Ok(None);
            }
        };

        let wire_version = response
            .version
            .ok_or_else(|| ErrorKind::Hashchip("response without version field".to_string()))?;

        Ok(Some(NonceResult {
            job_id: rx_id,
            nonce: response.nonce,
            version: super::rolled_version(job.version, wire_version),
        }))
    }

    async fn set_frequency(&mut self, mhz: f64) -> error::Result<()> {
        self.ramp_to(mhz).await
    }
}
