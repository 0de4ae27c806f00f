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

//! BM1370 driver. Electrically and protocol-wise a close sibling of the
//! BM1368 with twice the small cores, a shifted PLL feedback range and
//! a different nonce range register preset.

use super::pll;
use super::{FAST_UART_REG, VERSIONED_RESPONSE_SIZE};
use crate::btc;
use crate::error::{self, ErrorKind};
use crate::io::Uart;
use crate::job::{Job, JobTable, NonceResult, JOB_TABLE_SIZE};
use crate::{info, warn};

use async_trait::async_trait;

use std::time::Duration;

pub const BIG_CORES: usize = 128;
pub const SMALL_CORES: usize = 2040;

const JOB_ID_STRIDE: u8 = 24;

const MAX_BAUD: u32 = 1_000_000;

const JOB_INTERVAL: Duration = Duration::from_millis(500);

const FBDIV_RANGE: (u16, u16) = (160, 239);

const RAMP_STEP_DELAY: Duration = Duration::from_millis(100);

pub struct Bm1370 {
    uart: Box<dyn Uart>,
    chips: usize,
    address_interval: usize,
    job_id: u8,
    frequency: f64,
}

impl Bm1370 {
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
            "BM1370: ramping from {:.2} MHz to {:.2} MHz",
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
impl super::ChipDriver for Bm1370 {
    async fn init(
        &mut self,
        frequency: f64,
        expected_chips: usize,
        probe_timeout: Duration,
    ) -> error::Result<usize> {
        for _ in 0..3 {
            self.set_version_mask(btc::BIP320_VERSION_MASK).await?;
        }

        let chips =
            super::probe_chips(&mut *self.uart, VERSIONED_RESPONSE_SIZE, probe_timeout).await?;
        info!("BM1370: {} chip(s) detected, {} expected", chips, expected_chips);
        if chips != expected_chips {
            return Err(ErrorKind::Hashchip(format!(
                "detected {} chips, expected {}",
                chips, expected_chips
            ))
            .into());
        }
        self.chips = chips;
        self.address_interval = super::address_interval(chips);

        self.set_version_mask(btc::BIP320_VERSION_MASK).await?;

        super::write_all(&mut *self.uart, [0x00, 0xa8, 0x00, 0x07, 0x00, 0x00]).await?;
        super::write_all(&mut *self.uart, [0x00, 0x18, 0xff, 0x0f, 0xc1, 0x00]).await?;

        super::chain_inactive(&mut *self.uart).await?;
        for i in 0..chips {
            super::set_chip_address(&mut *self.uart, (i * self.address_interval) as u8).await?;
        }

        super::write_all(&mut *self.uart, [0x00, 0x3c, 0x80, 0x00, 0x8b, 0x00]).await?;
        super::write_all(&mut *self.uart, [0x00, 0x3c, 0x80, 0x00, 0x80, 0x18]).await?;
        self.set_difficulty_mask(self.default_difficulty()).await?;
        super::write_all(&mut *self.uart, [0x00, 0x54, 0x00, 0x00, 0x00, 0x03]).await?;
        super::write_all(&mut *self.uart, [0x00, 0x58, 0x02, 0x11, 0x11, 0x11]).await?;

        for i in 0..chips {
            let chip = (i * self.address_interval) as u8;
            super::write_one(&mut *self.uart, [chip, 0xa8, 0x00, 0x07, 0x01, 0xf0]).await?;
            super::write_one(&mut *self.uart, [chip, 0x18, 0xf0, 0x00, 0xc1, 0x00]).await?;
            super::write_one(&mut *self.uart, [chip, 0x3c, 0x80, 0x00, 0x8b, 0x00]).await?;
            super::write_one(&mut *self.uart, [chip, 0x3c, 0x80, 0x00, 0x80, 0x18]).await?;
            super::write_one(&mut *self.uart, [chip, 0x3c, 0x80, 0x00, 0x82, 0xaa]).await?;
        }

        self.ramp_to(frequency).await?;

        super::write_all(&mut *self.uart, [0x00, 0x10, 0x00, 0x00, 0x1e, 0xb5]).await?;

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

        let rx_id = (response.job_id & 0xf0) >> 1;
        let job = match table.get(rx_id) {
            Some(job) => job,
            None => {
                warn!("BM1370: nonce for stale job id {:#04x}", rx_id);
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

#[cfg(test)]
mod test {
    use super::super::ChipDriver;
    use super::*;
    use crate::io::test_utils::MockUart;
    use crate::job::test_utils::sample_job;

    fn probe_reply() -> Vec<u8> {
        let mut bytes = vec![0xaa, 0x55, 0x13, 0x70, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        let crc = crate::crc::crc5(&bytes[2..10]);
        bytes[10] = crc;
        bytes
    }

    #[tokio::test(start_paused = true)]
    async fn init_reproduces_captured_frames() {
        let uart = MockUart::new();
        uart.queue_rx(&probe_reply());

        let mut driver = Bm1370::new(Box::new(uart.clone()));
        let chips = driver
            .init(525.0, 1, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(chips, 1);

        let sent = uart.sent();
        let vmask = vec![
            0x55, 0xaa, 0x51, 0x09, 0x00, 0xa4, 0x90, 0x00, 0xff, 0xff, 0x1c,
        ];
        assert_eq!(sent[0], vmask);
        assert_eq!(sent[2], vmask);
        // chip count probe, then one more version mask write
        assert_eq!(sent[3], vec![0x55, 0xaa, 0x52, 0x05, 0x00, 0x00, 0x0a]);
        assert_eq!(sent[4], vmask);
        assert_eq!(
            sent[5],
            vec![0x55, 0xaa, 0x51, 0x09, 0x00, 0xa8, 0x00, 0x07, 0x00, 0x00, 0x03]
        );
        // chain inactive and the single chip address
        assert_eq!(sent[7], vec![0x55, 0xaa, 0x53, 0x05, 0x00, 0x00, 0x03]);
        assert_eq!(sent[8], vec![0x55, 0xaa, 0x40, 0x05, 0x00, 0x00, 0x1c]);
        assert_eq!(
            sent[9],
            vec![0x55, 0xaa, 0x51, 0x09, 0x00, 0x3c, 0x80, 0x00, 0x8b, 0x00, 0x12]
        );
        assert_eq!(
            sent[11],
            vec![0x55, 0xaa, 0x51, 0x09, 0x00, 0x14, 0x00, 0x00, 0x00, 0xff, 0x08]
        );

        // broadcast block, per-chip setup, ramp, nonce range preset;
        // 525 lands exactly on a 6.25 MHz step so no trailing fine step
        let ramp_frames = ((525.0 - 56.25) / 6.25) as usize;
        assert_eq!(sent.len(), 14 + 5 + ramp_frames + 1);
        assert_eq!(
            *sent.last().unwrap(),
            vec![0x55, 0xaa, 0x51, 0x09, 0x00, 0x10, 0x00, 0x00, 0x1e, 0xb5, 0x0f]
        );
    }

    #[tokio::test]
    async fn result_id_maps_high_nibble_to_slot() {
        let uart = MockUart::new();
        let mut response = vec![0xaa, 0x55, 0x47, 0x89, 0x6e, 0x27, 0x01, 0x32, 0x54, 0xb3, 0x00];
        response[10] = crate::crc::crc5(&response[2..10]);
        uart.queue_rx(&response);

        let mut driver = Bm1370::new(Box::new(uart));
        let mut table = JobTable::new();
        let mut job = sample_job("a");
        job.version = 0x20000000;
        table.insert(0x18, job);

        let result = driver
            .process_work(&table, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.job_id, 0x18);
        assert_eq!(result.version, 0x2a966000);
    }

    #[tokio::test]
    async fn high_step_frequency_uses_wide_feedback_range() {
        let uart = MockUart::new();
        let mut driver = Bm1370::new(Box::new(uart.clone()));
        driver.frequency = 593.75;
        driver.set_frequency(600.0).await.unwrap();

        let sent = uart.sent();
        assert_eq!(
            *sent.last().unwrap(),
            vec![0x55, 0xaa, 0x51, 0x09, 0x00, 0x08, 0x50, 0xc0, 0x02, 0x30, 0x05]
        );
    }
}
