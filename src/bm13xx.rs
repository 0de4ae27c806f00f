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

//! Drivers for the BM13xx hash chip family. The wire protocol is shared
//! (see `frame`), the register map and job layout differ per chip, so
//! each model gets its own `ChipDriver` implementation while the
//! common command plumbing lives here.

pub mod bm1366;
pub mod bm1368;
pub mod bm1370;
pub mod bm1397;
pub mod pll;

use crate::error;
use crate::frame::{self, CmdCode, FrameError, FrameHeader};
use crate::io::{RecvStatus, Uart};
use crate::job::{Job, JobTable, NonceResult};
use crate::warn;

use async_trait::async_trait;

use std::time::Duration;

/// Registers common to the family
pub const CHIP_ID_REG: u8 = 0x00;
pub const PLL0_PARAMETER_REG: u8 = 0x08;
pub const TICKET_MASK_REG: u8 = 0x14;
pub const MISC_CONTROL_REG: u8 = 0x18;
pub const FAST_UART_REG: u8 = 0x28;
pub const CORE_REGISTER_CONTROL_REG: u8 = 0x3c;
pub const VERSION_ROLLING_REG: u8 = 0xa4;

/// Nonce responses from version-rolling chips carry a 16-bit rolled
/// version field; the BM1397 response is two bytes shorter.
pub const VERSIONED_RESPONSE_SIZE: usize = 11;
pub const BARE_RESPONSE_SIZE: usize = 9;

/// One decoded nonce response, before any per-model job-id surgery
#[derive(Debug, PartialEq)]
pub struct ChipResponse {
    pub nonce: u32,
    pub midstate_num: u8,
    pub job_id: u8,
    /// Rolled version bits, present on 11-byte responses only
    pub version: Option<u16>,
}

/// Capability set of one hash chip model. Object safe; the hub talks
/// to `Box<dyn ChipDriver>` and never matches on the model again.
#[async_trait]
pub trait ChipDriver: Send {
    /// Bring the chain up: reset, probe the number of chips, assign
    /// addresses, run the register init sequence and ramp the PLL to
    /// `frequency` MHz. Returns the number of chips detected.
    async fn init(
        &mut self,
        frequency: f64,
        expected_chips: usize,
        probe_timeout: Duration,
    ) -> error::Result<usize>;

    /// Chips detected by the last `init`
    fn chip_count(&self) -> usize;

    /// Small (nonce-counting) cores per chip
    fn small_core_count(&self) -> usize;

    /// How long one job keeps the chip busy before it needs fresh work
    fn job_interval(&self) -> Duration;

    /// Ticket mask difficulty the chip runs with
    fn default_difficulty(&self) -> usize;

    /// Switch the chip-side UART to its fastest rate. Returns the new
    /// baud rate the host side has to match.
    async fn set_max_baud(&mut self) -> error::Result<u32>;

    /// Program the ticket mask so the chip only reports nonces at or
    /// above `difficulty`
    async fn set_difficulty_mask(&mut self, difficulty: usize) -> error::Result<()>;

    /// Program the BIP320 version rolling mask
    async fn set_version_mask(&mut self, mask: u32) -> error::Result<()>;

    /// Serialize `job` into the model's wire layout, transmit it and
    /// install it into the table. Returns the chip job id used.
    async fn send_work(&mut self, table: &mut JobTable, job: Job) -> error::Result<u8>;

    /// Wait up to `timeout` for one nonce response. `Ok(None)` covers
    /// timeouts, malformed frames and stale job ids; the caller just
    /// polls again.
    async fn process_work(
        &mut self,
        table: &JobTable,
        timeout: Duration,
    ) -> error::Result<Option<NonceResult>>;

    /// Retune the PLL to `mhz`, ramping in steps
    async fn set_frequency(&mut self, mhz: f64) -> error::Result<()>;

    /// Version field for `mining.submit`: pools take the rolled bits
    /// as a delta against the job's base version, confined to the
    /// negotiated mask
    fn submit_version(&self, job: &Job, rolled_version: u32) -> u32 {
        rolled_version ^ job.version
    }
}

/// Driver instance for the configured chip model
pub fn make_driver(model: crate::config::ChipModel, uart: Box<dyn Uart>) -> Box<dyn ChipDriver> {
    match model {
        crate::config::ChipModel::Bm1397 => Box::new(bm1397::Bm1397::new(uart)),
        crate::config::ChipModel::Bm1366 => Box::new(bm1366::Bm1366::new(uart)),
        crate::config::ChipModel::Bm1368 => Box::new(bm1368::Bm1368::new(uart)),
        crate::config::ChipModel::Bm1370 => Box::new(bm1370::Bm1370::new(uart)),
    }
}

pub(crate) async fn send_cmd(
    uart: &mut dyn Uart,
    code: CmdCode,
    broadcast: bool,
    payload: &[u8],
) -> error::Result<()> {
    let bytes = frame::encode(FrameHeader::cmd(code, broadcast), payload)?;
    uart.send(&bytes).await
}

/// Broadcast register write; `payload` is `[chip, reg, d0, d1, d2, d3]`
pub(crate) async fn write_all(uart: &mut dyn Uart, payload: [u8; 6]) -> error::Result<()> {
    send_cmd(uart, CmdCode::Write, true, &payload).await
}

/// Register write addressed to a single chip
pub(crate) async fn write_one(uart: &mut dyn Uart, payload: [u8; 6]) -> error::Result<()> {
    send_cmd(uart, CmdCode::Write, false, &payload).await
}

pub(crate) async fn chain_inactive(uart: &mut dyn Uart) -> error::Result<()> {
    send_cmd(uart, CmdCode::Inactive, true, &[0x00, 0x00]).await
}

pub(crate) async fn set_chip_address(uart: &mut dyn Uart, address: u8) -> error::Result<()> {
    send_cmd(uart, CmdCode::SetAddress, false, &[address, 0x00]).await
}

pub(crate) async fn send_job(uart: &mut dyn Uart, payload: &[u8]) -> error::Result<()> {
    let bytes = frame::encode(FrameHeader::job(), payload)?;
    uart.send(&bytes).await
}

/// Count chips on the chain: broadcast a read of register 0 and count
/// replies until the first receive timeout. Every chip answers the
/// broadcast exactly once.
pub(crate) async fn probe_chips(
    uart: &mut dyn Uart,
    response_size: usize,
    timeout: Duration,
) -> error::Result<usize> {
    uart.clear()?;
    send_cmd(uart, CmdCode::Read, true, &[0x00, CHIP_ID_REG]).await?;

    let mut buf = vec![0u8; response_size];
    let mut count = 0;
    while uart.recv_exact(&mut buf, timeout).await? == RecvStatus::Full {
        count += 1;
    }
    uart.clear()?;
    Ok(count)
}

/// Address stride that spreads `chips` chips evenly over the 8-bit
/// address space. Rounded to a power of two so the per-chip nonce
/// subranges stay gap-free.
pub(crate) fn address_interval(chips: usize) -> usize {
    256 / chips.next_power_of_two()
}

/// Ticket mask payload for register 0x14. The difficulty is rounded
/// down to `2^k - 1` (a mask with a hole would drop valid shares) and
/// the hardware reads each mask byte LSB-first, hence the per-byte bit
/// reversal and the reversed byte placement.
pub(crate) fn ticket_mask_payload(difficulty: usize) -> [u8; 6] {
    let difficulty = difficulty.max(1);
    let floor = if difficulty.is_power_of_two() {
        difficulty
    } else {
        difficulty.next_power_of_two() >> 1
    };
    let mask = (floor - 1) as u32;

    let mut payload = [0u8; 6];
    payload[1] = TICKET_MASK_REG;
    for i in 0..4 {
        payload[5 - i] = (((mask >> (8 * i)) & 0xff) as u8).reverse_bits();
    }
    payload
}

/// Version rolling register payload: the mask is reported to the chip
/// shifted down by the BIP320 offset
pub(crate) fn version_mask_payload(mask: u32) -> [u8; 6] {
    let vtr = (mask >> 13) as u16;
    [
        0x00,
        VERSION_ROLLING_REG,
        0x90,
        0x00,
        (vtr >> 8) as u8,
        (vtr & 0xff) as u8,
    ]
}

fn parse_response(bytes: &[u8]) -> Result<ChipResponse, FrameError> {
    let payload = frame::check_response(bytes)?;
    let version = match payload.len() {
        6 => None,
        8 => Some(u16::from_be_bytes([payload[6], payload[7]])),
        _ => return Err(FrameError::LengthMismatch(payload.len(), 6)),
    };
    Ok(ChipResponse {
        nonce: u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]),
        midstate_num: payload[4],
        job_id: payload[5],
        version,
    })
}

/// Receive one response of `size` bytes. Timeouts and malformed frames
/// both come back as `Ok(None)`; partial reads and malformed frames
/// additionally flush the receive buffer to resynchronize the byte
/// stream.
pub(crate) async fn receive_response(
    uart: &mut dyn Uart,
    size: usize,
    timeout: Duration,
) -> error::Result<Option<ChipResponse>> {
    let mut buf = vec![0u8; size];
    match uart.recv_exact(&mut buf, timeout).await? {
        RecvStatus::Full => {}
        RecvStatus::Empty => return Ok(None),
        RecvStatus::Partial => {
            warn!("discarding partial nonce response");
            uart.clear()?;
            return Ok(None);
        }
    }
    match parse_response(&buf) {
        Ok(response) => Ok(Some(response)),
        Err(e) => {
            warn!("discarding malformed nonce response: {}", e);
            uart.clear()?;
            Ok(None)
        }
    }
}

/// Reconstruct the rolled block version from the 16 bits a chip
/// reports back alongside a nonce
pub(crate) fn rolled_version(base_version: u32, wire_version: u16) -> u32 {
    ((wire_version as u32) << 13) | base_version
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::io::test_utils::MockUart;

    #[test]
    fn ticket_mask_rounds_down() {
        // 256 is a power of two already
        assert_eq!(
            ticket_mask_payload(256),
            [0x00, 0x14, 0x00, 0x00, 0x00, 0xff]
        );
        // 512 shifts one bit into the third byte
        assert_eq!(
            ticket_mask_payload(512),
            [0x00, 0x14, 0x00, 0x00, 0x80, 0xff]
        );
        // a non-power-of-two rounds down, never up
        assert_eq!(
            ticket_mask_payload(300),
            [0x00, 0x14, 0x00, 0x00, 0x00, 0xff]
        );
        assert_eq!(ticket_mask_payload(1), [0x00, 0x14, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn version_mask_wire_form() {
        // full BIP320 mask, as captured from a live chain
        assert_eq!(
            version_mask_payload(0x1fffe000),
            [0x00, 0xa4, 0x90, 0x00, 0xff, 0xff]
        );
        assert_eq!(
            version_mask_payload(0x00006000),
            [0x00, 0xa4, 0x90, 0x00, 0x00, 0x03]
        );
    }

    #[test]
    fn address_interval_is_gap_free() {
        assert_eq!(address_interval(1), 256);
        assert_eq!(address_interval(2), 128);
        assert_eq!(address_interval(3), 64);
        assert_eq!(address_interval(4), 64);
        assert_eq!(address_interval(11), 16);
    }

    #[tokio::test]
    async fn probe_counts_until_timeout() {
        let mut uart = MockUart::new();
        // two chips answer the broadcast id read
        let reply = [
            0xaa, 0x55, 0x13, 0x66, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        uart.queue_rx(&reply);
        uart.queue_rx(&reply);

        let count = probe_chips(&mut uart, VERSIONED_RESPONSE_SIZE, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(count, 2);

        // probe request went out as a broadcast register 0 read
        assert_eq!(uart.sent()[0], vec![0x55, 0xaa, 0x52, 0x05, 0x00, 0x00, 0x0a]);
    }

    #[tokio::test]
    async fn response_decoding() {
        // 11-byte response: nonce, midstate_num, job_id, version, crc5
        let mut bytes = vec![0xaa, 0x55, 0x47, 0x89, 0x6e, 0x27, 0x01, 0x18, 0x54, 0xb3, 0x00];
        let crc = crate::crc::crc5(&bytes[2..10]);
        bytes[10] = crc;

        let mut uart = MockUart::new();
        uart.queue_rx(&bytes);
        let response = receive_response(
            &mut uart,
            VERSIONED_RESPONSE_SIZE,
            Duration::from_millis(10),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(response.nonce, 0x276e8947);
        assert_eq!(response.midstate_num, 0x01);
        assert_eq!(response.job_id, 0x18);
        assert_eq!(response.version, Some(0x54b3));
    }

    #[tokio::test]
    async fn malformed_response_is_flushed() {
        let mut uart = MockUart::new();
        let mut bytes = vec![0xaa, 0x55, 0x47, 0x89, 0x6e, 0x27, 0x01, 0x18, 0x54, 0xb3, 0x00];
        bytes[10] = crate::crc::crc5(&bytes[2..10]) ^ 0x01;
        uart.queue_rx(&bytes);

        let response = receive_response(
            &mut uart,
            VERSIONED_RESPONSE_SIZE,
            Duration::from_millis(10),
        )
        .await
        .unwrap();
        assert!(response.is_none());
        assert_eq!(uart.cleared(), 1);
    }

    #[tokio::test]
    async fn partial_response_is_flushed() {
        let mut uart = MockUart::new();
        // the deadline passes three bytes into a frame
        uart.queue_rx(&[0xaa, 0x55, 0x47]);

        let response = receive_response(
            &mut uart,
            VERSIONED_RESPONSE_SIZE,
            Duration::from_millis(10),
        )
        .await
        .unwrap();
        assert!(response.is_none());
        assert_eq!(uart.cleared(), 1);
    }

    #[tokio::test]
    async fn receive_timeout_is_not_an_error() {
        let mut uart = MockUart::new();
        let response = receive_response(
            &mut uart,
            VERSIONED_RESPONSE_SIZE,
            Duration::from_millis(1),
        )
        .await
        .unwrap();
        assert!(response.is_none());
    }

    #[test]
    fn version_reconstruction() {
        assert_eq!(rolled_version(0x20000000, 0x54b3), 0x2a966000);
        assert_eq!(rolled_version(0x20000004, 0x0000), 0x20000004);
    }
}
